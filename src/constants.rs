// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub(crate) const DEFAULT_UNIVERSE_DOMAIN: &str = "googleapis.com";
pub(crate) const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

pub(crate) const OAUTH2_TOKEN_SERVER_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";

/// JWT Bearer OAuth Grant Type
pub(crate) const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Token Exchange OAuth Grant Type
pub(crate) const TOKEN_EXCHANGE_GRANT_TYPE: &str =
    "urn:ietf:params:oauth:grant-type:token-exchange";
/// Access Token OAuth Token Type
pub(crate) const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
/// JWT OAuth Token Type
pub(crate) const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
/// SAML2 Token OAuth Token Type
pub(crate) const SAML2_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:saml2";

/// Environment variables consumed during credential discovery.
pub(crate) const ADC_PATH_VAR: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub(crate) const ADC_PATH_VAR_LOWER: &str = "google_application_credentials";
pub(crate) const QUOTA_PROJECT_VAR: &str = "GOOGLE_CLOUD_QUOTA_PROJECT";
pub(crate) const NO_GCE_CHECK_VAR: &str = "NO_GCE_CHECK";
pub(crate) const GCE_METADATA_HOST_VAR: &str = "GCE_METADATA_HOST";

/// Default window before expiration in which a cached token is refreshed
/// instead of served.
pub(crate) const DEFAULT_EAGER_REFRESH_WINDOW: std::time::Duration =
    std::time::Duration::from_secs(300);

pub(crate) const ADC_NOT_FOUND_MSG: &str = concat!(
    "Could not find Application Default Credentials. ",
    "Set the GOOGLE_APPLICATION_CREDENTIALS environment variable, run ",
    "`gcloud auth application-default login`, or deploy to an environment ",
    "with an attached service account. See ",
    "https://cloud.google.com/docs/authentication/application-default-credentials ",
    "for more information."
);
