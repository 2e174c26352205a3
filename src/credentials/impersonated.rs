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

//! [Impersonated service account] credentials.
//!
//! When the principal you are using doesn't have the permissions you need,
//! or you want to use a service account in a development environment, you
//! can use service account impersonation. The impersonating principal
//! needs the [Service Account Token Creator role] on the target service
//! account.
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::impersonated::Builder;
//! # use std::time::Duration;
//! # tokio_test::block_on(async {
//! let impersonated = serde_json::json!({
//!     "type": "impersonated_service_account",
//!     "service_account_impersonation_url": "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/target-sa@my-project.iam.gserviceaccount.com:generateAccessToken",
//!     "source_credentials": {
//!         "type": "authorized_user",
//!         "client_id": "test-client-id",
//!         "client_secret": "test-client-secret",
//!         "refresh_token": "test-refresh-token"
//!     },
//! });
//! let credentials = Builder::new(impersonated)
//!     .with_lifetime(Duration::from_secs(500))
//!     .build()?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Impersonated service account]: https://cloud.google.com/docs/authentication/use-service-account-impersonation
//! [Service Account Token Creator role]: https://cloud.google.com/docs/authentication/use-service-account-impersonation#required-roles

use crate::build_errors::Error as BuilderError;
use crate::constants::DEFAULT_SCOPE;
use crate::credentials::{
    build_credentials_from_json, extract_credential_type, BuildOptions, Credentials,
    CredentialsProvider,
};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::headers_util::{build_bearer_headers, resolve_quota_project};
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use http::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

enum BuilderSource {
    FromJson(Value),
    FromCredentials(Credentials),
}

/// A builder for impersonated service account [Credentials].
///
/// # Example
/// ```
/// # use google_cloud_adc::credentials::impersonated::Builder;
/// # use google_cloud_adc::credentials::user_account;
/// # tokio_test::block_on(async {
/// let source = user_account::Builder::new(serde_json::json!({
///     "type": "authorized_user",
///     "client_id": "test-client-id",
///     "client_secret": "test-client-secret",
///     "refresh_token": "test-refresh-token",
/// })).build()?;
/// let credentials = Builder::from_source_credentials(source)
///     .with_target_principal("target-sa@my-project.iam.gserviceaccount.com")
///     .build()?;
/// # Ok::<(), anyhow::Error>(())
/// # });
/// ```
pub struct Builder {
    source: BuilderSource,
    service_account_impersonation_url: Option<String>,
    delegates: Option<Vec<String>>,
    lifetime: Option<Duration>,
    options: BuildOptions,
}

impl Builder {
    /// Creates a new builder using an `impersonated_service_account` JSON
    /// value, typically generated with
    /// `gcloud auth application-default login --impersonate-service-account`.
    pub fn new(impersonated_credential: Value) -> Self {
        Self {
            source: BuilderSource::FromJson(impersonated_credential),
            service_account_impersonation_url: None,
            delegates: None,
            lifetime: None,
            options: BuildOptions::default(),
        }
    }

    /// Creates a new builder from already-built source credentials.
    pub fn from_source_credentials(source_credentials: Credentials) -> Self {
        Self {
            source: BuilderSource::FromCredentials(source_credentials),
            service_account_impersonation_url: None,
            delegates: None,
            lifetime: None,
            options: BuildOptions::default(),
        }
    }

    pub(crate) fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the target principal, the email of the service account to
    /// impersonate. Required when building from source credentials.
    pub fn with_target_principal<S: Into<String>>(mut self, target_principal: S) -> Self {
        self.service_account_impersonation_url = Some(format!(
            "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{}:generateAccessToken",
            target_principal.into()
        ));
        self
    }

    /// Sets the chain of [delegates].
    ///
    /// [delegates]: https://cloud.google.com/iam/docs/create-short-lived-credentials-delegated
    pub fn with_delegates<I, S>(mut self, delegates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delegates = Some(delegates.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [scopes] requested for the impersonated token.
    ///
    /// Defaults to `https://www.googleapis.com/auth/cloud-platform`.
    ///
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.options.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the lifetime of the impersonated token. Defaults to one hour.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Returns [Credentials] with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] when the JSON is malformed, when its
    /// `source_credentials` are themselves of type
    /// `impersonated_service_account` (delegation chains use the
    /// `delegates` field instead of nesting), or when no impersonation
    /// target was configured.
    pub fn build(self) -> BuildResult<Credentials> {
        let (source_credentials, url, config_delegates, config_quota, config_scopes) =
            match self.source {
                BuilderSource::FromJson(json) => {
                    let config = serde_json::from_value::<ImpersonatedConfig>(json)
                        .map_err(BuilderError::parsing)?;
                    let source_type = extract_credential_type(&config.source_credentials)?;
                    if source_type == "impersonated_service_account" {
                        return Err(BuilderError::unknown_type(
                            "nested `impersonated_service_account` source credentials are not supported; use the `delegates` field to specify a delegation chain",
                        ));
                    }
                    // The source credentials authenticate to IAM only;
                    // they do not inherit the outward scopes or quota.
                    let source = build_credentials_from_json(
                        config.source_credentials,
                        &BuildOptions::default(),
                    )?;
                    (
                        source,
                        self.service_account_impersonation_url
                            .unwrap_or(config.service_account_impersonation_url),
                        config.delegates,
                        config.quota_project_id,
                        config.scopes,
                    )
                }
                BuilderSource::FromCredentials(source) => {
                    let url = self.service_account_impersonation_url.ok_or_else(|| {
                        BuilderError::missing_field("service_account_impersonation_url")
                    })?;
                    (source, url, None, None, None)
                }
            };

        let scopes = self
            .options
            .effective_scopes()
            .or(config_scopes)
            .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);
        let quota_project_id =
            resolve_quota_project(self.options.quota_project_id.clone(), config_quota);
        let delegates = self.delegates.or(config_delegates);
        let target_principal = target_principal_from_url(&url);

        let token_provider = ImpersonatedTokenProvider {
            source_credentials: source_credentials.clone(),
            service_account_impersonation_url: url,
            delegates,
            scopes,
            lifetime: self.lifetime.unwrap_or(DEFAULT_LIFETIME),
        };
        Ok(Credentials::from(ImpersonatedCredentials {
            token_provider: TokenCache::with_options(token_provider, self.options.refresh),
            quota_project_id,
            source_credentials,
            target_principal,
        }))
    }
}

/// Extracts the service account email from an IAM Credentials URL of the
/// form `.../serviceAccounts/<email>:generateAccessToken`.
fn target_principal_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("/serviceAccounts/")?;
    let email = rest.split(':').next()?;
    if email.contains('@') {
        Some(email.to_string())
    } else {
        None
    }
}

#[derive(Debug, serde::Deserialize)]
struct ImpersonatedConfig {
    service_account_impersonation_url: String,
    source_credentials: Value,
    delegates: Option<Vec<String>>,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
}

#[derive(Debug)]
struct ImpersonatedCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
    quota_project_id: Option<String>,
    source_credentials: Credentials,
    target_principal: Option<String>,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for ImpersonatedCredentials<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        self.token_provider.token().await
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.token().await?;
        build_bearer_headers(&token, &self.quota_project_id)
    }

    async fn project_id(&self) -> Result<Option<String>> {
        // The project is embedded in the target principal's email,
        // `<name>@<project>.iam.gserviceaccount.com`.
        Ok(self
            .target_principal
            .as_deref()
            .and_then(|email| email.split_once('@'))
            .and_then(|(_, domain)| domain.split('.').next())
            .map(str::to_string))
    }

    async fn service_account_email(&self) -> Option<String> {
        self.target_principal.clone()
    }

    fn signing_credentials(&self) -> Option<Credentials> {
        // Remote signing is authorized with the source credentials, like
        // the token minting itself.
        Some(self.source_credentials.clone())
    }
}

#[derive(Debug)]
struct ImpersonatedTokenProvider {
    source_credentials: Credentials,
    service_account_impersonation_url: String,
    delegates: Option<Vec<String>>,
    scopes: Vec<String>,
    lifetime: Duration,
}

#[async_trait::async_trait]
impl TokenProvider for ImpersonatedTokenProvider {
    async fn token(&self) -> Result<Token> {
        let source_headers = self.source_credentials.headers().await?;
        generate_access_token(
            source_headers,
            self.delegates.clone(),
            self.scopes.clone(),
            Some(self.lifetime),
            &self.service_account_impersonation_url,
        )
        .await
    }
}

#[derive(serde::Serialize)]
struct GenerateAccessTokenRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<Vec<String>>,
    scope: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lifetime: Option<String>,
}

#[derive(serde::Deserialize)]
struct GenerateAccessTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expireTime")]
    expire_time: String,
}

/// Mints an access token via the IAM Credentials `generateAccessToken`
/// endpoint, authorized with `source_headers`.
pub(crate) async fn generate_access_token(
    source_headers: HeaderMap,
    delegates: Option<Vec<String>>,
    scopes: Vec<String>,
    lifetime: Option<Duration>,
    service_account_impersonation_url: &str,
) -> Result<Token> {
    let client = Client::new();
    let body = GenerateAccessTokenRequest {
        delegates,
        scope: scopes,
        lifetime: lifetime.map(|l| format!("{}s", l.as_secs())),
    };
    let response = client
        .post(service_account_impersonation_url)
        .headers(source_headers)
        .json(&body)
        .send()
        .await
        .map_err(errors::retryable)?;

    if !response.status().is_success() {
        return Err(errors::from_http_response(response, "failed to mint an impersonated token").await);
    }
    let response = response
        .json::<GenerateAccessTokenResponse>()
        .await
        .map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, ErrorKind::TokenRefresh, e)
        })?;

    let expire_time = OffsetDateTime::parse(
        &response.expire_time,
        &time::format_description::well_known::Rfc3339,
    )
    .map_err(errors::non_retryable)?;
    let remaining = expire_time - OffsetDateTime::now_utc();
    let expires_at = remaining
        .try_into()
        .ok()
        .map(|d: Duration| Instant::now() + d);

    Ok(Token {
        token: response.access_token,
        token_type: "Bearer".to_string(),
        expires_at,
        metadata: None,
    })
}
