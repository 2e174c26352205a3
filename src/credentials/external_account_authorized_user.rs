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

//! [Workforce identity federation] user credentials.
//!
//! These credentials represent a human user of an external identity
//! provider, holding a long-lived refresh token minted by the Security
//! Token Service. Each access token is obtained by a refresh-token grant
//! against the STS token endpoint, with the client id and secret from the
//! credentials file.
//!
//! [Workforce identity federation]: https://cloud.google.com/iam/docs/workforce-identity-federation

use crate::build_errors::Error as BuilderError;
use crate::constants::STS_TOKEN_URL;
use crate::credentials::internal::sts_exchange::{
    self, ClientAuthentication, RefreshAccessTokenRequest,
};
use crate::credentials::{BuildOptions, Credentials, CredentialsProvider};
use crate::headers_util::{build_bearer_headers, resolve_quota_project};
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use http::HeaderMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// A builder for `external_account_authorized_user` [Credentials].
///
/// # Example
/// ```
/// # use google_cloud_adc::credentials::external_account_authorized_user::Builder;
/// # tokio_test::block_on(async {
/// let config = serde_json::json!({ /* add details here */ });
/// let credentials = Builder::new(config).build();
/// })
/// ```
pub struct Builder {
    config: Value,
    options: BuildOptions,
}

impl Builder {
    /// Creates a new builder using an `external_account_authorized_user`
    /// JSON value, as written by
    /// `gcloud auth application-default login` for a workforce pool.
    pub fn new(config: Value) -> Self {
        Self {
            config,
            options: BuildOptions::default(),
        }
    }

    pub(crate) fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.options.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Returns [Credentials] with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the configuration cannot be
    /// deserialized into the expected format, typically because the JSON
    /// value is malformed or missing required fields.
    pub fn build(self) -> BuildResult<Credentials> {
        let config = serde_json::from_value::<ExternalAccountAuthorizedUser>(self.config)
            .map_err(BuilderError::parsing)?;
        let quota_project_id = resolve_quota_project(
            self.options.quota_project_id.clone(),
            config.quota_project_id.clone(),
        );
        let token_provider = ExternalAccountAuthorizedUserTokenProvider {
            token_url: config
                .token_url
                .unwrap_or_else(|| STS_TOKEN_URL.to_string()),
            authentication: ClientAuthentication {
                client_id: Some(config.client_id),
                client_secret: Some(config.client_secret),
            },
            refresh_token: config.refresh_token,
        };
        Ok(Credentials::from(ExternalAccountAuthorizedUserCredentials {
            token_provider: TokenCache::with_options(token_provider, self.options.refresh),
            quota_project_id,
        }))
    }
}

#[derive(Debug, serde::Deserialize)]
struct ExternalAccountAuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_url: Option<String>,
    quota_project_id: Option<String>,
}

struct ExternalAccountAuthorizedUserTokenProvider {
    token_url: String,
    authentication: ClientAuthentication,
    refresh_token: String,
}

impl std::fmt::Debug for ExternalAccountAuthorizedUserTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalAccountAuthorizedUserTokenProvider")
            .field("token_url", &self.token_url)
            .field("refresh_token", &"[censored]")
            .finish()
    }
}

#[async_trait::async_trait]
impl TokenProvider for ExternalAccountAuthorizedUserTokenProvider {
    async fn token(&self) -> Result<Token> {
        let response = sts_exchange::refresh_access_token(RefreshAccessTokenRequest {
            url: self.token_url.clone(),
            authentication: self.authentication.clone(),
            refresh_token: self.refresh_token.clone(),
        })
        .await?;
        Ok(Token {
            token: response.access_token,
            token_type: response.token_type,
            expires_at: response
                .expires_in
                .map(|d| Instant::now() + Duration::from_secs(d)),
            metadata: None,
        })
    }
}

#[derive(Debug)]
struct ExternalAccountAuthorizedUserCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
    quota_project_id: Option<String>,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for ExternalAccountAuthorizedUserCredentials<T>
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
}
