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

//! [User Account] Credentials type.
//!
//! User accounts represent a developer, administrator, or any other person
//! who interacts with Google APIs and services.
//!
//! This module provides [Credentials] derived from user account
//! information, specifically utilizing an OAuth 2.0 refresh token. The
//! refresh token is typically created by running
//! `gcloud auth application-default login`, and found automatically by the
//! [Application Default Credentials] lookup. Use the [Builder] directly to
//! load credentials from a non-standard location, or to override the
//! requested scopes, the quota project, or the token endpoint.
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::user_account::Builder;
//! # tokio_test::block_on(async {
//! let authorized_user = serde_json::json!({
//!     "type": "authorized_user",
//!     "client_id": "YOUR_CLIENT_ID.apps.googleusercontent.com",
//!     "client_secret": "YOUR_CLIENT_SECRET",
//!     "refresh_token": "YOUR_REFRESH_TOKEN",
//! });
//! let credentials = Builder::new(authorized_user).build()?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
//! [User Account]: https://cloud.google.com/docs/authentication#user-accounts

use crate::build_errors::Error as BuilderError;
use crate::constants::OAUTH2_TOKEN_SERVER_URL;
use crate::credentials::{BuildOptions, Credentials, CredentialsProvider};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::headers_util::{build_bearer_headers, resolve_quota_project};
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use http::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// A builder for `authorized_user` [Credentials].
///
/// # Example
/// ```
/// # use google_cloud_adc::credentials::user_account::Builder;
/// # tokio_test::block_on(async {
/// let authorized_user = serde_json::json!({ /* add details here */ });
/// let credentials = Builder::new(authorized_user).build();
/// })
/// ```
pub struct Builder {
    authorized_user: Value,
    token_uri: Option<String>,
    options: BuildOptions,
}

impl Builder {
    /// Creates a new builder using an `authorized_user` JSON value.
    ///
    /// The JSON is typically generated by the [application-default login]
    /// process.
    ///
    /// [application-default login]: https://cloud.google.com/sdk/gcloud/reference/auth/application-default/login
    pub fn new(authorized_user: Value) -> Self {
        Self {
            authorized_user,
            token_uri: None,
            options: BuildOptions::default(),
        }
    }

    pub(crate) fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the token endpoint used to fetch access tokens.
    ///
    /// A value set here wins over a `token_uri` field in the
    /// `authorized_user` JSON. Defaults to
    /// `https://oauth2.googleapis.com/token`.
    pub fn with_token_uri<S: Into<String>>(mut self, token_uri: S) -> Self {
        self.token_uri = Some(token_uri.into());
        self
    }

    /// Sets the [scopes] requested for the minted tokens.
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
    /// A value set here wins over the `GOOGLE_CLOUD_QUOTA_PROJECT`
    /// environment variable and over a `quota_project_id` field in the
    /// `authorized_user` JSON.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.options.quota_project_id = Some(quota_project_id.into());
        self
    }

    pub(crate) fn build_token_provider(self) -> BuildResult<UserTokenProvider> {
        let authorized_user = serde_json::from_value::<AuthorizedUser>(self.authorized_user)
            .map_err(BuilderError::parsing)?;
        let endpoint = self
            .token_uri
            .or(authorized_user.token_uri)
            .unwrap_or_else(|| OAUTH2_TOKEN_SERVER_URL.to_string());
        Ok(UserTokenProvider {
            client_id: authorized_user.client_id,
            client_secret: authorized_user.client_secret,
            refresh_token: authorized_user.refresh_token,
            endpoint,
            scopes: self
                .options
                .effective_scopes()
                .map(|scopes| scopes.join(" ")),
            target_audience: None,
        })
    }

    /// Returns [Credentials] with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] if the `authorized_user` provided to
    /// [Builder::new] cannot be deserialized into the expected format,
    /// typically because the JSON value is malformed or missing required
    /// fields.
    pub fn build(self) -> BuildResult<Credentials> {
        let quota_project_id = resolve_quota_project(
            self.options.quota_project_id.clone(),
            self.authorized_user
                .get("quota_project_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        );
        let refresh = self.options.refresh;
        let token_provider = self.build_token_provider()?;
        Ok(Credentials::from(UserCredentials {
            token_provider: TokenCache::with_options(token_provider, refresh),
            quota_project_id,
        }))
    }
}

#[derive(PartialEq)]
pub(crate) struct UserTokenProvider {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    endpoint: String,
    scopes: Option<String>,
    // Set by the ID token flow; the response then carries an `id_token`.
    target_audience: Option<String>,
}

impl UserTokenProvider {
    pub(crate) fn with_target_audience(mut self, target_audience: String) -> Self {
        self.target_audience = Some(target_audience);
        self
    }
}

impl std::fmt::Debug for UserTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTokenProvider")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[censored]")
            .field("refresh_token", &"[censored]")
            .field("endpoint", &self.endpoint)
            .field("scopes", &self.scopes)
            .field("target_audience", &self.target_audience)
            .finish()
    }
}

#[async_trait::async_trait]
impl TokenProvider for UserTokenProvider {
    async fn token(&self) -> Result<Token> {
        let client = Client::new();
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("refresh_token", self.refresh_token.clone()),
        ];
        if let Some(scopes) = &self.scopes {
            form.push(("scope", scopes.clone()));
        }
        if let Some(target_audience) = &self.target_audience {
            form.push(("target_audience", target_audience.clone()));
        }
        let resp = client
            .post(self.endpoint.as_str())
            .form(&form)
            .send()
            .await
            .map_err(errors::retryable)?;

        if !resp.status().is_success() {
            return Err(errors::from_http_response(resp, "failed to refresh the access token").await);
        }
        let response = resp.json::<Oauth2RefreshResponse>().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, ErrorKind::TokenRefresh, e)
        })?;
        let expires_at = response
            .expires_in
            .map(|d| Instant::now() + Duration::from_secs(d));
        if self.target_audience.is_some() {
            let id_token = response.id_token.ok_or_else(|| {
                CredentialsError::from_str(
                    false,
                    ErrorKind::TokenRefresh,
                    "the token endpoint did not return an `id_token`",
                )
            })?;
            return Ok(Token {
                token: id_token,
                token_type: "Bearer".to_string(),
                expires_at,
                metadata: None,
            });
        }
        Ok(Token {
            token: response.access_token,
            token_type: response.token_type,
            expires_at,
            metadata: None,
        })
    }
}

/// Data model for user credentials.
///
/// See: <https://cloud.google.com/docs/authentication#user-accounts>
#[derive(Debug)]
pub(crate) struct UserCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
    quota_project_id: Option<String>,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for UserCredentials<T>
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

#[derive(Debug, PartialEq, serde::Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: Option<String>,
    quota_project_id: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct Oauth2RefreshResponse {
    #[serde(default)]
    access_token: String,
    expires_in: Option<u64>,
    #[serde(default = "default_token_type")]
    token_type: String,
    id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers_util::QUOTA_PROJECT_KEY;
    use crate::token::tests::MockTokenProvider;
    use http::header::AUTHORIZATION;
    use http::HeaderValue;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn authorized_user_json() -> Value {
        json!({
            "type": "authorized_user",
            "client_id": "test-client-id",
            "client_secret": "test-client-secret",
            "refresh_token": "test-refresh-token",
        })
    }

    #[test]
    fn debug_censors_secrets() {
        let tp = UserTokenProvider {
            client_id: "test-client-id".to_string(),
            client_secret: "test-client-secret".to_string(),
            refresh_token: "test-refresh-token".to_string(),
            endpoint: OAUTH2_TOKEN_SERVER_URL.to_string(),
            scopes: None,
            target_audience: None,
        };
        let fmt = format!("{tp:?}");
        assert!(fmt.contains("test-client-id"), "{fmt}");
        assert!(!fmt.contains("test-client-secret"), "{fmt}");
        assert!(!fmt.contains("test-refresh-token"), "{fmt}");
    }

    #[test]
    fn missing_required_fields_fail() {
        for field in ["client_id", "client_secret", "refresh_token"] {
            let mut json = authorized_user_json();
            json.as_object_mut().unwrap().remove(field);
            let e = Builder::new(json).build().unwrap_err();
            assert!(e.is_parsing(), "{field}: {e:?}");
        }
    }

    #[tokio::test]
    async fn refresh_flow() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("grant_type", "refresh_token")))),
                request::body(url_decoded(contains(("client_id", "test-client-id")))),
                request::body(url_decoded(contains((
                    "client_secret",
                    "test-client-secret"
                )))),
                request::body(url_decoded(contains((
                    "refresh_token",
                    "test-refresh-token"
                )))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "a-user-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );

        let creds = Builder::new(authorized_user_json())
            .with_token_uri(server.url_str("/token"))
            .build()?;
        let token = creds.token().await?;
        assert_eq!(token.token, "a-user-token");
        assert_eq!(token.token_type, "Bearer");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_flow_passes_scopes() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains(("scope", "scope1 scope2")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "a-user-token",
                "token_type": "Bearer",
            }))),
        );

        let creds = Builder::new(authorized_user_json())
            .with_token_uri(server.url_str("/token"))
            .with_scopes(["scope1", "scope2"])
            .build()?;
        let token = creds.token().await?;
        assert_eq!(token.token, "a-user-token");
        assert_eq!(token.expires_at, None);
        Ok(())
    }

    #[tokio::test]
    async fn id_token_flow_sends_target_audience() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(url_decoded(contains((
                    "target_audience",
                    "https://service.example.com"
                )))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "unused",
                "id_token": "an-id-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );

        let tp = Builder::new(authorized_user_json())
            .with_token_uri(server.url_str("/token"))
            .build_token_provider()?
            .with_target_audience("https://service.example.com".to_string());
        let token = tp.token().await?;
        assert_eq!(token.token, "an-id-token");
        Ok(())
    }

    #[tokio::test]
    async fn refresh_failure_includes_body() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .respond_with(status_code(400).body("invalid_grant")),
        );

        let creds = Builder::new(authorized_user_json())
            .with_token_uri(server.url_str("/token"))
            .build()?;
        let err = creds.token().await.err().unwrap();
        assert!(!err.is_transient(), "{err:?}");
        assert_eq!(err.kind(), ErrorKind::TokenRefresh);
        assert!(err.to_string().contains("invalid_grant"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn headers_with_file_quota_project() -> TestResult {
        let token = Token {
            token: "test-token".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            metadata: None,
        };
        let mut mock = MockTokenProvider::new();
        mock.expect_token().times(1).return_once(|| Ok(token));

        let uc = UserCredentials {
            token_provider: mock,
            quota_project_id: Some("test-quota-project".to_string()),
        };
        let headers = uc.headers().await.unwrap();
        assert_eq!(
            headers.get(AUTHORIZATION).unwrap(),
            HeaderValue::from_static("Bearer test-token")
        );
        assert_eq!(
            headers
                .get(http::HeaderName::from_static(QUOTA_PROJECT_KEY))
                .unwrap(),
            HeaderValue::from_static("test-quota-project")
        );
        Ok(())
    }

    #[tokio::test]
    async fn headers_without_quota_project() -> TestResult {
        let token = Token {
            token: "test-token".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: None,
            metadata: None,
        };
        let mut mock = MockTokenProvider::new();
        mock.expect_token().times(1).return_once(|| Ok(token));

        let uc = UserCredentials {
            token_provider: mock,
            quota_project_id: None,
        };
        let headers = uc.headers().await.unwrap();
        assert_eq!(headers.len(), 1, "{headers:?}");
        Ok(())
    }
}
