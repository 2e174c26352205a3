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

//! OIDC [ID token] credentials.
//!
//! ID tokens verify the identity of a principal towards a specific
//! audience, typically another service, as in Cloud Run service-to-service
//! calls or behind Identity-Aware Proxy. Unlike access tokens they do not
//! authorize API access.
//!
//! The [Builder] wraps the credential found by the [Application Default
//! Credentials] lookup, or a credential JSON supplied directly, into
//! credentials whose bearer token is an ID token for the configured
//! audience. Service account keys mint the token through a signed
//! assertion; user accounts through the refresh grant; the metadata
//! service through its identity endpoint; impersonated service accounts
//! through IAM's `generateIdToken`. External account credentials cannot
//! mint ID tokens.
//!
//! # Example
//! ```no_run
//! # use google_cloud_adc::credentials::idtoken::Builder;
//! # tokio_test::block_on(async {
//! let credentials = Builder::new("https://my-service.example.com").build()?;
//! let token = credentials.token().await?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
//! [ID token]: https://cloud.google.com/docs/authentication/token-types#identity-tokens

use crate::build_errors::Error as BuilderError;
use crate::constants::{JWT_BEARER_GRANT_TYPE, OAUTH2_TOKEN_SERVER_URL};
use crate::credentials::jws::{JwsClaims, JwsHeader, CLOCK_SKEW_FUDGE, DEFAULT_TOKEN_TIMEOUT};
use crate::credentials::service_account::ServiceAccountKey;
use crate::credentials::user_account;
use crate::credentials::{
    extract_credential_type, load_adc, mds, AdcContents, Credentials, CredentialsProvider,
};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::headers_util::build_bearer_headers;
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use http::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

/// A builder for ID token [Credentials].
///
/// The credentials produce `Authorization: Bearer <id_token>` headers for
/// the configured target audience.
pub struct Builder {
    target_audience: String,
    credentials_json: Option<Value>,
    token_uri: Option<String>,
}

impl Builder {
    /// Creates a new builder for the given target audience, typically the
    /// URL of the service that receives the token.
    ///
    /// The underlying credential is found with the [Application Default
    /// Credentials] lookup.
    ///
    /// [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
    pub fn new<S: Into<String>>(target_audience: S) -> Self {
        Self {
            target_audience: target_audience.into(),
            credentials_json: None,
            token_uri: None,
        }
    }

    /// Uses the given credentials JSON instead of the environment lookup.
    pub fn with_credentials_json(mut self, credentials_json: Value) -> Self {
        self.credentials_json = Some(credentials_json);
        self
    }

    /// Overrides the OAuth2 token endpoint used by the service account and
    /// user account flows.
    pub fn with_token_uri<S: Into<String>>(mut self, token_uri: S) -> Self {
        self.token_uri = Some(token_uri.into());
        self
    }

    /// Returns ID token [Credentials] with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] when no credentials are found, when they
    /// cannot be parsed, or when the resolved credential type cannot mint
    /// ID tokens (external accounts).
    pub fn build(self) -> BuildResult<Credentials> {
        let provider = match &self.credentials_json {
            Some(json) => self.provider_from_json(json.clone())?,
            None => match load_adc()? {
                AdcContents::Contents(contents) => {
                    let json =
                        serde_json::from_str(&contents).map_err(BuilderError::parsing)?;
                    self.provider_from_json(json)?
                }
                AdcContents::FallbackToMds => IdTokenProvider::Mds {
                    endpoint: mds::default_endpoint(),
                    audience: self.target_audience.clone(),
                },
            },
        };
        Ok(Credentials::from(IdTokenCredentials {
            token_provider: TokenCache::new(provider),
        }))
    }

    fn provider_from_json(&self, json: Value) -> BuildResult<IdTokenProvider> {
        match extract_credential_type(&json)? {
            "service_account" => {
                let key = serde_json::from_value::<ServiceAccountKey>(json)
                    .map_err(BuilderError::parsing)?;
                Ok(IdTokenProvider::ServiceAccount(
                    ServiceAccountIdTokenProvider {
                        key,
                        target_audience: self.target_audience.clone(),
                        token_uri: self
                            .token_uri
                            .clone()
                            .unwrap_or_else(|| OAUTH2_TOKEN_SERVER_URL.to_string()),
                    },
                ))
            }
            "authorized_user" => {
                let mut builder = user_account::Builder::new(json);
                if let Some(token_uri) = &self.token_uri {
                    builder = builder.with_token_uri(token_uri.clone());
                }
                let provider = builder
                    .build_token_provider()?
                    .with_target_audience(self.target_audience.clone());
                Ok(IdTokenProvider::UserAccount(provider))
            }
            "impersonated_service_account" => {
                let config = serde_json::from_value::<ImpersonatedIdTokenConfig>(json)
                    .map_err(BuilderError::parsing)?;
                let source = crate::credentials::build_credentials_from_json(
                    config.source_credentials,
                    &Default::default(),
                )?;
                Ok(IdTokenProvider::Impersonated(ImpersonatedIdTokenProvider {
                    source_credentials: source,
                    generate_id_token_url: config
                        .service_account_impersonation_url
                        .replace(":generateAccessToken", ":generateIdToken"),
                    delegates: config.delegates,
                    audience: self.target_audience.clone(),
                }))
            }
            t @ ("external_account" | "external_account_authorized_user") => Err(
                BuilderError::not_supported(format!("`{t}` credentials cannot mint ID tokens")),
            ),
            unknown => Err(BuilderError::unknown_type(format!(
                "Invalid or unsupported credentials type found in JSON: `{unknown}`"
            ))),
        }
    }
}

/// Reads the `exp` claim of an unverified JWT to seed the cache expiry.
fn decode_jwt_expiry(token: &str) -> Option<Instant> {
    let claims = token.split('.').nth(1)?;
    let decoded = BASE64_URL_SAFE_NO_PAD.decode(claims).ok()?;
    let json: Value = serde_json::from_slice(&decoded).ok()?;
    let exp = json.get("exp")?.as_i64()?;
    let remaining = exp - OffsetDateTime::now_utc().unix_timestamp();
    let remaining: u64 = remaining.try_into().ok()?;
    Some(Instant::now() + Duration::from_secs(remaining))
}

#[derive(Debug)]
struct IdTokenCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for IdTokenCredentials<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        self.token_provider.token().await
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.token().await?;
        build_bearer_headers(&token, &None)
    }
}

#[derive(Debug)]
enum IdTokenProvider {
    ServiceAccount(ServiceAccountIdTokenProvider),
    UserAccount(user_account::UserTokenProvider),
    Mds { endpoint: String, audience: String },
    Impersonated(ImpersonatedIdTokenProvider),
}

#[async_trait::async_trait]
impl TokenProvider for IdTokenProvider {
    async fn token(&self) -> Result<Token> {
        match self {
            IdTokenProvider::ServiceAccount(provider) => provider.token().await,
            IdTokenProvider::UserAccount(provider) => provider.token().await,
            IdTokenProvider::Mds { endpoint, audience } => {
                let id_token = mds::fetch_identity_token(endpoint, audience).await?;
                Ok(Token {
                    expires_at: decode_jwt_expiry(&id_token),
                    token: id_token,
                    token_type: "Bearer".to_string(),
                    metadata: None,
                })
            }
            IdTokenProvider::Impersonated(provider) => provider.token().await,
        }
    }
}

#[derive(Debug)]
struct ServiceAccountIdTokenProvider {
    key: ServiceAccountKey,
    target_audience: String,
    token_uri: String,
}

#[derive(Debug, serde::Deserialize)]
struct IdTokenResponse {
    id_token: String,
}

#[async_trait::async_trait]
impl TokenProvider for ServiceAccountIdTokenProvider {
    async fn token(&self) -> Result<Token> {
        let now = OffsetDateTime::now_utc();
        let claims = JwsClaims {
            iss: self.key.client_email.clone(),
            scope: None,
            aud: Some(self.token_uri.clone()),
            target_audience: Some(self.target_audience.clone()),
            iat: now - CLOCK_SKEW_FUDGE,
            exp: now + CLOCK_SKEW_FUDGE + DEFAULT_TOKEN_TIMEOUT,
            sub: Some(self.key.client_email.clone()),
        };
        let header = JwsHeader {
            alg: "RS256",
            typ: "JWT",
            kid: &self.key.private_key_id,
        };
        let assertion = self.key.sign_assertion(&header, &claims)?;

        let client = Client::new();
        let response = client
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(errors::retryable)?;
        if !response.status().is_success() {
            return Err(errors::from_http_response(response, "failed to mint an ID token").await);
        }
        let response = response.json::<IdTokenResponse>().await.map_err(|e| {
            let retryable = !e.is_decode();
            CredentialsError::new(retryable, ErrorKind::TokenRefresh, e)
        })?;
        Ok(Token {
            expires_at: decode_jwt_expiry(&response.id_token),
            token: response.id_token,
            token_type: "Bearer".to_string(),
            metadata: None,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct ImpersonatedIdTokenConfig {
    service_account_impersonation_url: String,
    source_credentials: Value,
    delegates: Option<Vec<String>>,
}

#[derive(Debug)]
struct ImpersonatedIdTokenProvider {
    source_credentials: Credentials,
    generate_id_token_url: String,
    delegates: Option<Vec<String>>,
    audience: String,
}

#[derive(serde::Serialize)]
struct GenerateIdTokenRequest {
    audience: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    delegates: Option<Vec<String>>,
    #[serde(rename = "includeEmail")]
    include_email: bool,
}

#[derive(serde::Deserialize)]
struct GenerateIdTokenResponse {
    token: String,
}

#[async_trait::async_trait]
impl TokenProvider for ImpersonatedIdTokenProvider {
    async fn token(&self) -> Result<Token> {
        let source_headers = self.source_credentials.headers().await?;
        let client = Client::new();
        let body = GenerateIdTokenRequest {
            audience: self.audience.clone(),
            delegates: self.delegates.clone(),
            include_email: true,
        };
        let response = client
            .post(&self.generate_id_token_url)
            .headers(source_headers)
            .json(&body)
            .send()
            .await
            .map_err(errors::retryable)?;
        if !response.status().is_success() {
            return Err(errors::from_http_response(response, "failed to mint an ID token").await);
        }
        let response = response
            .json::<GenerateIdTokenResponse>()
            .await
            .map_err(|e| {
                let retryable = !e.is_decode();
                CredentialsError::new(retryable, ErrorKind::TokenRefresh, e)
            })?;
        Ok(Token {
            expires_at: decode_jwt_expiry(&response.token),
            token: response.token,
            token_type: "Bearer".to_string(),
            metadata: None,
        })
    }
}
