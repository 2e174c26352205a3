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

//! The user-visible entry point of this crate.
//!
//! An [Authenticator] resolves credentials once, caches them, and serves
//! fresh request headers, access tokens, ID tokens, signatures, and the
//! project id on demand. Most applications create one authenticator and
//! share it.
//!
//! # Example
//! ```no_run
//! # use google_cloud_adc::authenticator::Authenticator;
//! # tokio_test::block_on(async {
//! let auth = Authenticator::builder()
//!     .with_scopes(["https://www.googleapis.com/auth/devstorage.read_only"])
//!     .build()?;
//! let project = auth.project_id().await?;
//! let headers = auth.headers().await?;
//! println!("project={project}, headers={headers:?}");
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```

use crate::build_errors::Error as BuilderError;
use crate::constants::DEFAULT_UNIVERSE_DOMAIN;
use crate::credentials::{self, api_key, idtoken, BuildOptions, Credentials};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::project_id;
use crate::signer::{Signer, SigningError};
use crate::{BuildResult, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use http::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// A builder for [Authenticator] instances.
#[derive(Debug, Default)]
pub struct Builder {
    credentials_json: Option<Value>,
    key_file: Option<String>,
    prebuilt_credentials: Option<Credentials>,
    api_key: Option<String>,
    project_id: Option<String>,
    options: BuildOptions,
    iam_credentials_uri: Option<String>,
}

impl Builder {
    /// Uses the given credentials JSON instead of searching the
    /// environment.
    pub fn with_credentials_json(mut self, credentials_json: Value) -> Self {
        self.credentials_json = Some(credentials_json);
        self
    }

    /// Loads credentials from the given file instead of searching the
    /// environment.
    pub fn with_key_file<S: Into<String>>(mut self, key_file: S) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    /// Uses already-built credentials, skipping resolution entirely.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.prebuilt_credentials = Some(credentials);
        self
    }

    /// Authenticates with an API key instead of a principal.
    ///
    /// Mutually exclusive with every credentials source.
    pub fn with_api_key<S: Into<String>>(mut self, api_key: S) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the [scopes] requested for minted tokens. Scopes set here
    /// shadow any [default scopes][Builder::with_default_scopes].
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

    /// Sets the fallback scopes used when no user scopes are configured.
    /// Client libraries set these to the scopes their service needs.
    pub fn with_default_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.default_scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the project id, bypassing detection.
    pub fn with_project_id<S: Into<String>>(mut self, project_id: S) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Sets the [quota project] for the resolved credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.options.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Sets the universe domain. A value set here wins over anything the
    /// credentials declare.
    pub fn with_universe_domain<S: Into<String>>(mut self, universe_domain: S) -> Self {
        self.options.universe_domain = Some(universe_domain.into());
        self
    }

    /// Sets the window before expiration in which cached tokens are
    /// refreshed instead of served. Defaults to five minutes.
    pub fn with_eager_refresh_window(mut self, window: Duration) -> Self {
        self.options.refresh.eager_refresh_window = window;
        self
    }

    /// When enabled, a failed refresh returns the previous token, stale
    /// as it may be, instead of the error.
    pub fn with_force_refresh_on_failure(mut self, enabled: bool) -> Self {
        self.options.refresh.force_refresh_on_failure = enabled;
        self
    }

    /// Overrides the IAM Credentials endpoint used for remote signing.
    pub fn with_iam_credentials_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.iam_credentials_uri = Some(uri.into());
        self
    }

    /// Returns an [Authenticator] with the configured settings.
    ///
    /// Construction validates the configuration and performs no I/O;
    /// credentials are resolved on first use.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] when mutually exclusive options are both
    /// configured, such as an API key alongside credentials.
    pub fn build(self) -> BuildResult<Authenticator> {
        let credential_sources = [
            self.credentials_json.is_some(),
            self.key_file.is_some(),
            self.prebuilt_credentials.is_some(),
        ];
        if self.api_key.is_some() && credential_sources.iter().any(|s| *s) {
            return Err(BuilderError::conflict(
                "an API key cannot be combined with credentials; configure one or the other",
            ));
        }
        if credential_sources.iter().filter(|s| **s).count() > 1 {
            return Err(BuilderError::conflict(
                "only one of credentials JSON, a key file, or pre-built credentials may be configured",
            ));
        }
        Ok(Authenticator {
            inner: Arc::new(AuthenticatorInner {
                config: self,
                cached_credentials: OnceCell::new(),
                cached_project_id: OnceCell::new(),
            }),
        })
    }
}

/// Resolves and caches [Credentials], and answers authentication requests
/// with them.
///
/// Cloning an authenticator is cheap; clones share the credential and
/// project id caches.
#[derive(Clone, Debug)]
pub struct Authenticator {
    inner: Arc<AuthenticatorInner>,
}

#[derive(Debug)]
struct AuthenticatorInner {
    config: Builder,
    cached_credentials: OnceCell<Credentials>,
    // Write-once; independent from the credential cache.
    cached_project_id: OnceCell<String>,
}

impl Authenticator {
    /// Returns a builder for an authenticator.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Returns the resolved [Credentials], resolving them on first call.
    ///
    /// Concurrent first calls share a single resolution, and every caller
    /// observes the same credentials object.
    pub async fn credentials(&self) -> Result<Credentials> {
        self.inner
            .cached_credentials
            .get_or_try_init(|| self.resolve_credentials())
            .await
            .cloned()
    }

    async fn resolve_credentials(&self) -> Result<Credentials> {
        let config = &self.inner.config;
        if let Some(credentials) = &config.prebuilt_credentials {
            return Ok(credentials.clone());
        }
        if let Some(api_key) = &config.api_key {
            return Ok(api_key::Builder::new(api_key.clone()).build());
        }
        if let Some(json) = &config.credentials_json {
            return credentials::Builder::new(json.clone())
                .with_build_options(config.options.clone())
                .build()
                .map_err(|e| CredentialsError::new(false, ErrorKind::Other, e));
        }
        if let Some(key_file) = &config.key_file {
            let contents = tokio::fs::read_to_string(key_file).await.map_err(|e| {
                CredentialsError::from_str(
                    false,
                    ErrorKind::Other,
                    format!("could not read the credentials file `{key_file}`: {e}"),
                )
            })?;
            let json = serde_json::from_str(&contents).map_err(errors::serialization)?;
            return credentials::Builder::new(json)
                .with_build_options(config.options.clone())
                .build()
                .map_err(|e| CredentialsError::new(false, ErrorKind::Other, e));
        }
        credentials::Builder::default()
            .with_build_options(config.options.clone())
            .resolve()
            .await
    }

    /// Returns a fresh access token.
    pub async fn access_token(&self) -> Result<String> {
        let credentials = self.credentials().await?;
        Ok(credentials.token().await?.token)
    }

    /// Returns the auth headers for a request.
    ///
    /// The headers carry `Authorization: Bearer <token>`, or
    /// `x-goog-api-key` when an API key is configured, plus
    /// `x-goog-user-project` when a quota project applies.
    pub async fn headers(&self) -> Result<HeaderMap> {
        let credentials = self.credentials().await?;
        credentials.headers().await
    }

    /// Merges the auth headers into `request`.
    ///
    /// Auth headers overwrite request headers of the same name; all other
    /// request headers are preserved.
    pub async fn authorize_request(&self, request: &mut reqwest::Request) -> Result<()> {
        let headers = self.headers().await?;
        for (name, value) in headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(())
    }

    /// Authorizes and sends `request`.
    pub async fn request(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        self.authorize_request(&mut request).await?;
        let client = reqwest::Client::new();
        client.execute(request).await.map_err(errors::retryable)
    }

    /// Signs `content` as the resolved service account, returning the
    /// base64-encoded signature.
    ///
    /// Credentials holding a private key sign locally; others sign through
    /// the IAM Credentials `signBlob` endpoint, looking up the service
    /// account email if needed. Credentials with neither path fail with
    /// [SigningError::is_unsupported].
    pub async fn sign(&self, content: &[u8]) -> std::result::Result<String, SigningError> {
        let credentials = self
            .credentials()
            .await
            .map_err(SigningError::transport)?;
        if let Some(signer) = credentials.local_signer() {
            return Ok(BASE64_STANDARD.encode(signer.sign(content).await?));
        }
        let Some(client_email) = credentials.service_account_email().await else {
            return Err(SigningError::unsupported(
                "the resolved credentials have neither a private key nor a service account email",
            ));
        };
        let iam_credentials_uri = match &self.inner.config.iam_credentials_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "https://iamcredentials.{}",
                self.universe_domain().await
            ),
        };
        let signer = Signer::from_credentials(
            client_email,
            credentials.signing_credentials(),
            iam_credentials_uri,
        );
        Ok(BASE64_STANDARD.encode(signer.sign(content).await?))
    }

    /// Returns the project id, detecting it on first call.
    ///
    /// Detection tries, in order: the configured project id, the
    /// `GCLOUD_PROJECT` and `GOOGLE_CLOUD_PROJECT` environment variables,
    /// the credentials file, the resolved credentials themselves, the
    /// local gcloud configuration, and the metadata service. The first
    /// hit is cached permanently.
    ///
    /// # Errors
    ///
    /// Fails with
    /// [ErrorKind::ProjectIdUndetectable][crate::errors::ErrorKind::ProjectIdUndetectable]
    /// when every source is exhausted.
    pub async fn project_id(&self) -> Result<String> {
        self.inner
            .cached_project_id
            .get_or_try_init(|| self.detect_project_id())
            .await
            .cloned()
    }

    async fn detect_project_id(&self) -> Result<String> {
        let config = &self.inner.config;
        if let Some(project_id) = &config.project_id {
            return Ok(project_id.clone());
        }
        if let Some(project_id) = project_id::from_env() {
            return Ok(project_id);
        }
        if let Some(project_id) =
            project_id::from_credentials_file(config.key_file.as_deref()).await
        {
            return Ok(project_id);
        }
        if let Ok(credentials) = self.credentials().await {
            if let Some(project_id) = credentials.project_id().await? {
                return Ok(project_id);
            }
        }
        if let Some(project_id) = project_id::from_gcloud_config().await {
            return Ok(project_id);
        }
        if let Some(project_id) = project_id::from_metadata().await {
            return Ok(project_id);
        }
        Err(CredentialsError::from_str(
            false,
            ErrorKind::ProjectIdUndetectable,
            "unable to detect a project id from the environment, the credentials, the gcloud configuration, or the metadata service",
        ))
    }

    /// Returns the universe domain of the resolved credentials.
    ///
    /// An explicitly configured universe domain wins over anything the
    /// credentials declare; the default is `googleapis.com`.
    pub async fn universe_domain(&self) -> String {
        if let Some(universe_domain) = &self.inner.config.options.universe_domain {
            return universe_domain.clone();
        }
        if let Ok(credentials) = self.credentials().await {
            if let Some(universe_domain) = credentials.universe_domain().await {
                return universe_domain;
            }
        }
        DEFAULT_UNIVERSE_DOMAIN.to_string()
    }

    /// Returns ID token [Credentials] for the given audience, backed by
    /// the same configuration as this authenticator.
    ///
    /// # Errors
    ///
    /// Fails when the configured credential type cannot mint ID tokens,
    /// external accounts in particular.
    pub async fn id_token_credentials<S: Into<String>>(
        &self,
        target_audience: S,
    ) -> BuildResult<Credentials> {
        let config = &self.inner.config;
        let mut builder = idtoken::Builder::new(target_audience);
        if let Some(json) = &config.credentials_json {
            builder = builder.with_credentials_json(json.clone());
        } else if let Some(key_file) = &config.key_file {
            let contents = tokio::fs::read_to_string(key_file)
                .await
                .map_err(BuilderError::loading)?;
            let json = serde_json::from_str(&contents).map_err(BuilderError::parsing)?;
            builder = builder.with_credentials_json(json);
        }
        builder.build()
    }
}
