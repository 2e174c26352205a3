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

//! Types and functions to work with authentication [Credentials].
//!
//! The [Builder] in this module implements the [Application Default
//! Credentials] lookup: it inspects the process environment, finds the
//! best credential source, and returns the matching credential type. The
//! submodules contain one builder per credential type for applications
//! that want to bypass the lookup.
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials
//! [Credentials]: https://cloud.google.com/docs/authentication#credentials

/// API key credentials.
pub mod api_key;
/// Workload and workforce identity federation.
pub mod external_account;
/// Workforce identity federation user credentials.
pub mod external_account_authorized_user;
/// OIDC ID token wrappers.
pub mod idtoken;
/// Service account impersonation.
pub mod impersonated;
/// Credentials backed by the metadata service.
pub mod mds;
/// Service account key credentials.
pub mod service_account;
/// Custom subject token providers for federation.
pub mod subject_token;
/// User account (refresh token) credentials.
pub mod user_account;

pub(crate) mod external_account_sources;
pub(crate) mod internal;
pub(crate) mod jws;

use crate::build_errors::Error as BuilderError;
use crate::constants::{
    ADC_NOT_FOUND_MSG, ADC_PATH_VAR, ADC_PATH_VAR_LOWER, DEFAULT_UNIVERSE_DOMAIN as GDU,
    NO_GCE_CHECK_VAR,
};
use crate::errors::{CredentialsError, ErrorKind};
use crate::token::Token;
use crate::token_cache::RefreshOptions;
use crate::BuildResult;
use http::HeaderMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The default universe domain, `googleapis.com`.
///
/// Service endpoints are parameterized by a universe domain; almost all
/// applications use the default.
pub const DEFAULT_UNIVERSE_DOMAIN: &str = GDU;

/// A `Result` alias where the `Err` case is
/// [CredentialsError][crate::errors::CredentialsError].
pub type Result<T> = std::result::Result<T, CredentialsError>;

/// An implementation of [CredentialsProvider].
///
/// Represents a [Credential] used to obtain auth request headers.
///
/// In general, [Credentials][credentials-link] are "something that proves
/// identity", analogous to a username and password. This struct wraps the
/// specific credential types in this crate behind one interface, so the
/// rest of an application does not care which discovery strategy produced
/// them.
///
/// [credentials-link]: https://cloud.google.com/docs/authentication#credentials
#[derive(Clone, Debug)]
pub struct Credentials {
    inner: Arc<dyn CredentialsProvider>,
}

impl<T> From<T> for Credentials
where
    T: CredentialsProvider + 'static,
{
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

impl Credentials {
    /// Asynchronously retrieves a token.
    ///
    /// Returns a token if one is cached and valid; otherwise refreshes it
    /// first. Concurrent callers share one refresh.
    pub async fn token(&self) -> Result<Token> {
        self.inner.token().await
    }

    /// Asynchronously constructs the auth headers.
    ///
    /// The headers carry either a bearer token or an API key, plus the
    /// quota project when one applies.
    pub async fn headers(&self) -> Result<HeaderMap> {
        self.inner.headers().await
    }

    /// Retrieves the universe domain associated with the credentials, if
    /// any.
    pub async fn universe_domain(&self) -> Option<String> {
        self.inner.universe_domain().await
    }

    /// Retrieves the project id derivable from these credentials, if any.
    ///
    /// Some credential types embed a project id, some can look one up over
    /// the network, and some have no associated project at all.
    pub async fn project_id(&self) -> Result<Option<String>> {
        self.inner.project_id().await
    }

    /// The service account email behind these credentials, if known.
    pub async fn service_account_email(&self) -> Option<String> {
        self.inner.service_account_email().await
    }

    pub(crate) fn local_signer(&self) -> Option<crate::signer::Signer> {
        self.inner.local_signer()
    }

    pub(crate) fn signing_credentials(&self) -> Credentials {
        self.inner.signing_credentials().unwrap_or_else(|| self.clone())
    }
}

/// The interface every credential type implements.
///
/// Implement this trait to supply a custom credential type, or to mock
/// credentials in tests.
#[async_trait::async_trait]
pub trait CredentialsProvider: std::fmt::Debug + Send + Sync {
    /// Asynchronously retrieves a token.
    async fn token(&self) -> Result<Token>;

    /// Asynchronously constructs the auth headers.
    async fn headers(&self) -> Result<HeaderMap>;

    /// The universe domain these credentials are pinned to, if any.
    async fn universe_domain(&self) -> Option<String> {
        Some(DEFAULT_UNIVERSE_DOMAIN.to_string())
    }

    /// The project id derivable from these credentials, if any.
    async fn project_id(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// The service account email behind these credentials, if known.
    async fn service_account_email(&self) -> Option<String> {
        None
    }

    /// A signer backed by a locally held private key, if one exists.
    fn local_signer(&self) -> Option<crate::signer::Signer> {
        None
    }

    /// The credentials that authorize remote signing, when they differ
    /// from these credentials themselves.
    fn signing_credentials(&self) -> Option<Credentials> {
        None
    }
}

/// Options shared by the loaders for every credential type.
#[derive(Clone, Debug, Default)]
pub(crate) struct BuildOptions {
    pub(crate) scopes: Option<Vec<String>>,
    pub(crate) default_scopes: Option<Vec<String>>,
    pub(crate) quota_project_id: Option<String>,
    pub(crate) universe_domain: Option<String>,
    pub(crate) refresh: RefreshOptions,
}

impl BuildOptions {
    /// User scopes shadow default scopes everywhere a token is requested.
    pub(crate) fn effective_scopes(&self) -> Option<Vec<String>> {
        self.scopes.clone().or_else(|| self.default_scopes.clone())
    }
}

/// A builder for [Credentials] discovered from the environment.
///
/// The lookup tries, in order:
/// 1. a JSON object given to [Builder::new];
/// 2. the file named by the `GOOGLE_APPLICATION_CREDENTIALS` environment
///    variable, which is an error if it cannot be read;
/// 3. the gcloud well-known file,
///    `$HOME/.config/gcloud/application_default_credentials.json` (on
///    Windows, `%APPDATA%\gcloud\application_default_credentials.json`);
/// 4. the metadata service of Google Compute Engine and the environments
///    derived from it.
///
/// # Example
/// ```
/// # use google_cloud_adc::credentials::Builder;
/// # tokio_test::block_on(async {
/// let credentials = Builder::default()
///     .with_scopes(["https://www.googleapis.com/auth/pubsub"])
///     .build();
/// # });
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    credentials_json: Option<Value>,
    options: BuildOptions,
}

impl Builder {
    /// Creates a builder that loads the given credentials JSON instead of
    /// searching the environment.
    ///
    /// The JSON must carry a `type` field naming one of the supported
    /// credential types.
    pub fn new(credentials_json: Value) -> Self {
        Self {
            credentials_json: Some(credentials_json),
            options: BuildOptions::default(),
        }
    }

    pub(crate) fn with_build_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the [scopes] requested for the minted tokens.
    ///
    /// Scopes set here shadow any default scopes a client library
    /// configured.
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

    /// Sets the fallback scopes, used only when no user scopes are set.
    ///
    /// Client libraries set these to the scopes their service requires.
    pub fn with_default_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.default_scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// A value set here wins over the `GOOGLE_CLOUD_QUOTA_PROJECT`
    /// environment variable and over a `quota_project_id` declared in the
    /// credentials file.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.options.quota_project_id = Some(quota_project_id.into());
        self
    }

    /// Overrides the universe domain for the built credentials.
    pub fn with_universe_domain<S: Into<String>>(mut self, universe_domain: S) -> Self {
        self.options.universe_domain = Some(universe_domain.into());
        self
    }

    /// Sets the window before expiration in which a cached token is
    /// refreshed instead of served. Defaults to five minutes.
    pub fn with_eager_refresh_window(mut self, window: Duration) -> Self {
        self.options.refresh.eager_refresh_window = window;
        self
    }

    /// When enabled, a failed refresh returns the previous token, stale as
    /// it may be, instead of the error. A warning is logged.
    pub fn with_force_refresh_on_failure(mut self, enabled: bool) -> Self {
        self.options.refresh.force_refresh_on_failure = enabled;
        self
    }

    /// Returns [Credentials] from the configured JSON or the environment.
    ///
    /// This method does not perform I/O beyond reading the credentials
    /// file; when the lookup falls through to the metadata service, the
    /// service is not probed until the first token is requested. Use
    /// [resolve][Builder::resolve] to include the probe in the lookup.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] when the file named by
    /// `GOOGLE_APPLICATION_CREDENTIALS` is missing or unreadable, when a
    /// credentials file cannot be parsed, or when its `type` field is not
    /// one of the supported credential types.
    pub fn build(self) -> BuildResult<Credentials> {
        let Builder {
            credentials_json,
            options,
        } = self;
        if let Some(json) = credentials_json {
            return build_credentials_from_json(json, &options);
        }
        match load_adc()? {
            AdcContents::Contents(contents) => {
                let json = serde_json::from_str(&contents).map_err(BuilderError::parsing)?;
                build_credentials_from_json(json, &options)
            }
            AdcContents::FallbackToMds => {
                if gce_check_disabled() {
                    return Err(BuilderError::not_found(ADC_NOT_FOUND_MSG));
                }
                Ok(mds_from_options(&options))
            }
        }
    }

    /// Like [build][Builder::build], but probes the metadata service
    /// before falling back to it.
    ///
    /// # Errors
    ///
    /// In addition to the [build][Builder::build] errors, fails with
    /// [ErrorKind::AdcNotFound][crate::errors::ErrorKind::AdcNotFound]
    /// when no discovery strategy, the metadata service included, produced
    /// a credential.
    pub async fn resolve(self) -> Result<Credentials> {
        let Builder {
            credentials_json,
            options,
        } = self;
        if let Some(json) = credentials_json {
            return build_credentials_from_json(json, &options)
                .map_err(|e| CredentialsError::new(false, ErrorKind::Other, e));
        }
        match load_adc().map_err(|e| CredentialsError::new(false, ErrorKind::Other, e))? {
            AdcContents::Contents(contents) => {
                let json = serde_json::from_str(&contents)
                    .map_err(|e| CredentialsError::new(false, ErrorKind::Serialization, e))?;
                build_credentials_from_json(json, &options)
                    .map_err(|e| CredentialsError::new(false, ErrorKind::Other, e))
            }
            AdcContents::FallbackToMds => {
                if gce_check_disabled() || !mds::is_running_on_gce().await {
                    return Err(CredentialsError::from_str(
                        false,
                        ErrorKind::AdcNotFound,
                        ADC_NOT_FOUND_MSG,
                    ));
                }
                tracing::debug!("detected Google Compute Engine, using metadata credentials");
                Ok(mds_from_options(&options))
            }
        }
    }
}

fn mds_from_options(options: &BuildOptions) -> Credentials {
    let mut builder = mds::Builder::default()
        .with_refresh_options(options.refresh)
        .with_quota_project_id_opt(options.quota_project_id.clone());
    if let Some(scopes) = options.effective_scopes() {
        builder = builder.with_scopes(scopes);
    }
    if let Some(ud) = options.universe_domain.clone() {
        builder = builder.with_universe_domain(ud);
    }
    builder.build()
}

pub(crate) enum AdcContents {
    Contents(String),
    FallbackToMds,
}

fn adc_path() -> Option<String> {
    std::env::var(ADC_PATH_VAR)
        .ok()
        .or_else(|| std::env::var(ADC_PATH_VAR_LOWER).ok())
        .filter(|p| !p.is_empty())
}

fn well_known_adc_path() -> Option<PathBuf> {
    let mut path = PathBuf::new();
    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").ok().filter(|v| !v.is_empty())?;
        path.push(appdata);
    } else {
        let home = std::env::var("HOME").ok().filter(|v| !v.is_empty())?;
        path.push(home);
        path.push(".config");
    }
    path.push("gcloud");
    path.push("application_default_credentials.json");
    Some(path)
}

fn gce_check_disabled() -> bool {
    std::env::var(NO_GCE_CHECK_VAR)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Load the ADC json contents, if any.
///
/// A path named by `GOOGLE_APPLICATION_CREDENTIALS` must be readable;
/// failure to read it does not fall through to the next strategy. The
/// well-known file is skipped when absent, but a present file that cannot
/// be read is also an error.
pub(crate) fn load_adc() -> BuildResult<AdcContents> {
    if let Some(path) = adc_path() {
        return std::fs::read_to_string(&path)
            .map(AdcContents::Contents)
            .map_err(|e| {
                BuilderError::loading(format!(
                    "Failed to load Application Default Credentials from {path}, set by the {ADC_PATH_VAR} environment variable: {e}"
                ))
            });
    }
    let Some(path) = well_known_adc_path() else {
        return Ok(AdcContents::FallbackToMds);
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(AdcContents::Contents(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AdcContents::FallbackToMds),
        Err(e) => Err(BuilderError::loading(format!(
            "Failed to load Application Default Credentials from {}: {e}",
            path.display()
        ))),
    }
}

pub(crate) fn extract_credential_type(json: &Value) -> BuildResult<&str> {
    json.get("type")
        .ok_or_else(|| {
            BuilderError::parsing("Failed to parse Application Default Credentials: the `type` field is missing")
        })?
        .as_str()
        .ok_or_else(|| {
            BuilderError::parsing("Failed to parse Application Default Credentials: the `type` field is not a string")
        })
}

/// Dispatch on the `type` field of a credentials file.
pub(crate) fn build_credentials_from_json(
    json: Value,
    options: &BuildOptions,
) -> BuildResult<Credentials> {
    match extract_credential_type(&json)? {
        "service_account" => service_account::Builder::new(json)
            .with_options(options.clone())
            .build(),
        "authorized_user" => user_account::Builder::new(json)
            .with_options(options.clone())
            .build(),
        "external_account" => external_account::Builder::new(json)
            .with_options(options.clone())
            .build(),
        "external_account_authorized_user" => {
            external_account_authorized_user::Builder::new(json)
                .with_options(options.clone())
                .build()
        }
        "impersonated_service_account" => impersonated::Builder::new(json)
            .with_options(options.clone())
            .build(),
        unknown => Err(BuilderError::unknown_type(format!(
            "Invalid or unsupported credentials type found in JSON: `{unknown}`"
        ))),
    }
}

/// Test helpers for applications using this crate.
pub mod testing {
    use super::*;

    /// Returns [Credentials] that produce no headers and never expire.
    ///
    /// Useful when testing against emulators or local fakes that do not
    /// require authentication.
    pub fn test_credentials() -> Credentials {
        Credentials::from(TestCredentials)
    }

    #[derive(Debug)]
    struct TestCredentials;

    #[async_trait::async_trait]
    impl CredentialsProvider for TestCredentials {
        async fn token(&self) -> Result<Token> {
            Ok(Token {
                token: "test-only-token".to_string(),
                token_type: "Bearer".to_string(),
                expires_at: None,
                metadata: None,
            })
        }

        async fn headers(&self) -> Result<HeaderMap> {
            Ok(HeaderMap::new())
        }

        async fn universe_domain(&self) -> Option<String> {
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::RsaPrivateKey;
    use scoped_env::ScopedEnv;
    use serial_test::serial;
    use std::io::Write;
    use std::sync::LazyLock;

    // Generating an RSA key is slow; tests share one.
    pub(crate) static RSA_PRIVATE_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate test key")
    });

    pub(crate) static PKCS8_PK: LazyLock<String> = LazyLock::new(|| {
        RSA_PRIVATE_KEY
            .to_pkcs8_pem(LineEnding::LF)
            .expect("failed to encode test key")
            .to_string()
    });

    pub(crate) fn b64_decode_to_json(s: &str) -> Value {
        use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
        let decoded = String::from_utf8(BASE64_URL_SAFE_NO_PAD.decode(s).unwrap()).unwrap();
        serde_json::from_str(&decoded).unwrap()
    }

    #[test]
    #[serial]
    fn load_adc_no_env_no_home() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let _e2 = ScopedEnv::remove(ADC_PATH_VAR_LOWER);
        let _e3 = ScopedEnv::remove("HOME");
        let _e4 = ScopedEnv::remove("APPDATA");
        assert!(matches!(load_adc(), Ok(AdcContents::FallbackToMds)));
    }

    #[test]
    #[serial]
    fn load_adc_env_missing_file_is_fatal() {
        let _e = ScopedEnv::set(ADC_PATH_VAR, "file-does-not-exist.json");
        let err = load_adc().err().unwrap();
        assert!(err.is_loading(), "{err:?}");
        let msg = err.to_string();
        assert!(msg.contains("file-does-not-exist.json"), "{msg}");
        assert!(msg.contains(ADC_PATH_VAR), "{msg}");
    }

    #[test]
    #[serial]
    fn load_adc_env_lowercase_accepted() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let file = tempfile::NamedTempFile::new().unwrap();
        write!(file.as_file(), "{}", r#"{"type": "authorized_user"}"#).unwrap();
        let _e2 = ScopedEnv::set(ADC_PATH_VAR_LOWER, file.path().to_str().unwrap());
        match load_adc().unwrap() {
            AdcContents::Contents(c) => assert!(c.contains("authorized_user"), "{c}"),
            AdcContents::FallbackToMds => panic!("expected file contents"),
        }
    }

    #[test]
    #[serial]
    fn load_adc_well_known_file() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let _e2 = ScopedEnv::remove(ADC_PATH_VAR_LOWER);
        let dir = tempfile::TempDir::new().unwrap();
        let _e3 = ScopedEnv::set("HOME", dir.path().to_str().unwrap());
        let _e4 = ScopedEnv::set("APPDATA", dir.path().to_str().unwrap());
        let config = if cfg!(windows) {
            dir.path().join("gcloud")
        } else {
            dir.path().join(".config").join("gcloud")
        };
        std::fs::create_dir_all(&config).unwrap();
        std::fs::write(
            config.join("application_default_credentials.json"),
            r#"{"type": "authorized_user"}"#,
        )
        .unwrap();
        match load_adc().unwrap() {
            AdcContents::Contents(c) => assert!(c.contains("authorized_user"), "{c}"),
            AdcContents::FallbackToMds => panic!("expected file contents"),
        }
    }

    #[test]
    #[serial]
    fn load_adc_empty_home_skips_well_known() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let _e2 = ScopedEnv::remove(ADC_PATH_VAR_LOWER);
        let _e3 = ScopedEnv::set("HOME", "");
        let _e4 = ScopedEnv::set("APPDATA", "");
        assert!(matches!(load_adc(), Ok(AdcContents::FallbackToMds)));
    }

    #[test]
    fn extract_type() {
        let json = serde_json::json!({"type": "service_account"});
        assert_eq!(extract_credential_type(&json).unwrap(), "service_account");

        let err = extract_credential_type(&serde_json::json!({})).err().unwrap();
        assert!(err.is_parsing(), "{err:?}");
        assert!(err.to_string().contains("`type` field"), "{err}");

        let err = extract_credential_type(&serde_json::json!({"type": 42}))
            .err()
            .unwrap();
        assert!(err.is_parsing(), "{err:?}");
    }

    #[test]
    fn unknown_type_rejected() {
        let json = serde_json::json!({"type": "some_unknown_credential_type"});
        let err = build_credentials_from_json(json, &BuildOptions::default())
            .err()
            .unwrap();
        assert!(err.is_unknown_type(), "{err:?}");
        assert!(
            err.to_string().contains("some_unknown_credential_type"),
            "{err}"
        );
    }

    #[test]
    #[serial]
    fn no_gce_check_returns_not_found() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let _e2 = ScopedEnv::remove(ADC_PATH_VAR_LOWER);
        let _e3 = ScopedEnv::remove("HOME");
        let _e4 = ScopedEnv::remove("APPDATA");
        let _e5 = ScopedEnv::set(NO_GCE_CHECK_VAR, "true");
        let err = Builder::default().build().err().unwrap();
        assert!(err.is_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn testing_credentials_produce_no_headers() {
        let creds = testing::test_credentials();
        assert!(creds.headers().await.unwrap().is_empty());
        assert_eq!(creds.universe_domain().await, None);
        assert!(creds.project_id().await.unwrap().is_none());
        assert!(creds.local_signer().is_none());
    }
}
