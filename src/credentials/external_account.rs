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

//! [External Account] Credentials type, also known as workload identity
//! federation.
//!
//! With workload identity federation a workload running outside Google
//! Cloud, on AWS, Azure, or any OIDC-compatible identity provider,
//! authenticates without a service account key. The workload presents a
//! *subject token* from its identity provider; the [Security Token
//! Service] exchanges it for a Google Cloud access token; optionally, a
//! final service account impersonation step mints the outward token.
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::external_account::Builder;
//! # tokio_test::block_on(async {
//! let config = serde_json::json!({
//!     "type": "external_account",
//!     "audience": "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/provider",
//!     "subject_token_type": "urn:ietf:params:oauth:token-type:jwt",
//!     "token_url": "https://sts.googleapis.com/v1/token",
//!     "credential_source": { "file": "/var/run/secrets/token" },
//! });
//! let credentials = Builder::new(config).build()?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [External Account]: https://google.aip.dev/auth/4117
//! [Security Token Service]: https://datatracker.ietf.org/doc/html/rfc8693

use crate::build_errors::Error as BuilderError;
use crate::constants::{DEFAULT_SCOPE, DEFAULT_UNIVERSE_DOMAIN, STS_TOKEN_URL};
use crate::credentials::external_account_sources::aws_sourced::{
    AwsCredentialSource, AwsSourcedCredentials,
};
use crate::credentials::external_account_sources::executable_sourced::ExecutableSourcedCredentials;
use crate::credentials::external_account_sources::file_sourced::FileSourcedCredentials;
use crate::credentials::external_account_sources::url_sourced::UrlSourcedCredentials;
use crate::credentials::internal::sts_exchange::{
    self, ClientAuthentication, ExchangeTokenRequest,
};
use crate::credentials::subject_token::SubjectTokenProvider;
use crate::credentials::{impersonated, BuildOptions, Credentials, CredentialsProvider};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::headers_util::{build_bearer_headers, resolve_quota_project};
use crate::token::{Token, TokenProvider};
use crate::token_cache::TokenCache;
use crate::{BuildResult, Result};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The format of a file or URL sourced subject token.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum SourceFormat {
    /// The raw content is the token.
    #[default]
    Text,
    /// The content is a JSON document carrying the token in one field.
    Json { subject_token_field_name: String },
}

impl SourceFormat {
    pub(crate) fn extract(&self, content: &str) -> Result<String> {
        match self {
            SourceFormat::Text => Ok(content.to_string()),
            SourceFormat::Json {
                subject_token_field_name,
            } => {
                let json: Value =
                    serde_json::from_str(content).map_err(errors::serialization)?;
                match json.get(subject_token_field_name) {
                    Some(Value::String(token)) => Ok(token.clone()),
                    _ => Err(errors::non_retryable_from_str(format!(
                        "failed to read the subject token field `{subject_token_field_name}` as a string, body=<{json}>"
                    ))),
                }
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct ExternalAccountConfig {
    audience: String,
    subject_token_type: String,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    service_account_impersonation_url: Option<String>,
    service_account_impersonation: Option<ImpersonationOptions>,
    quota_project_id: Option<String>,
    workforce_pool_user_project: Option<String>,
    universe_domain: Option<String>,
    credential_source: Option<Value>,
}

#[derive(Clone, Debug, Deserialize)]
struct ImpersonationOptions {
    token_lifetime_seconds: Option<u64>,
}

/// Selects the subject token source implementation from the
/// `credential_source` object.
fn subject_token_provider_from_source(
    source: Value,
    audience: &str,
) -> BuildResult<Arc<dyn SubjectTokenProvider>> {
    if let Some(environment_id) = source.get("environment_id").and_then(Value::as_str) {
        if environment_id != "aws1" {
            return Err(BuilderError::parsing(format!(
                "unsupported credential source environment id `{environment_id}`, expected `aws1`"
            )));
        }
        let aws = serde_json::from_value::<AwsCredentialSource>(source)
            .map_err(BuilderError::parsing)?;
        return Ok(Arc::new(AwsSourcedCredentials {
            source: aws,
            audience: audience.to_string(),
        }));
    }
    if source.get("file").is_some() {
        let file = serde_json::from_value::<FileSourcedCredentials>(source)
            .map_err(BuilderError::parsing)?;
        return Ok(Arc::new(file));
    }
    if source.get("url").is_some() {
        let url = serde_json::from_value::<UrlSourcedCredentials>(source)
            .map_err(BuilderError::parsing)?;
        return Ok(Arc::new(url));
    }
    if source.get("executable").is_some() {
        let executable = serde_json::from_value::<ExecutableSourcedCredentials>(source)
            .map_err(BuilderError::parsing)?;
        return Ok(Arc::new(executable));
    }
    Err(BuilderError::parsing(
        "unable to determine the credential source type: expected one of `file`, `url`, `executable`, or an AWS `environment_id`",
    ))
}

/// A builder for `external_account` [Credentials].
///
/// # Example
/// ```
/// # use google_cloud_adc::credentials::external_account::Builder;
/// # tokio_test::block_on(async {
/// let config = serde_json::json!({ /* add details here */ });
/// let credentials = Builder::new(config).build();
/// })
/// ```
pub struct Builder {
    config: Value,
    subject_token_provider: Option<Arc<dyn SubjectTokenProvider>>,
    cloud_resource_manager_uri: Option<String>,
    options: BuildOptions,
}

impl Builder {
    /// Creates a new builder using an `external_account` JSON
    /// configuration, as produced by the `gcloud iam workload-identity-pools
    /// create-cred-config` command.
    pub fn new(config: Value) -> Self {
        Self {
            config,
            subject_token_provider: None,
            cloud_resource_manager_uri: None,
            options: BuildOptions::default(),
        }
    }

    pub(crate) fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the [scopes] requested for the outward token.
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

    /// Replaces the configured `credential_source` with a custom
    /// [SubjectTokenProvider].
    pub fn with_subject_token_provider<P>(mut self, provider: P) -> Self
    where
        P: SubjectTokenProvider + 'static,
    {
        self.subject_token_provider = Some(Arc::new(provider));
        self
    }

    /// Overrides the Cloud Resource Manager endpoint used to look up the
    /// project id.
    pub fn with_cloud_resource_manager_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.cloud_resource_manager_uri = Some(uri.into());
        self
    }

    /// Returns [Credentials] with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns a [BuilderError] when the configuration is malformed,
    /// missing required fields, or names a credential source this crate
    /// does not support.
    pub fn build(self) -> BuildResult<Credentials> {
        let config = serde_json::from_value::<ExternalAccountConfig>(self.config)
            .map_err(BuilderError::parsing)?;

        let subject_token_provider = match self.subject_token_provider {
            Some(provider) => provider,
            None => {
                let source = config.credential_source.clone().ok_or_else(|| {
                    BuilderError::missing_field("credential_source")
                })?;
                subject_token_provider_from_source(source, &config.audience)?
            }
        };

        let universe_domain = self
            .options
            .universe_domain
            .clone()
            .or_else(|| config.universe_domain.clone());
        let impersonation = config.service_account_impersonation_url.clone().map(|url| {
            ImpersonationTarget {
                url,
                lifetime: config
                    .service_account_impersonation
                    .as_ref()
                    .and_then(|o| o.token_lifetime_seconds)
                    .map(Duration::from_secs),
            }
        });
        let scopes = self.options.effective_scopes().unwrap_or_default();
        let quota_project_id = resolve_quota_project(
            self.options.quota_project_id.clone(),
            config
                .quota_project_id
                .clone()
                .or_else(|| config.workforce_pool_user_project.clone()),
        );

        let token_provider = ExternalAccountTokenProvider {
            subject_token_provider,
            audience: config.audience.clone(),
            subject_token_type: config.subject_token_type.clone(),
            token_url: config
                .token_url
                .clone()
                .unwrap_or_else(|| STS_TOKEN_URL.to_string()),
            authentication: ClientAuthentication {
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
            },
            workforce_pool_user_project: config.workforce_pool_user_project.clone(),
            impersonation,
            scopes,
            universe_domain: universe_domain.clone(),
        };

        Ok(Credentials::from(ExternalAccountCredentials {
            token_provider: TokenCache::with_options(token_provider, self.options.refresh),
            quota_project_id,
            audience: config.audience,
            universe_domain,
            cloud_resource_manager_uri: self.cloud_resource_manager_uri,
        }))
    }
}

#[derive(Debug)]
struct ImpersonationTarget {
    url: String,
    lifetime: Option<Duration>,
}

struct ExternalAccountTokenProvider {
    subject_token_provider: Arc<dyn SubjectTokenProvider>,
    audience: String,
    subject_token_type: String,
    token_url: String,
    authentication: ClientAuthentication,
    workforce_pool_user_project: Option<String>,
    impersonation: Option<ImpersonationTarget>,
    // The effective outward scopes; empty when neither user nor default
    // scopes were configured.
    scopes: Vec<String>,
    universe_domain: Option<String>,
}

impl std::fmt::Debug for ExternalAccountTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalAccountTokenProvider")
            .field("audience", &self.audience)
            .field("subject_token_type", &self.subject_token_type)
            .field("token_url", &self.token_url)
            .field("impersonation", &self.impersonation)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl ExternalAccountTokenProvider {
    fn check_universe(&self) -> Result<()> {
        let Some(universe) = self.universe_domain.as_deref() else {
            return Ok(());
        };
        if universe == DEFAULT_UNIVERSE_DOMAIN {
            return Ok(());
        }
        let host = reqwest::Url::parse(&self.token_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if host.ends_with(universe) {
            return Ok(());
        }
        Err(CredentialsError::from_str(
            false,
            ErrorKind::UniverseMismatch,
            format!(
                "the token endpoint `{}` does not belong to the configured universe domain `{universe}`",
                self.token_url
            ),
        ))
    }
}

#[async_trait::async_trait]
impl TokenProvider for ExternalAccountTokenProvider {
    async fn token(&self) -> Result<Token> {
        self.check_universe()?;
        let subject_token = self.subject_token_provider.subject_token().await?;

        // With impersonation the scopes apply to the final token; the
        // intermediate STS token only needs to reach IAM Credentials.
        let sts_scopes = if self.impersonation.is_some() {
            vec![DEFAULT_SCOPE.to_string()]
        } else {
            self.scopes.clone()
        };
        let extra_options = match (&self.workforce_pool_user_project, &self.authentication) {
            (Some(project), auth) if auth.client_id.is_none() => Some(HashMap::from([(
                "userProject".to_string(),
                project.clone(),
            )])),
            _ => None,
        };
        let response = sts_exchange::exchange_token(ExchangeTokenRequest {
            url: self.token_url.clone(),
            authentication: self.authentication.clone(),
            audience: Some(self.audience.clone()),
            subject_token: subject_token.token,
            subject_token_type: self.subject_token_type.clone(),
            scope: sts_scopes,
            extra_options,
        })
        .await?;

        let sts_token = Token {
            token: response.access_token,
            token_type: response.token_type,
            expires_at: response
                .expires_in
                .map(|d| Instant::now() + Duration::from_secs(d)),
            metadata: None,
        };

        let Some(impersonation) = &self.impersonation else {
            return Ok(sts_token);
        };
        let source_headers = build_bearer_headers(&sts_token, &None)?;
        let scopes = if self.scopes.is_empty() {
            vec![DEFAULT_SCOPE.to_string()]
        } else {
            self.scopes.clone()
        };
        impersonated::generate_access_token(
            source_headers,
            None,
            scopes,
            impersonation.lifetime,
            &impersonation.url,
        )
        .await
    }
}

#[derive(Debug)]
struct ExternalAccountCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
    quota_project_id: Option<String>,
    audience: String,
    universe_domain: Option<String>,
    cloud_resource_manager_uri: Option<String>,
}

/// Extracts the project number embedded in a federation audience.
///
/// Audiences follow the pattern
/// `//iam.googleapis.com/projects/<NUMBER>/locations/...`.
pub(crate) fn project_number_from_audience(audience: &str) -> Option<&str> {
    let (_, rest) = audience.split_once("/projects/")?;
    let number = rest.split('/').next()?;
    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
        Some(number)
    } else {
        None
    }
}

#[derive(Debug, Deserialize)]
struct CrmProject {
    #[serde(rename = "projectId")]
    project_id: String,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for ExternalAccountCredentials<T>
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

    async fn universe_domain(&self) -> Option<String> {
        Some(
            self.universe_domain
                .clone()
                .unwrap_or_else(|| DEFAULT_UNIVERSE_DOMAIN.to_string()),
        )
    }

    async fn project_id(&self) -> Result<Option<String>> {
        let Some(number) = project_number_from_audience(&self.audience) else {
            return Ok(None);
        };
        let base = self.cloud_resource_manager_uri.clone().unwrap_or_else(|| {
            format!(
                "https://cloudresourcemanager.{}/v1",
                self.universe_domain
                    .as_deref()
                    .unwrap_or(DEFAULT_UNIVERSE_DOMAIN)
            )
        });
        let headers = self.headers().await?;
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{base}/projects/{number}"))
            .headers(headers)
            .send()
            .await
            .map_err(errors::retryable)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialsError::from_str(
                errors::is_retryable(status),
                ErrorKind::Other,
                format!(
                    "failed to look up project `{number}` in Cloud Resource Manager: status {status}, body=<{body}>"
                ),
            ));
        }
        let project = response
            .json::<CrmProject>()
            .await
            .map_err(errors::serialization)?;
        Ok(Some(project.project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{JWT_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT_TYPE};
    use crate::headers_util::QUOTA_PROJECT_KEY;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;
    use serial_test::serial;
    use std::io::Write;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    const AUDIENCE: &str =
        "//iam.googleapis.com/projects/123456/locations/global/workloadIdentityPools/pool/providers/provider";

    fn file_sourced_config(token_url: String, subject_token: &str) -> (Value, tempfile::NamedTempFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(subject_token.as_bytes()).unwrap();
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": token_url,
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        (config, file)
    }

    #[test]
    fn source_format_extract() {
        assert_eq!(SourceFormat::Text.extract("raw-token").unwrap(), "raw-token");
        let format = SourceFormat::Json {
            subject_token_field_name: "access_token".to_string(),
        };
        let content = json!({"access_token": "json-token"}).to_string();
        assert_eq!(format.extract(&content).unwrap(), "json-token");
        assert!(format.extract("not json").is_err());
    }

    #[test]
    fn audience_project_number() {
        assert_eq!(project_number_from_audience(AUDIENCE), Some("123456"));
        assert_eq!(
            project_number_from_audience("//iam.googleapis.com/locations/global"),
            None
        );
        assert_eq!(
            project_number_from_audience("//iam.googleapis.com/projects/abc/x"),
            None
        );
    }

    #[test]
    fn missing_credential_source_fails() {
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": "https://sts.googleapis.com/v1/token",
        });
        let err = Builder::new(config).build().unwrap_err();
        assert!(err.is_missing_field(), "{err:?}");
    }

    #[test]
    fn unknown_credential_source_fails() {
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": "https://sts.googleapis.com/v1/token",
            "credential_source": { "mystery": true },
        });
        let err = Builder::new(config).build().unwrap_err();
        assert!(err.is_parsing(), "{err:?}");
    }

    #[tokio::test]
    async fn exchange_without_impersonation() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                request::body(url_decoded(contains((
                    "grant_type",
                    TOKEN_EXCHANGE_GRANT_TYPE
                )))),
                request::body(url_decoded(contains(("audience", AUDIENCE)))),
                request::body(url_decoded(contains(("subject_token", "a_subject_token")))),
                request::body(url_decoded(contains((
                    "subject_token_type",
                    JWT_TOKEN_TYPE
                )))),
                request::body(url_decoded(contains(("scope", "scope1 scope2")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "a-federated-token",
                "token_type": "Bearer",
                "expires_in": 3600,
                "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
            }))),
        );

        let (config, _guard) = file_sourced_config(server.url_str("/sts"), "a_subject_token");
        let credentials = Builder::new(config)
            .with_scopes(["scope1", "scope2"])
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, "a-federated-token");
        Ok(())
    }

    #[tokio::test]
    async fn impersonation_forces_cloud_platform_scope_at_sts() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                // The STS leg always asks for cloud-platform when
                // impersonation follows, regardless of the outward scopes.
                request::body(url_decoded(contains(("scope", DEFAULT_SCOPE)))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "an-intermediate-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/sa:generateAccessToken"),
                request::headers(contains((
                    "authorization",
                    "Bearer an-intermediate-token"
                ))),
                request::body(json_decoded(eq(json!({
                    "scope": ["scope1"],
                    "lifetime": "600s",
                })))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "accessToken": "a-final-token",
                "expireTime": "2035-01-01T00:00:00Z",
            }))),
        );

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a_subject_token")?;
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": server.url_str("/sts"),
            "service_account_impersonation_url": server.url_str("/v1/sa:generateAccessToken"),
            "service_account_impersonation": { "token_lifetime_seconds": 600 },
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        let credentials = Builder::new(config).with_scopes(["scope1"]).build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, "a-final-token");
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn workforce_pool_user_project_in_options_and_headers() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                request::body(url_decoded(contains((
                    "options",
                    json!({"userProject": "workforce-project"}).to_string()
                )))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "a-federated-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a_subject_token")?;
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": server.url_str("/sts"),
            "workforce_pool_user_project": "workforce-project",
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        let credentials = Builder::new(config).build()?;
        let headers = credentials.headers().await?;
        assert_eq!(
            headers
                .get(http::HeaderName::from_static(QUOTA_PROJECT_KEY))
                .unwrap(),
            "workforce-project"
        );
        Ok(())
    }

    #[tokio::test]
    async fn explicit_quota_project_wins_over_workforce_project() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/sts"))
                .respond_with(json_encoded(json!({
                    "access_token": "a-federated-token",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                }))),
        );

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a_subject_token")?;
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": server.url_str("/sts"),
            "workforce_pool_user_project": "workforce-project",
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        let credentials = Builder::new(config)
            .with_quota_project_id("explicit-project")
            .build()?;
        let headers = credentials.headers().await?;
        assert_eq!(
            headers
                .get(http::HeaderName::from_static(QUOTA_PROJECT_KEY))
                .unwrap(),
            "explicit-project"
        );
        Ok(())
    }

    #[tokio::test]
    async fn project_id_via_cloud_resource_manager() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/sts"))
                .times(1)
                .respond_with(json_encoded(json!({
                    "access_token": "a-federated-token",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/crm/projects/123456"),
                request::headers(contains(("authorization", "Bearer a-federated-token"))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "projectId": "resolved-project",
                "projectNumber": "123456",
            }))),
        );

        let (config, _guard) = file_sourced_config(server.url_str("/sts"), "a_subject_token");
        let credentials = Builder::new(config)
            .with_cloud_resource_manager_uri(server.url_str("/crm"))
            .build()?;
        assert_eq!(
            credentials.project_id().await?.as_deref(),
            Some("resolved-project")
        );
        Ok(())
    }

    #[tokio::test]
    async fn project_id_permission_denied_propagates() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/sts"))
                .respond_with(json_encoded(json!({
                    "access_token": "a-federated-token",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                }))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", "/crm/projects/123456"))
                .respond_with(status_code(403).body("PERMISSION_DENIED")),
        );

        let (config, _guard) = file_sourced_config(server.url_str("/sts"), "a_subject_token");
        let credentials = Builder::new(config)
            .with_cloud_resource_manager_uri(server.url_str("/crm"))
            .build()?;
        let err = credentials.project_id().await.err().unwrap();
        assert!(err.to_string().contains("PERMISSION_DENIED"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn audience_without_project_number_yields_none() -> TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a_subject_token")?;
        let config = json!({
            "type": "external_account",
            "audience": "//iam.googleapis.com/locations/global/workforcePools/pool/providers/p",
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": "https://sts.googleapis.com/v1/token",
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        let credentials = Builder::new(config).build()?;
        assert_eq!(credentials.project_id().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn non_default_universe_requires_matching_token_url() -> TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"a_subject_token")?;
        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": "https://sts.googleapis.com/v1/token",
            "universe_domain": "test-universe.example",
            "credential_source": { "file": file.path().to_str().unwrap() },
        });
        let credentials = Builder::new(config).build()?;
        let err = credentials.token().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UniverseMismatch, "{err:?}");
        Ok(())
    }

    #[derive(Debug)]
    struct StaticProvider;

    #[async_trait::async_trait]
    impl SubjectTokenProvider for StaticProvider {
        async fn subject_token(
            &self,
        ) -> Result<crate::credentials::subject_token::SubjectToken> {
            Ok(crate::credentials::subject_token::Builder::new("a-custom-token").build())
        }
    }

    #[tokio::test]
    async fn custom_subject_token_provider() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/sts"),
                request::body(url_decoded(contains(("subject_token", "a-custom-token")))),
            ])
            .respond_with(json_encoded(json!({
                "access_token": "a-federated-token",
                "token_type": "Bearer",
                "expires_in": 3600,
            }))),
        );

        let config = json!({
            "type": "external_account",
            "audience": AUDIENCE,
            "subject_token_type": JWT_TOKEN_TYPE,
            "token_url": server.url_str("/sts"),
        });
        let credentials = Builder::new(config)
            .with_subject_token_provider(StaticProvider)
            .build()?;
        let token = credentials.token().await?;
        assert_eq!(token.token, "a-federated-token");
        Ok(())
    }
}
