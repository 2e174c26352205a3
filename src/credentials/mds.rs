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

//! [Metadata Service] Credentials type.
//!
//! Google Cloud environments such as [Google Compute Engine (GCE)][gce-link],
//! [Google Kubernetes Engine (GKE)][gke-link], or [Cloud Run] provide a
//! metadata service. This is a service local to the VM (or pod) which (as
//! the name implies) provides metadata information about the VM. The
//! service also provides access tokens associated with the
//! [default service account] of the corresponding VM, which this module
//! uses to securely authenticate with Google Cloud without downloading
//! secrets or other credentials.
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::mds::Builder;
//! # tokio_test::block_on(async {
//! let credentials = Builder::default()
//!     .with_quota_project_id("my-quota-project")
//!     .build();
//! # });
//! ```
//!
//! [Cloud Run]: https://cloud.google.com/run
//! [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
//! [gce-link]: https://cloud.google.com/products/compute
//! [gke-link]: https://cloud.google.com/kubernetes-engine
//! [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview

use crate::constants::{DEFAULT_UNIVERSE_DOMAIN, GCE_METADATA_HOST_VAR};
use crate::credentials::{Credentials, CredentialsProvider};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::headers_util::{build_bearer_headers, resolve_quota_project};
use crate::token::{Token, TokenProvider};
use crate::token_cache::{RefreshOptions, TokenCache};
use crate::Result;
use http::HeaderValue;
use reqwest::Client;
use std::sync::{LazyLock, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

const METADATA_FLAVOR: &str = "metadata-flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";
/// The stable DNS name of the metadata service.
const METADATA_ROOT: &str = "http://metadata.google.internal";
/// The fixed address of the metadata service, reachable when DNS is not.
const METADATA_ROOT_IP: &str = "http://169.254.169.254";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The endpoint configured for this process, honoring
/// `GCE_METADATA_HOST`.
pub(crate) fn default_endpoint() -> String {
    match std::env::var(GCE_METADATA_HOST_VAR) {
        Ok(host) if !host.is_empty() => {
            if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{host}")
            }
        }
        _ => METADATA_ROOT.to_string(),
    }
}

/// Performs a GET against the metadata service.
///
/// `path` is relative to `computeMetadata/v1/`. Connection errors map to
/// [ErrorKind::MetadataUnavailable]: once the environment was detected as
/// Google Cloud, an unreachable metadata service is a hard failure.
pub(crate) async fn get(endpoint: &str, path: &str) -> Result<String> {
    get_with_query(endpoint, path, None::<&[(&str, String)]>).await
}

pub(crate) async fn get_with_query<T: serde::Serialize + ?Sized>(
    endpoint: &str,
    path: &str,
    query: Option<&T>,
) -> Result<String> {
    let client = Client::new();
    let url = format!("{}/computeMetadata/v1/{}", endpoint, path.trim_start_matches('/'));
    let mut request = client
        .get(url)
        .header(METADATA_FLAVOR, HeaderValue::from_static(METADATA_FLAVOR_VALUE));
    if let Some(query) = query {
        request = request.query(query);
    }
    let response = request
        .send()
        .await
        .map_err(|e| CredentialsError::new(true, ErrorKind::MetadataUnavailable, e))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CredentialsError::new(errors::is_retryable(status), ErrorKind::Other, e))?;
        return Err(CredentialsError::from_str(
            errors::is_retryable(status),
            ErrorKind::Other,
            format!("metadata request for `{path}` failed: status {status}, body=<{body}>"),
        ));
    }
    response.text().await.map_err(errors::retryable)
}

// The probe result is process-wide; every credential and detector shares
// it.
static GCE_DETECTED: LazyLock<StdMutex<Option<bool>>> = LazyLock::new(|| StdMutex::new(None));
static PROBE_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Clears the cached detection result. Intended for tests.
pub fn reset_gce_detection() {
    *GCE_DETECTED.lock().unwrap() = None;
}

/// Checks whether this process runs on Google Compute Engine or an
/// environment derived from it.
///
/// The first call probes the metadata service on its DNS name and on its
/// fixed address; reaching either one is enough. The result is cached for
/// the lifetime of the process. Setting `GCE_METADATA_HOST` skips the
/// probe: a user pointing us at a metadata service is trusted.
pub async fn is_running_on_gce() -> bool {
    if let Some(cached) = *GCE_DETECTED.lock().unwrap() {
        return cached;
    }
    let _guard = PROBE_GUARD.lock().await;
    if let Some(cached) = *GCE_DETECTED.lock().unwrap() {
        return cached;
    }
    let detected = probe_gce().await;
    *GCE_DETECTED.lock().unwrap() = Some(detected);
    detected
}

async fn probe_gce() -> bool {
    if std::env::var(GCE_METADATA_HOST_VAR).is_ok_and(|v| !v.is_empty()) {
        return true;
    }
    async fn check(endpoint: &str) -> bool {
        let Ok(client) = Client::builder().connect_timeout(PROBE_TIMEOUT).build() else {
            return false;
        };
        client
            .get(format!("{endpoint}/computeMetadata/v1/instance"))
            .header(METADATA_FLAVOR, HeaderValue::from_static(METADATA_FLAVOR_VALUE))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }
    let both = async {
        let (dns, ip) = tokio::join!(check(METADATA_ROOT), check(METADATA_ROOT_IP));
        dns || ip
    };
    tokio::time::timeout(PROBE_TIMEOUT, both)
        .await
        .unwrap_or(false)
}

/// A builder for [Credentials] backed by the [Metadata Service].
///
/// While the lookup in [credentials::Builder][crate::credentials::Builder]
/// falls back to these credentials automatically, some applications need
/// to customize them or to bypass the lookup entirely.
///
/// [Metadata Service]: https://cloud.google.com/compute/docs/metadata/overview
#[derive(Debug, Default)]
pub struct Builder {
    endpoint: Option<String>,
    quota_project_id: Option<String>,
    scopes: Option<Vec<String>>,
    universe_domain: Option<String>,
    refresh: RefreshOptions,
}

impl Builder {
    /// Overrides the metadata service endpoint.
    ///
    /// If not set, the credentials use `http://metadata.google.internal`,
    /// or the host named by the `GCE_METADATA_HOST` environment variable.
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the [quota project] for these credentials.
    ///
    /// [quota project]: https://cloud.google.com/docs/quotas/quota-project
    pub fn with_quota_project_id<S: Into<String>>(mut self, quota_project_id: S) -> Self {
        self.quota_project_id = Some(quota_project_id.into());
        self
    }

    pub(crate) fn with_quota_project_id_opt(mut self, quota_project_id: Option<String>) -> Self {
        self.quota_project_id = quota_project_id;
        self
    }

    /// Sets the [scopes] for these credentials.
    ///
    /// The metadata service issues tokens based on the requested scopes.
    /// If none are specified, the token carries every scope configured for
    /// the [default service account] of the instance.
    ///
    /// [default service account]: https://cloud.google.com/iam/docs/service-account-types#default
    /// [scopes]: https://developers.google.com/identity/protocols/oauth2/scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Sets the universe domain, skipping the metadata lookup for it.
    pub fn with_universe_domain<S: Into<String>>(mut self, universe_domain: S) -> Self {
        self.universe_domain = Some(universe_domain.into());
        self
    }

    pub(crate) fn with_refresh_options(mut self, refresh: RefreshOptions) -> Self {
        self.refresh = refresh;
        self
    }

    /// Returns [Credentials] with the configured settings.
    pub fn build(self) -> Credentials {
        let endpoint = self.endpoint.unwrap_or_else(default_endpoint);
        let token_provider = MdsTokenProvider {
            endpoint: endpoint.clone(),
            scopes: self.scopes,
        };
        Credentials::from(MdsCredentials {
            token_provider: TokenCache::with_options(token_provider, self.refresh),
            quota_project_id: resolve_quota_project(self.quota_project_id, None),
            endpoint,
            universe_domain: self.universe_domain,
            fetched_universe_domain: OnceCell::new(),
        })
    }
}

#[derive(Debug)]
struct MdsCredentials<T>
where
    T: TokenProvider,
{
    token_provider: T,
    quota_project_id: Option<String>,
    endpoint: String,
    universe_domain: Option<String>,
    // Fetched from the metadata service on first use; fetch failures are
    // not cached, the next call retries.
    fetched_universe_domain: OnceCell<String>,
}

#[async_trait::async_trait]
impl<T> CredentialsProvider for MdsCredentials<T>
where
    T: TokenProvider,
{
    async fn token(&self) -> Result<Token> {
        self.token_provider.token().await
    }

    async fn headers(&self) -> Result<http::HeaderMap> {
        let token = self.token().await?;
        build_bearer_headers(&token, &self.quota_project_id)
    }

    async fn universe_domain(&self) -> Option<String> {
        if let Some(ud) = &self.universe_domain {
            return Some(ud.clone());
        }
        self.fetched_universe_domain
            .get_or_try_init(|| async {
                match get(&self.endpoint, "universe/universe-domain").await {
                    // Earlier metadata service versions return an empty
                    // string instead of the default universe.
                    Ok(ud) if ud.is_empty() => Ok(DEFAULT_UNIVERSE_DOMAIN.to_string()),
                    Ok(ud) => Ok(ud),
                    Err(e) if !e.is_transient() => Ok(DEFAULT_UNIVERSE_DOMAIN.to_string()),
                    Err(e) => Err(e),
                }
            })
            .await
            .ok()
            .cloned()
    }

    async fn project_id(&self) -> Result<Option<String>> {
        get(&self.endpoint, "project/project-id").await.map(Some)
    }

    async fn service_account_email(&self) -> Option<String> {
        get(&self.endpoint, "instance/service-accounts/default/email")
            .await
            .ok()
    }
}

#[derive(Debug)]
struct MdsTokenProvider {
    endpoint: String,
    scopes: Option<Vec<String>>,
}

#[derive(Debug, serde::Deserialize)]
struct MdsTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    token_type: String,
}

#[async_trait::async_trait]
impl TokenProvider for MdsTokenProvider {
    async fn token(&self) -> Result<Token> {
        let query = self.scopes.as_ref().map(|s| [("scopes", s.join(","))]);
        let body = get_with_query(
            &self.endpoint,
            "instance/service-accounts/default/token",
            query.as_ref(),
        )
        .await?;
        let response: MdsTokenResponse =
            serde_json::from_str(&body).map_err(errors::serialization)?;
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

/// Fetches an OIDC identity token for `audience` from the metadata
/// service.
pub(crate) async fn fetch_identity_token(endpoint: &str, audience: &str) -> Result<String> {
    get_with_query(
        endpoint,
        "instance/service-accounts/default/identity",
        Some(&[("audience", audience), ("format", "full")]),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

    #[tokio::test]
    async fn token_success_with_scopes() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", TOKEN_PATH),
                request::headers(contains(("metadata-flavor", "Google"))),
                request::query(url_decoded(contains(("scopes", "scope1,scope2")))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "test-access-token",
                "expires_in": 3600,
                "token_type": "Bearer",
            }))),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .with_scopes(["scope1", "scope2"])
            .build();
        let now = Instant::now();
        let token = credentials.token().await?;
        assert_eq!(token.token, "test-access-token");
        assert_eq!(token.token_type, "Bearer");
        assert!(token
            .expires_at
            .is_some_and(|e| e >= now + Duration::from_secs(3500)));
        Ok(())
    }

    #[tokio::test]
    async fn token_request_has_no_scopes_by_default() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", TOKEN_PATH),
                request::query(url_decoded(not(contains(key("scopes"))))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "access_token": "test-access-token",
                "token_type": "Bearer",
            }))),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        let token = credentials.token().await?;
        assert_eq!(token.token, "test-access-token");
        assert_eq!(token.expires_at, None);
        Ok(())
    }

    #[tokio::test]
    async fn token_error_status_is_fatal() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", TOKEN_PATH))
                .respond_with(status_code(404).body("not found")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        let err = credentials.token().await.err().unwrap();
        assert!(!err.is_transient(), "{err:?}");
        assert!(err.to_string().contains("not found"), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_metadata_is_metadata_unavailable() {
        // Nothing listens on this port.
        let credentials = Builder::default()
            .with_endpoint("http://127.0.0.1:1")
            .build();
        let err = credentials.token().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::MetadataUnavailable, "{err:?}");
        assert!(err.is_transient(), "{err:?}");
    }

    #[tokio::test]
    async fn universe_domain_fetched_once() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/universe/universe-domain",
            ))
            .times(1)
            .respond_with(status_code(200).body("test-universe.example")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        assert_eq!(
            credentials.universe_domain().await.as_deref(),
            Some("test-universe.example")
        );
        // Served from the cache; the expectation above is times(1).
        assert_eq!(
            credentials.universe_domain().await.as_deref(),
            Some("test-universe.example")
        );
        Ok(())
    }

    #[tokio::test]
    async fn universe_domain_not_found_means_default() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/universe/universe-domain",
            ))
            .respond_with(status_code(404).body("not found")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        assert_eq!(
            credentials.universe_domain().await.as_deref(),
            Some(DEFAULT_UNIVERSE_DOMAIN)
        );
        Ok(())
    }

    #[tokio::test]
    async fn universe_domain_empty_means_default() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/universe/universe-domain",
            ))
            .respond_with(status_code(200).body("")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        assert_eq!(
            credentials.universe_domain().await.as_deref(),
            Some(DEFAULT_UNIVERSE_DOMAIN)
        );
        Ok(())
    }

    #[tokio::test]
    async fn explicit_universe_domain_skips_lookup() {
        let credentials = Builder::default()
            .with_universe_domain("test-universe.example")
            .build();
        assert_eq!(
            credentials.universe_domain().await.as_deref(),
            Some("test-universe.example")
        );
    }

    #[tokio::test]
    async fn project_id_from_metadata() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/project/project-id",
            ))
            .respond_with(status_code(200).body("test-project")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        assert_eq!(
            credentials.project_id().await?.as_deref(),
            Some("test-project")
        );
        Ok(())
    }

    #[tokio::test]
    async fn service_account_email_from_metadata() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/instance/service-accounts/default/email",
            ))
            .respond_with(status_code(200).body("sa@test-project.iam.gserviceaccount.com")),
        );

        let credentials = Builder::default()
            .with_endpoint(server.url_str(""))
            .build();
        assert_eq!(
            credentials.service_account_email().await.as_deref(),
            Some("sa@test-project.iam.gserviceaccount.com")
        );
        Ok(())
    }

    #[tokio::test]
    async fn identity_token_request_shape() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path(
                    "GET",
                    "/computeMetadata/v1/instance/service-accounts/default/identity"
                ),
                request::query(url_decoded(contains(("audience", "https://svc.example")))),
                request::query(url_decoded(contains(("format", "full")))),
            ])
            .respond_with(status_code(200).body("an-identity-token")),
        );

        let token = fetch_identity_token(&server.url_str(""), "https://svc.example").await?;
        assert_eq!(token, "an-identity-token");
        Ok(())
    }
}
