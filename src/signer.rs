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

//! Payload signing.
//!
//! Signing a payload as a service account is used, for example, to create
//! signed URLs for Cloud Storage. A service account key signs locally with
//! RS256 over SHA-256; every other credential type signs remotely through
//! the IAM Credentials [signBlob] endpoint.
//!
//! [signBlob]: https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/signBlob

use crate::credentials::service_account::ServiceAccountKey;
use crate::credentials::Credentials;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use reqwest::Client;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, SigningError>;

/// Signs payloads on behalf of a service account.
#[derive(Clone, Debug)]
pub struct Signer {
    inner: Arc<dyn SigningProvider>,
}

impl Signer {
    /// The email of the service account whose signature is produced.
    pub async fn client_email(&self) -> Result<String> {
        self.inner.client_email().await
    }

    /// Signs `content`, returning the raw signature bytes.
    pub async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign(content).await
    }

    pub(crate) fn from_service_account_key(key: ServiceAccountKey) -> Self {
        Self {
            inner: Arc::new(KeySigner { key }),
        }
    }

    pub(crate) fn from_credentials(
        client_email: String,
        credentials: Credentials,
        iam_credentials_uri: String,
    ) -> Self {
        Self {
            inner: Arc::new(IamSigner {
                client_email,
                credentials,
                iam_credentials_uri,
            }),
        }
    }
}

#[async_trait::async_trait]
trait SigningProvider: Send + Sync + std::fmt::Debug {
    async fn client_email(&self) -> Result<String>;
    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>>;
}

/// Signs with the RSA private key held in a service account key file.
#[derive(Debug)]
struct KeySigner {
    key: ServiceAccountKey,
}

#[async_trait::async_trait]
impl SigningProvider for KeySigner {
    async fn client_email(&self) -> Result<String> {
        Ok(self.key.client_email.clone())
    }

    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        let signer = self.key.signer().map_err(SigningError::parsing)?;
        signer.sign(content).map_err(SigningError::parsing)
    }
}

/// Signs through the IAM Credentials `signBlob` endpoint, authorized with
/// existing [Credentials].
#[derive(Debug)]
struct IamSigner {
    client_email: String,
    credentials: Credentials,
    iam_credentials_uri: String,
}

#[derive(serde::Serialize)]
struct SignBlobRequest {
    delegates: Vec<String>,
    payload: String,
}

#[derive(Debug, serde::Deserialize)]
struct SignBlobResponse {
    #[serde(rename = "signedBlob")]
    signed_blob: String,
}

#[async_trait::async_trait]
impl SigningProvider for IamSigner {
    async fn client_email(&self) -> Result<String> {
        Ok(self.client_email.clone())
    }

    async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        let headers = self
            .credentials
            .headers()
            .await
            .map_err(SigningError::transport)?;
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:signBlob",
            self.iam_credentials_uri, self.client_email
        );
        let body = SignBlobRequest {
            delegates: vec![],
            payload: BASE64_STANDARD.encode(content),
        };

        let client = Client::new();
        let response = client
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(SigningError::transport)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SigningError::transport(format!(
                "signBlob failed: status {status}, body=<{body}>"
            )));
        }
        let response = response
            .json::<SignBlobResponse>()
            .await
            .map_err(SigningError::parsing)?;
        BASE64_STANDARD
            .decode(response.signed_blob)
            .map_err(SigningError::parsing)
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type for signing operations.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct SigningError(SigningErrorKind);

impl SigningError {
    /// A problem reaching the IAM Credentials service, or an error it
    /// returned.
    pub fn is_transport(&self) -> bool {
        matches!(self.0, SigningErrorKind::Transport(_))
    }

    /// A problem with the key material or a response payload.
    pub fn is_parsing(&self) -> bool {
        matches!(self.0, SigningErrorKind::Parsing(_))
    }

    /// The resolved credentials cannot sign, locally or remotely.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.0, SigningErrorKind::Unsupported(_))
    }

    pub(crate) fn transport<T>(source: T) -> SigningError
    where
        T: Into<BoxError>,
    {
        SigningError(SigningErrorKind::Transport(source.into()))
    }

    pub(crate) fn parsing<T>(source: T) -> SigningError
    where
        T: Into<BoxError>,
    {
        SigningError(SigningErrorKind::Parsing(source.into()))
    }

    pub(crate) fn unsupported<T>(description: T) -> SigningError
    where
        T: Into<BoxError>,
    {
        SigningError(SigningErrorKind::Unsupported(description.into()))
    }
}

#[derive(thiserror::Error, Debug)]
enum SigningErrorKind {
    #[error("failed to generate a signature via the IAM Credentials API: {0}")]
    Transport(#[source] BoxError),
    #[error("failed to parse the signing key or a response: {0}")]
    Parsing(#[source] BoxError),
    #[error("the resolved credentials cannot sign payloads: {0}")]
    Unsupported(#[source] BoxError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::{PKCS8_PK, RSA_PRIVATE_KEY};
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use rsa::Pkcs1v15Sign;
    use serde_json::json;
    use sha2::{Digest, Sha256};

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    fn test_key() -> ServiceAccountKey {
        serde_json::from_value(json!({
            "client_email": "test-client-email",
            "private_key_id": "test-private-key-id",
            "private_key": PKCS8_PK.clone(),
            "project_id": "test-project-id",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn local_signature_matches_reference() -> TestResult {
        let signer = Signer::from_service_account_key(test_key());
        assert_eq!(signer.client_email().await?, "test-client-email");

        let content = b"abc123";
        let signature = signer.sign(content).await?;

        // An independent RS256 implementation must produce the same bytes.
        let digest = Sha256::digest(content);
        let expected = RSA_PRIVATE_KEY.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;
        assert_eq!(signature, expected);
        Ok(())
    }

    #[tokio::test]
    async fn local_signer_bad_key_fails() {
        let key: ServiceAccountKey = serde_json::from_value(json!({
            "client_email": "test-client-email",
            "private_key_id": "test-private-key-id",
            "private_key": "not a pem key",
            "project_id": "test-project-id",
        }))
        .unwrap();
        let signer = Signer::from_service_account_key(key);
        let err = signer.sign(b"abc123").await.unwrap_err();
        assert!(err.is_parsing(), "{err:?}");
    }

    #[tokio::test]
    async fn remote_signing_via_sign_blob() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path(
                    "POST",
                    "/v1/projects/-/serviceAccounts/sa@p.iam.gserviceaccount.com:signBlob"
                ),
                request::body(json_decoded(eq(json!({
                    "delegates": [],
                    "payload": BASE64_STANDARD.encode(b"abc123"),
                })))),
            ])
            .times(1)
            .respond_with(json_encoded(json!({
                "keyId": "test-key-id",
                "signedBlob": BASE64_STANDARD.encode(b"a-signature"),
            }))),
        );

        let signer = Signer::from_credentials(
            "sa@p.iam.gserviceaccount.com".to_string(),
            crate::credentials::testing::test_credentials(),
            server.url_str(""),
        );
        let signature = signer.sign(b"abc123").await?;
        assert_eq!(signature, b"a-signature");
        Ok(())
    }

    #[tokio::test]
    async fn remote_signing_error_includes_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "POST",
                "/v1/projects/-/serviceAccounts/sa@p.iam.gserviceaccount.com:signBlob",
            ))
            .respond_with(status_code(403).body("denied")),
        );

        let signer = Signer::from_credentials(
            "sa@p.iam.gserviceaccount.com".to_string(),
            crate::credentials::testing::test_credentials(),
            server.url_str(""),
        );
        let err = signer.sign(b"abc123").await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(err.to_string().contains("denied"), "{err}");
    }
}
