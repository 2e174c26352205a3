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

//! [API key] credentials.
//!
//! API keys identify a calling project for the handful of services that
//! accept them. They carry no principal: requests authenticated with an
//! API key set the `x-goog-api-key` header and no `Authorization` header.
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::api_key::Builder;
//! # tokio_test::block_on(async {
//! let credentials = Builder::new("my-api-key").build();
//! let headers = credentials.headers().await?;
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! [API key]: https://cloud.google.com/docs/authentication/api-keys-use

use crate::credentials::{Credentials, CredentialsProvider};
use crate::headers_util::build_api_key_headers;
use crate::token::Token;
use crate::Result;
use http::HeaderMap;

/// A builder for API key [Credentials].
pub struct Builder {
    api_key: String,
}

impl Builder {
    /// Creates a new builder with the given API key.
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Returns [Credentials] wrapping the API key.
    pub fn build(self) -> Credentials {
        Credentials::from(ApiKeyCredentials {
            api_key: self.api_key,
        })
    }
}

struct ApiKeyCredentials {
    api_key: String,
}

impl std::fmt::Debug for ApiKeyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyCredentials")
            .field("api_key", &"[censored]")
            .finish()
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for ApiKeyCredentials {
    async fn token(&self) -> Result<Token> {
        // API keys do not expire and need no refresh.
        Ok(Token {
            token: self.api_key.clone(),
            token_type: String::new(),
            expires_at: None,
            metadata: None,
        })
    }

    async fn headers(&self) -> Result<HeaderMap> {
        let token = self.token().await?;
        build_api_key_headers(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::AUTHORIZATION;
    use http::HeaderName;

    #[tokio::test]
    async fn headers_carry_key_and_no_authorization() {
        let credentials = Builder::new("test-api-key").build();
        let headers = credentials.headers().await.unwrap();
        assert_eq!(headers.len(), 1, "{headers:?}");
        let value = headers
            .get(HeaderName::from_static("x-goog-api-key"))
            .unwrap();
        assert_eq!(value, "test-api-key");
        assert!(value.is_sensitive());
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn debug_censors_key() {
        let credentials = Builder::new("test-api-key").build();
        let fmt = format!("{credentials:?}");
        assert!(fmt.contains("ApiKeyCredentials"), "{fmt}");
        assert!(!fmt.contains("test-api-key"), "{fmt}");
    }
}
