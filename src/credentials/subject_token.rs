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

//! Custom subject token providers.
//!
//! This module is intended for advanced authentication scenarios where
//! developers need to integrate a custom token fetching mechanism into the
//! workload identity federation flow.
//!
//! The typical workflow involves implementing the [SubjectTokenProvider]
//! trait to fetch a token from an identity provider. The
//! [external_account][crate::credentials::external_account] credentials
//! then exchange this subject token for a Google Cloud access token via
//! the Security Token Service (STS).
//!
//! # Example
//! ```
//! # use google_cloud_adc::credentials::subject_token::{
//! #     Builder, SubjectToken, SubjectTokenProvider,
//! # };
//! #[derive(Debug)]
//! struct MyCustomProvider;
//!
//! #[async_trait::async_trait]
//! impl SubjectTokenProvider for MyCustomProvider {
//!     async fn subject_token(&self) -> google_cloud_adc::credentials::Result<SubjectToken> {
//!         let token_from_idp = "a-very-secret-token-from-your-idp";
//!         Ok(Builder::new(token_from_idp).build())
//!     }
//! }
//! ```

use crate::Result;

/// A builder for [SubjectToken] instances.
pub struct Builder {
    token: String,
}

impl Builder {
    /// Creates a new builder using the string token.
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Returns a [SubjectToken] instance.
    pub fn build(self) -> SubjectToken {
        SubjectToken { token: self.token }
    }
}

/// Represents a third-party subject token used for authentication.
///
/// This token is typically obtained from an external identity provider and
/// is exchanged for a Google Cloud access token via the Security Token
/// Service (STS).
#[derive(Debug)]
pub struct SubjectToken {
    pub(crate) token: String,
}

/// Trait for providing a third-party subject token.
///
/// Implement this trait when a custom mechanism is needed to fetch the
/// subject token exchanged by
/// [external_account][crate::credentials::external_account] credentials.
#[async_trait::async_trait]
pub trait SubjectTokenProvider: std::fmt::Debug + Send + Sync {
    /// Asynchronously fetches the third-party subject token.
    async fn subject_token(&self) -> Result<SubjectToken>;
}
