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

//! Application Default Credentials for Google Cloud.
//!
//! This crate discovers credentials from the environment of a running
//! application, following the [Application Default Credentials] (ADC)
//! strategy, and produces request headers to authenticate calls against
//! Google Cloud services.
//!
//! Most applications only need the [authenticator::Authenticator] facade:
//!
//! ```no_run
//! # use google_cloud_adc::authenticator::Authenticator;
//! # tokio_test::block_on(async {
//! let auth = Authenticator::builder().build()?;
//! let headers = auth.headers().await?;
//! println!("{headers:?}");
//! # Ok::<(), anyhow::Error>(())
//! # });
//! ```
//!
//! Applications that need a specific credential type, regardless of the
//! environment, can use the builders in the [credentials] submodules.
//!
//! [Application Default Credentials]: https://cloud.google.com/docs/authentication/application-default-credentials

/// Errors created while constructing credentials.
pub mod build_errors;

/// Errors created while using credentials.
pub mod errors;

/// Types and functions to work with authentication [Credentials].
///
/// [Credentials]: https://cloud.google.com/docs/authentication#credentials
pub mod credentials;

/// Types and functions to work with auth [Tokens].
///
/// [Tokens]: https://cloud.google.com/docs/authentication#token
pub mod token;

/// Classification of the Google Cloud runtime environment.
pub mod environment;

/// Payload signing, locally or via the IAM Credentials service.
pub mod signer;

/// The user-visible entry point: credential resolution, project id
/// detection, request authorization, and signing.
pub mod authenticator;

/// The token cache.
pub(crate) mod token_cache;

/// Header construction shared by the credential types.
pub(crate) mod headers_util;

/// Project id detection sources other than the credentials themselves.
pub(crate) mod project_id;

pub(crate) mod constants;

/// A `Result` alias where the `Err` case is
/// `google_cloud_adc::errors::CredentialsError`.
pub(crate) type Result<T> = std::result::Result<T, crate::errors::CredentialsError>;

/// A `Result` alias where the `Err` case is
/// `google_cloud_adc::build_errors::Error`.
pub(crate) type BuildResult<T> = std::result::Result<T, crate::build_errors::Error>;
