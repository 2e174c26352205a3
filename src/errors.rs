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

//! Errors created while fetching tokens or using credentials.

use http::StatusCode;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type for operations on credentials.
///
/// The error carries a transient flag: if `true`, the operation that
/// resulted in this error may succeed on a future attempt. It also carries
/// a [kind][CredentialsError::kind] so applications can distinguish, for
/// example, a failed token refresh from an undetectable project id.
#[derive(Debug)]
pub struct CredentialsError {
    is_transient: bool,
    kind: ErrorKind,
    message: Option<String>,
    source: Option<BoxError>,
}

/// Enumerates the causes of a [CredentialsError].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// No credential discovery strategy produced a credential.
    AdcNotFound,
    /// All project id detection sources were exhausted.
    ProjectIdUndetectable,
    /// The token endpoint rejected a refresh, or its response could not be
    /// interpreted.
    TokenRefresh,
    /// The metadata service was unreachable after the environment was
    /// detected as Google Cloud.
    MetadataUnavailable,
    /// The credential type cannot mint ID tokens.
    IdTokenUnsupported,
    /// The credential type cannot sign payloads, locally or remotely.
    SignUnsupported,
    /// A credential pinned to one universe domain was used against an
    /// endpoint belonging to a different universe.
    UniverseMismatch,
    /// A transport-level failure, including timeouts.
    Transport,
    /// A payload could not be serialized or deserialized.
    Serialization,
    /// Anything not covered above.
    Other,
}

impl CredentialsError {
    /// Creates a new `CredentialsError` wrapping `source`.
    pub fn new<E>(is_transient: bool, kind: ErrorKind, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            is_transient,
            kind,
            message: None,
            source: Some(source.into()),
        }
    }

    /// Creates a new `CredentialsError` from a message, without a source.
    pub fn from_str<M: Into<String>>(is_transient: bool, kind: ErrorKind, message: M) -> Self {
        Self {
            is_transient,
            kind,
            message: Some(message.into()),
            source: None,
        }
    }

    /// Returns `true` if the operation may succeed on a future attempt.
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    /// Returns the cause classification for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub(crate) fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Creates a detached copy suitable for handing to multiple waiters.
    ///
    /// The source error is not clonable, so its text is folded into the
    /// message instead.
    pub(crate) fn duplicate(&self) -> Self {
        let message = match (&self.message, &self.source) {
            (Some(m), Some(s)) => format!("{m}, source: {s}"),
            (Some(m), None) => m.clone(),
            (None, Some(s)) => s.to_string(),
            (None, None) => "unknown credentials error".to_string(),
        };
        Self::from_str(self.is_transient, self.kind, message)
    }
}

/// A transient error of [ErrorKind::Transport].
pub(crate) fn retryable<E>(source: E) -> CredentialsError
where
    E: Into<BoxError>,
{
    CredentialsError::new(true, ErrorKind::Transport, source)
}

/// A permanent error of [ErrorKind::Other].
pub(crate) fn non_retryable<E>(source: E) -> CredentialsError
where
    E: Into<BoxError>,
{
    CredentialsError::new(false, ErrorKind::Other, source)
}

pub(crate) fn non_retryable_from_str<M: Into<String>>(message: M) -> CredentialsError {
    CredentialsError::from_str(false, ErrorKind::Other, message)
}

pub(crate) fn serialization<E>(source: E) -> CredentialsError
where
    E: Into<BoxError>,
{
    CredentialsError::new(false, ErrorKind::Serialization, source)
}

/// Maps an HTTP status code to retryability for token endpoints.
pub(crate) fn is_retryable(status: StatusCode) -> bool {
    match status {
        // Internal server errors do not indicate that there is anything
        // wrong with the request, so they are retried.
        StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => true,
        _ => false,
    }
}

/// Builds a [CredentialsError] from a non-success token endpoint response,
/// preserving the response body.
pub(crate) async fn from_http_response(
    response: reqwest::Response,
    context: &str,
) -> CredentialsError {
    let status = response.status();
    let transient = is_retryable(status);
    match response.text().await {
        Ok(body) => CredentialsError::from_str(
            transient,
            ErrorKind::TokenRefresh,
            format!("{context}: HTTP status {status}, body=<{body}>"),
        ),
        Err(e) => {
            CredentialsError::new(transient, ErrorKind::TokenRefresh, e).with_message(context)
        }
    }
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = if self.is_transient {
            "but future attempts may succeed"
        } else {
            "and future attempts will not succeed"
        };
        match (&self.message, &self.source) {
            (Some(m), Some(s)) => write!(f, "{m} {prefix}, source: {s}"),
            (Some(m), None) => write!(f, "{m} {prefix}"),
            (None, Some(s)) => write!(f, "{s} {prefix}"),
            (None, None) => write!(f, "unknown credentials error {prefix}"),
        }
    }
}

impl std::error::Error for CredentialsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}
