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

use crate::constants::QUOTA_PROJECT_VAR;
use crate::errors;
use crate::token::Token;
use crate::Result;

use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::HeaderMap;

/// The header naming the project billed for API usage.
pub(crate) const QUOTA_PROJECT_KEY: &str = "x-goog-user-project";

/// The header carrying an API key instead of a bearer token.
pub(crate) const API_KEY_HEADER_KEY: &str = "x-goog-api-key";

/// A utility function to create bearer headers.
pub(crate) fn build_bearer_headers(
    token: &Token,
    quota_project_id: &Option<String>,
) -> Result<HeaderMap> {
    build_headers(token, quota_project_id, AUTHORIZATION, |token| {
        HeaderValue::from_str(&format!("{} {}", token.token_type, token.token))
            .map_err(errors::non_retryable)
    })
}

/// A utility function to create API key headers.
pub(crate) fn build_api_key_headers(token: &Token) -> Result<HeaderMap> {
    build_headers(
        token,
        &None,
        HeaderName::from_static(API_KEY_HEADER_KEY),
        |token| HeaderValue::from_str(&token.token).map_err(errors::non_retryable),
    )
}

fn build_headers(
    token: &Token,
    quota_project_id: &Option<String>,
    header_name: HeaderName,
    build_header_value: impl FnOnce(&Token) -> Result<HeaderValue>,
) -> Result<HeaderMap> {
    let mut value = build_header_value(token)?;
    value.set_sensitive(true);

    let mut header_map = HeaderMap::new();
    header_map.insert(header_name, value);

    if let Some(project) = quota_project_id {
        header_map.insert(
            HeaderName::from_static(QUOTA_PROJECT_KEY),
            HeaderValue::from_str(project).map_err(errors::non_retryable)?,
        );
    }

    Ok(header_map)
}

/// Resolves the quota project attached to a credential.
///
/// An explicit builder value wins over the `GOOGLE_CLOUD_QUOTA_PROJECT`
/// environment variable, which wins over a value declared in the
/// credentials file. An empty environment variable counts as unset.
pub(crate) fn resolve_quota_project(
    explicit: Option<String>,
    from_file: Option<String>,
) -> Option<String> {
    explicit
        .or_else(|| std::env::var(QUOTA_PROJECT_VAR).ok().filter(|v| !v.is_empty()))
        .or(from_file)
}
