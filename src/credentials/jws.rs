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

//! JSON Web Signature segments used by the service account flows.

use crate::errors;
use crate::Result;
use base64::prelude::{Engine as _, BASE64_URL_SAFE_NO_PAD};
use std::time::Duration;
use time::OffsetDateTime;

/// Issued-at claims are backdated to tolerate clocks that run slightly
/// ahead of the authorization server.
pub(crate) const CLOCK_SKEW_FUDGE: Duration = Duration::from_secs(10);

/// The lifetime of a self-signed assertion.
pub(crate) const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(3600);

/// The claim set of a service account assertion.
///
/// See <https://google.aip.dev/auth/4111> for how the claims are used.
#[derive(serde::Serialize)]
pub(crate) struct JwsClaims {
    pub(crate) iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) target_audience: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub(crate) iat: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub(crate) exp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sub: Option<String>,
}

impl JwsClaims {
    pub(crate) fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self).map_err(errors::serialization)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json))
    }
}

/// The header of a service account assertion.
#[derive(serde::Serialize)]
pub(crate) struct JwsHeader<'a> {
    pub(crate) alg: &'a str,
    pub(crate) typ: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub(crate) kid: &'a str,
}

impl JwsHeader<'_> {
    pub(crate) fn encode(&self) -> Result<String> {
        let json = serde_json::to_string(&self).map_err(errors::serialization)?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json))
    }
}
