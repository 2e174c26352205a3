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

//! OAuth2 Secure Token Service (STS) exchange.
//!
//! Reference: <https://datatracker.ietf.org/doc/html/rfc8693>

use crate::constants::{ACCESS_TOKEN_TYPE, TOKEN_EXCHANGE_GRANT_TYPE};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::Result;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::Deserialize;
use std::collections::HashMap;

/// The grant type of a refresh-token exchange.
pub(crate) const REFRESH_TOKEN_GRANT_TYPE: &str = "refresh_token";

/// Performs an RFC 8693 token exchange with the provided
/// [ExchangeTokenRequest] information.
pub(crate) async fn exchange_token(req: ExchangeTokenRequest) -> Result<TokenResponse> {
    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", TOKEN_EXCHANGE_GRANT_TYPE.to_string());
    params.insert("requested_token_type", ACCESS_TOKEN_TYPE.to_string());
    params.insert("subject_token", req.subject_token);
    params.insert("subject_token_type", req.subject_token_type);
    if !req.scope.is_empty() {
        params.insert("scope", req.scope.join(" "));
    }
    if let Some(audience) = req.audience {
        params.insert("audience", audience);
    }
    if let Some(options) = req.extra_options {
        if let Ok(value) = serde_json::to_value(options) {
            params.insert("options", value.to_string());
        }
    }
    execute(req.url, req.authentication, params).await
}

/// Performs a refresh-token exchange with the provided
/// [RefreshAccessTokenRequest] information.
pub(crate) async fn refresh_access_token(
    req: RefreshAccessTokenRequest,
) -> Result<TokenResponse> {
    let mut params: HashMap<&str, String> = HashMap::new();
    params.insert("grant_type", REFRESH_TOKEN_GRANT_TYPE.to_string());
    params.insert("refresh_token", req.refresh_token);
    execute(req.url, req.authentication, params).await
}

async fn execute(
    url: String,
    client_auth: ClientAuthentication,
    mut params: HashMap<&str, String>,
) -> Result<TokenResponse> {
    let mut headers = http::HeaderMap::new();
    client_auth.inject_auth(&mut headers, &mut params);

    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .form(&params)
        .headers(headers)
        .send()
        .await
        .map_err(errors::retryable)?;

    if !response.status().is_success() {
        return Err(errors::from_http_response(response, "the token exchange failed").await);
    }
    response.json::<TokenResponse>().await.map_err(|e| {
        let retryable = !e.is_decode();
        CredentialsError::new(retryable, ErrorKind::TokenRefresh, e)
    })
}

/// Decodes the remote server response of a token exchange.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    #[serde(default = "default_token_type")]
    pub(crate) token_type: String,
    pub(crate) expires_in: Option<u64>,
    pub(crate) refresh_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// An OAuth client id and secret, and the mechanism for passing them, as
/// stated in <https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1>.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClientAuthentication {
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
}

impl ClientAuthentication {
    // Adds authentication to an exchange request. A client id and secret
    // pair travels in a `Basic` Authorization header; an id alone as form
    // parameters.
    fn inject_auth(&self, headers: &mut http::HeaderMap, params: &mut HashMap<&str, String>) {
        match (self.client_id.clone(), self.client_secret.clone()) {
            (Some(client_id), Some(client_secret)) => {
                let encoded = BASE64_STANDARD.encode(format!("{client_id}:{client_secret}"));
                if let Ok(mut value) =
                    http::HeaderValue::from_str(format!("Basic {encoded}").as_str())
                {
                    value.set_sensitive(true);
                    headers.insert(http::header::AUTHORIZATION, value);
                }
            }
            (Some(client_id), None) => {
                params.insert("client_id", client_id);
            }
            _ => {}
        }
    }
}

/// The information required to perform a token exchange.
#[derive(Default)]
pub(crate) struct ExchangeTokenRequest {
    pub(crate) url: String,
    pub(crate) authentication: ClientAuthentication,
    pub(crate) subject_token: String,
    pub(crate) subject_token_type: String,
    pub(crate) audience: Option<String>,
    pub(crate) scope: Vec<String>,
    pub(crate) extra_options: Option<HashMap<String, String>>,
}

/// The information required to perform a refresh-token exchange.
#[derive(Default)]
pub(crate) struct RefreshAccessTokenRequest {
    pub(crate) url: String,
    pub(crate) authentication: ClientAuthentication,
    pub(crate) refresh_token: String,
}
