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

use crate::credentials::external_account::SourceFormat;
use crate::credentials::subject_token::{
    Builder as SubjectTokenBuilder, SubjectToken, SubjectTokenProvider,
};
use crate::errors;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fetches the subject token from a local or remote HTTP endpoint.
///
/// Used by Azure and by OIDC providers that serve tokens over HTTP.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct UrlSourcedCredentials {
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub(crate) format: SourceFormat,
}

#[async_trait::async_trait]
impl SubjectTokenProvider for UrlSourcedCredentials {
    async fn subject_token(&self) -> Result<SubjectToken> {
        let client = reqwest::Client::new();
        let mut request = client.get(&self.url);
        for (name, value) in self.headers.iter().flatten() {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(errors::retryable)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(errors::non_retryable_from_str(format!(
                "failed to read the subject token from `{}`: status {status}, body=<{body}>",
                self.url
            )));
        }
        let content = response.text().await.map_err(errors::retryable)?;
        let token = self.format.extract(&content)?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn text_token() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(200).body("an_example_token")),
        );

        let provider = UrlSourcedCredentials {
            url: server.url_str("/token"),
            headers: None,
            format: SourceFormat::Text,
        };
        let resp = provider.subject_token().await?;
        assert_eq!(resp.token, "an_example_token");
        Ok(())
    }

    #[tokio::test]
    async fn json_token_with_headers() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/token"),
                request::headers(contains(("metadata", "True"))),
            ])
            .respond_with(json_encoded(json!({"id_token": "an_example_token"}))),
        );

        let provider = UrlSourcedCredentials {
            url: server.url_str("/token"),
            headers: Some(HashMap::from([("Metadata".to_string(), "True".to_string())])),
            format: SourceFormat::Json {
                subject_token_field_name: "id_token".to_string(),
            },
        };
        let resp = provider.subject_token().await?;
        assert_eq!(resp.token, "an_example_token");
        Ok(())
    }

    #[tokio::test]
    async fn error_status() -> TestResult {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(404).body("not here")),
        );

        let provider = UrlSourcedCredentials {
            url: server.url_str("/token"),
            headers: None,
            format: SourceFormat::Text,
        };
        let err = provider.subject_token().await.unwrap_err();
        assert!(err.to_string().contains("not here"), "{err}");
        Ok(())
    }
}
