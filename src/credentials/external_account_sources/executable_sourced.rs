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

use crate::constants::{ACCESS_TOKEN_TYPE, JWT_TOKEN_TYPE, SAML2_TOKEN_TYPE};
use crate::credentials::subject_token::{
    Builder as SubjectTokenBuilder, SubjectToken, SubjectTokenProvider,
};
use crate::errors::{self, CredentialsError, ErrorKind};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::time::timeout as tokio_timeout;

const MSG: &str = "failed to read the subject token";
// The default timeout is part of the executable-sourced contract.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const ALLOW_EXECUTABLES_VAR: &str = "GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES";

/// Obtains the subject token by running a command configured in the
/// credentials file.
///
/// Running arbitrary commands from a configuration file is a security
/// hazard, so the workload must opt in by setting
/// `GOOGLE_EXTERNAL_ACCOUNT_ALLOW_EXECUTABLES=1`. When an `output_file` is
/// configured, a fresh response cached there by the executable is used
/// without re-running the command.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct ExecutableSourcedCredentials {
    pub(crate) executable: ExecutableConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct ExecutableConfig {
    pub(crate) command: String,
    pub(crate) timeout_millis: Option<u64>,
    pub(crate) output_file: Option<String>,
}

/// The JSON envelope an executable writes to stdout, or to its output
/// file.
#[derive(Debug, Deserialize, Serialize)]
struct ExecutableResponse {
    version: i32,
    success: bool,
    token_type: String,
    expiration_time: Option<i64>,
    id_token: Option<String>,
    saml_response: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

impl ExecutableResponse {
    fn failure_error(&self) -> CredentialsError {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => errors::non_retryable_from_str(format!(
                "{MSG}, the executable reported ({code}) {message}"
            )),
            _ => errors::non_retryable_from_str(format!(
                "{MSG}, an unsuccessful response must include `code` and `message` fields"
            )),
        }
    }

    fn is_expired(&self) -> bool {
        self.expiration_time
            .is_some_and(|t| t <= OffsetDateTime::now_utc().unix_timestamp())
    }

    fn into_token(self) -> Result<String> {
        if !self.success {
            return Err(self.failure_error());
        }
        match self.token_type.as_str() {
            JWT_TOKEN_TYPE | ACCESS_TOKEN_TYPE => self.id_token.ok_or_else(|| {
                errors::non_retryable_from_str(format!("{MSG}, missing `id_token` field"))
            }),
            SAML2_TOKEN_TYPE => self.saml_response.ok_or_else(|| {
                errors::non_retryable_from_str(format!("{MSG}, missing `saml_response` field"))
            }),
            other => Err(errors::non_retryable_from_str(format!(
                "{MSG}, unsupported token type `{other}`"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SubjectTokenProvider for ExecutableSourcedCredentials {
    async fn subject_token(&self) -> Result<SubjectToken> {
        if let Some(output_file) = &self.executable.output_file {
            if let Some(token) = Self::from_output_file(output_file).await {
                return Ok(SubjectTokenBuilder::new(token).build());
            }
        }
        let timeout = self
            .executable
            .timeout_millis
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_TIMEOUT);
        let output = Self::run_command(&self.executable.command, timeout).await?;
        let token = Self::parse_response(output.trim())?;
        if token.is_empty() {
            return Err(errors::non_retryable_from_str(format!(
                "{MSG}, the subject token is empty"
            )));
        }
        Ok(SubjectTokenBuilder::new(token).build())
    }
}

impl ExecutableSourcedCredentials {
    // A missing, malformed, unsuccessful, or expired output file is a
    // cache miss, not an error; the command is run instead.
    async fn from_output_file(output_file: &str) -> Option<String> {
        let content = tokio::fs::read_to_string(output_file).await.ok()?;
        let response = serde_json::from_str::<ExecutableResponse>(&content).ok()?;
        if !response.success || response.is_expired() {
            return None;
        }
        response.into_token().ok()
    }

    async fn run_command(command: &str, timeout: Duration) -> Result<String> {
        let allow = std::env::var(ALLOW_EXECUTABLES_VAR).unwrap_or_default();
        if allow != "1" {
            return Err(errors::non_retryable_from_str(format!(
                "executables must be explicitly allowed (set {ALLOW_EXECUTABLES_VAR} to '1') to run"
            )));
        }

        let (program, args) = split_command(command);
        let output = Command::new(program).args(&args).output();
        let output = tokio_timeout(timeout, output)
            .await
            .map_err(|e| CredentialsError::new(true, ErrorKind::Other, e))?
            .map_err(|e| CredentialsError::new(true, ErrorKind::Other, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| format!(", code={c}"))
                .unwrap_or_default();
            return Err(CredentialsError::from_str(
                true,
                ErrorKind::Other,
                format!("{MSG}, the command failed{code}, stderr=<{stderr}>"),
            ));
        }
        String::from_utf8(output.stdout).map_err(errors::non_retryable)
    }

    fn parse_response(output: &str) -> Result<String> {
        serde_json::from_str::<ExecutableResponse>(output)
            .map_err(errors::serialization)?
            .into_token()
    }
}

fn split_command(command: &str) -> (String, Vec<String>) {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some(program) => (program.to_string(), parts.map(String::from).collect()),
        None => (command.to_string(), vec![]),
    }
}
