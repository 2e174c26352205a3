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

/// Reads the subject token from a file on the local filesystem.
///
/// The identity provider, or an agent running next to the workload, is
/// expected to keep the file current.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct FileSourcedCredentials {
    pub(crate) file: String,
    #[serde(default)]
    pub(crate) format: SourceFormat,
}

#[async_trait::async_trait]
impl SubjectTokenProvider for FileSourcedCredentials {
    async fn subject_token(&self) -> Result<SubjectToken> {
        let content = tokio::fs::read_to_string(&self.file)
            .await
            .map_err(errors::non_retryable)?;
        let token = self.format.extract(&content)?;
        Ok(SubjectTokenBuilder::new(token).build())
    }
}
