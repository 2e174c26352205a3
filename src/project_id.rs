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

//! Project id detection sources other than the credentials themselves.

use crate::constants::{ADC_PATH_VAR, ADC_PATH_VAR_LOWER};
use crate::credentials::mds;
use serde_json::Value;

/// The project id named by the environment, if any.
///
/// `GCLOUD_PROJECT` wins over `GOOGLE_CLOUD_PROJECT`; lower-case spellings
/// of either are accepted.
pub(crate) fn from_env() -> Option<String> {
    [
        "GCLOUD_PROJECT",
        "gcloud_project",
        "GOOGLE_CLOUD_PROJECT",
        "google_cloud_project",
    ]
    .iter()
    .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

/// The `project_id` embedded in a credentials file.
///
/// Reads the file named by `key_file`, or by the
/// `GOOGLE_APPLICATION_CREDENTIALS` environment variable. Unreadable or
/// malformed files yield nothing; this is a detection source, not a
/// loader.
pub(crate) async fn from_credentials_file(key_file: Option<&str>) -> Option<String> {
    let path = key_file.map(str::to_string).or_else(|| {
        std::env::var(ADC_PATH_VAR)
            .ok()
            .or_else(|| std::env::var(ADC_PATH_VAR_LOWER).ok())
            .filter(|p| !p.is_empty())
    })?;
    let contents = tokio::fs::read_to_string(&path).await.ok()?;
    let json: Value = serde_json::from_str(&contents).ok()?;
    json.get("project_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The project configured in the local gcloud installation, if any.
///
/// Runs `gcloud config config-helper --format json` and reads
/// `configuration.properties.core.project` from its output. Used as a
/// late detection source only; a missing or broken gcloud yields nothing.
pub(crate) async fn from_gcloud_config() -> Option<String> {
    let gcloud = if cfg!(windows) { "gcloud.cmd" } else { "gcloud" };
    let output = tokio::process::Command::new(gcloud)
        .args(["config", "config-helper", "--format", "json"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_config_helper(&output.stdout)
}

fn parse_config_helper(stdout: &[u8]) -> Option<String> {
    let json: Value = serde_json::from_slice(stdout).ok()?;
    json.pointer("/configuration/properties/core/project")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// The project id reported by the metadata service, if reachable.
pub(crate) async fn from_metadata() -> Option<String> {
    mds::get(&mds::default_endpoint(), "project/project-id")
        .await
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_env::ScopedEnv;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn env_precedence() {
        let _e1 = ScopedEnv::set("GCLOUD_PROJECT", "from-gcloud-var");
        let _e2 = ScopedEnv::set("GOOGLE_CLOUD_PROJECT", "from-google-var");
        assert_eq!(from_env().as_deref(), Some("from-gcloud-var"));
    }

    #[test]
    #[serial]
    fn env_fallback_to_google_cloud_project() {
        let _e1 = ScopedEnv::remove("GCLOUD_PROJECT");
        let _e2 = ScopedEnv::remove("gcloud_project");
        let _e3 = ScopedEnv::set("GOOGLE_CLOUD_PROJECT", "from-google-var");
        assert_eq!(from_env().as_deref(), Some("from-google-var"));
    }

    #[test]
    #[serial]
    fn env_empty_is_unset() {
        let _e1 = ScopedEnv::set("GCLOUD_PROJECT", "");
        let _e2 = ScopedEnv::remove("gcloud_project");
        let _e3 = ScopedEnv::remove("GOOGLE_CLOUD_PROJECT");
        let _e4 = ScopedEnv::remove("google_cloud_project");
        assert_eq!(from_env(), None);
    }

    #[tokio::test]
    #[serial]
    async fn credentials_file_project_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file.as_file_mut(),
            r#"{{"type": "service_account", "project_id": "from-file"}}"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        // An explicit key file wins over the environment variable.
        let _e = ScopedEnv::set(ADC_PATH_VAR, "/does/not/exist.json");
        assert_eq!(
            from_credentials_file(Some(path)).await.as_deref(),
            Some("from-file")
        );

        let _e2 = ScopedEnv::set(ADC_PATH_VAR, path);
        assert_eq!(from_credentials_file(None).await.as_deref(), Some("from-file"));
    }

    #[tokio::test]
    #[serial]
    async fn credentials_file_missing_yields_none() {
        let _e1 = ScopedEnv::remove(ADC_PATH_VAR);
        let _e2 = ScopedEnv::remove(ADC_PATH_VAR_LOWER);
        assert_eq!(from_credentials_file(None).await, None);
        assert_eq!(from_credentials_file(Some("/does/not/exist.json")).await, None);
    }

    #[test]
    fn config_helper_output_parsed() {
        let stdout = serde_json::json!({
            "configuration": {
                "active_configuration": "default",
                "properties": {
                    "core": {
                        "account": "user@example.com",
                        "project": "from-gcloud-config",
                    }
                }
            }
        })
        .to_string();
        assert_eq!(
            parse_config_helper(stdout.as_bytes()).as_deref(),
            Some("from-gcloud-config")
        );
        assert_eq!(parse_config_helper(b"not json"), None);
        assert_eq!(parse_config_helper(b"{}"), None);
    }
}
