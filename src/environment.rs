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

//! Classification of the Google Cloud runtime environment.
//!
//! Serverless products set well-known environment variables; everything
//! else is told apart through the metadata service. The classification is
//! cached for the lifetime of the process.

use crate::credentials::mds;
use std::sync::{LazyLock, Mutex as StdMutex};
use tokio::sync::Mutex;

/// The runtime environments this crate can tell apart.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloudEnvironment {
    /// A Google Compute Engine VM.
    ComputeEngine,
    /// A Google Kubernetes Engine node or pod.
    KubernetesEngine,
    /// A Cloud Run service or job.
    CloudRun,
    /// A Cloud Functions function.
    CloudFunctions,
    /// An App Engine service.
    AppEngine,
    /// Not a recognized Google Cloud environment.
    None,
}

static DETECTED: LazyLock<StdMutex<Option<CloudEnvironment>>> =
    LazyLock::new(|| StdMutex::new(None));
static DETECT_GUARD: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Clears the cached classification. Intended for tests.
pub fn reset_detection() {
    *DETECTED.lock().unwrap() = None;
}

/// Classifies the runtime environment, caching the result process-wide.
pub async fn detect() -> CloudEnvironment {
    if let Some(cached) = *DETECTED.lock().unwrap() {
        return cached;
    }
    let _guard = DETECT_GUARD.lock().await;
    if let Some(cached) = *DETECTED.lock().unwrap() {
        return cached;
    }
    let detected = classify().await;
    *DETECTED.lock().unwrap() = Some(detected);
    detected
}

fn env_set(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty())
}

async fn classify() -> CloudEnvironment {
    if env_set("K_CONFIGURATION") && mds::is_running_on_gce().await {
        return CloudEnvironment::CloudRun;
    }
    if env_set("FUNCTION_NAME") || env_set("FUNCTION_TARGET") {
        return CloudEnvironment::CloudFunctions;
    }
    if env_set("GAE_SERVICE") {
        return CloudEnvironment::AppEngine;
    }
    if mds::is_running_on_gce().await {
        // GKE nodes expose the cluster name as an instance attribute.
        if mds::get(&mds::default_endpoint(), "instance/attributes/cluster-name")
            .await
            .is_ok()
        {
            return CloudEnvironment::KubernetesEngine;
        }
        return CloudEnvironment::ComputeEngine;
    }
    CloudEnvironment::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use scoped_env::ScopedEnv;
    use serial_test::serial;

    struct DetectionReset;

    impl Drop for DetectionReset {
        fn drop(&mut self) {
            reset_detection();
            mds::reset_gce_detection();
        }
    }

    fn fresh_detection() -> DetectionReset {
        reset_detection();
        mds::reset_gce_detection();
        DetectionReset
    }

    fn clear_env() -> Vec<ScopedEnv<&'static str>> {
        [
            "K_CONFIGURATION",
            "FUNCTION_NAME",
            "FUNCTION_TARGET",
            "GAE_SERVICE",
            "GCE_METADATA_HOST",
            "NO_GCE_CHECK",
        ]
        .map(ScopedEnv::remove)
        .into_iter()
        .collect()
    }

    #[tokio::test]
    #[serial]
    async fn cloud_functions_detected_without_probe() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let _e = ScopedEnv::set("FUNCTION_TARGET", "handler");
        assert_eq!(detect().await, CloudEnvironment::CloudFunctions);
    }

    #[tokio::test]
    #[serial]
    async fn app_engine_detected_without_probe() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let _e = ScopedEnv::set("GAE_SERVICE", "default");
        assert_eq!(detect().await, CloudEnvironment::AppEngine);
    }

    #[tokio::test]
    #[serial]
    async fn cloud_run_requires_metadata_service() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/computeMetadata/v1/instance"))
                .times(0..)
                .respond_with(status_code(200).body("ok")),
        );
        let _e1 = ScopedEnv::set("K_CONFIGURATION", "my-service");
        let metadata_host_url = server.url_str("");
        let _e2 = ScopedEnv::set("GCE_METADATA_HOST", &metadata_host_url);
        assert_eq!(detect().await, CloudEnvironment::CloudRun);
    }

    #[tokio::test]
    #[serial]
    async fn kubernetes_engine_detected_via_cluster_name() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/instance/attributes/cluster-name",
            ))
            .respond_with(status_code(200).body("my-cluster")),
        );
        let metadata_host_url = server.url_str("");
        let _e = ScopedEnv::set("GCE_METADATA_HOST", &metadata_host_url);
        assert_eq!(detect().await, CloudEnvironment::KubernetesEngine);
    }

    #[tokio::test]
    #[serial]
    async fn compute_engine_when_no_cluster_name() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/computeMetadata/v1/instance/attributes/cluster-name",
            ))
            .respond_with(status_code(404).body("not found")),
        );
        let _e = ScopedEnv::set("GCE_METADATA_HOST", server.url_str(""));
        assert_eq!(detect().await, CloudEnvironment::ComputeEngine);
    }

    #[tokio::test]
    #[serial]
    async fn detection_is_cached() {
        let _env = clear_env();
        let _reset = fresh_detection();
        let _e = ScopedEnv::set("GAE_SERVICE", "default");
        assert_eq!(detect().await, CloudEnvironment::AppEngine);

        // The classification sticks until reset, even when the
        // environment changes.
        drop(_e);
        assert_eq!(detect().await, CloudEnvironment::AppEngine);
        reset_detection();
    }
}
