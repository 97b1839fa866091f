// Copyright 2026 KubeInfer Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use snafu::{OptionExt, Snafu};
use std::path::PathBuf;

const DEFAULT_MODEL_PATH: &str = "/models";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("required environment variable {} is not set", name))]
    MissingEnv { name: String },
}

/// Pod-local configuration, read once at startup from the environment the
/// controller stamped into the pod template.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub pod_name: String,
    pub namespace: String,
    pub configmap_name: String,
    pub model_path: PathBuf,
    /// Only the coordinator download path needs this; followers copy from
    /// the coordinator instead.
    pub model_repo: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .context(MissingEnvSnafu { name })
        };

        Ok(Self {
            pod_name: required("POD_NAME")?,
            namespace: required("POD_NAMESPACE")?,
            configmap_name: required("CONFIGMAP_NAME")?,
            model_path: lookup("MODEL_PATH")
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_PATH.to_owned())
                .into(),
            model_repo: lookup("MODEL_REPO").filter(|value| !value.is_empty()),
        })
    }

    /// One Lease per logical workload, so each LLMService elects its own
    /// coordinator.
    pub fn lease_name(&self) -> String {
        format!("{}-lease", self.configmap_name)
    }
}

#[cfg(test)]
mod tests {
    use super::AgentConfig;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_reads_contract_and_defaults_model_path() {
        let vars = env(&[
            ("POD_NAME", "my-llm-deployment-abc"),
            ("POD_NAMESPACE", "default"),
            ("CONFIGMAP_NAME", "my-llm-cache"),
            ("MODEL_REPO", "acme/m-7b"),
        ]);

        let config =
            AgentConfig::from_lookup(|name| vars.get(name).cloned()).expect("valid config");

        assert_eq!(config.pod_name, "my-llm-deployment-abc");
        assert_eq!(config.model_path.to_str(), Some("/models"));
        assert_eq!(config.model_repo.as_deref(), Some("acme/m-7b"));
        assert_eq!(config.lease_name(), "my-llm-cache-lease");
    }

    #[test]
    fn test_missing_required_env_is_rejected() {
        let vars = env(&[("POD_NAME", "pod-0"), ("POD_NAMESPACE", "default")]);

        let err = AgentConfig::from_lookup(|name| vars.get(name).cloned())
            .expect_err("CONFIGMAP_NAME is required");
        assert!(err.to_string().contains("CONFIGMAP_NAME"));
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let vars = env(&[
            ("POD_NAME", ""),
            ("POD_NAMESPACE", "default"),
            ("CONFIGMAP_NAME", "cache"),
        ]);

        let err = AgentConfig::from_lookup(|name| vars.get(name).cloned())
            .expect_err("empty POD_NAME is invalid");
        assert!(err.to_string().contains("POD_NAME"));
    }

    #[test]
    fn test_model_path_override() {
        let vars = env(&[
            ("POD_NAME", "pod-0"),
            ("POD_NAMESPACE", "default"),
            ("CONFIGMAP_NAME", "cache"),
            ("MODEL_PATH", "/cache/models"),
        ]);

        let config = AgentConfig::from_lookup(|name| vars.get(name).cloned()).expect("valid");
        assert_eq!(config.model_path.to_str(), Some("/cache/models"));
        assert_eq!(config.model_repo, None);
    }
}
