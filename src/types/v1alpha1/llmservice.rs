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

use crate::types;
use crate::types::error::NoNamespaceSnafu;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use std::collections::BTreeMap;

mod rbac;
mod workloads;

pub use workloads::{DISTRIBUTION_PORT, INFERENCE_PORT};

/// How replicas of one LLMService obtain the model artifact.
///
/// `none` lets every pod pull from the external registry independently;
/// `shared` elects a single downloader that fans the files out to its
/// siblings over the pod network.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    None,
    Shared,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "kubeinfer.io",
    version = "v1alpha1",
    kind = "LLMService",
    namespaced,
    status = "crate::types::v1alpha1::status::Status",
    shortname = "llmsvc",
    plural = "llmservices",
    singular = "llmservice",
    printcolumn = r#"{"name":"Model", "type":"string", "jsonPath":".spec.model"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Coordinator", "type":"string", "jsonPath":".status.cacheCoordinator"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LLMServiceSpec {
    /// External registry identifier, e.g. "deepseek-ai/deepseek-r1".
    pub model: String,

    /// Number of inference pods to run.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default)]
    pub cache_strategy: CacheStrategy,

    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default)]
    pub gpu_per_replica: i32,

    /// Memory requirement per replica, e.g. "24Gi". Used for scheduling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

fn default_image() -> String {
    "vllm/vllm-openai:latest".to_owned()
}

impl LLMService {
    pub fn namespace(&self) -> Result<String, types::error::Error> {
        ResourceExt::namespace(self).context(NoNamespaceSnafu)
    }

    pub fn name(&self) -> String {
        ResourceExt::name_any(self)
    }

    /// a new owner reference for the LLMService
    pub fn new_owner_ref(&self) -> metav1::OwnerReference {
        metav1::OwnerReference {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name(),
            uid: self.meta().uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Labels stamped on the workload object and every replica pod.
    pub fn labels(&self) -> BTreeMap<String, String> {
        [
            ("app".to_owned(), "llm-inference".to_owned()),
            ("llm_cr".to_owned(), self.name()),
        ]
        .into_iter()
        .collect()
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name())
    }

    /// Name handed to agents through CONFIGMAP_NAME; the election Lease is
    /// derived from it so each LLMService has its own election.
    pub fn cache_config_name(&self) -> String {
        format!("{}-cache", self.name())
    }

    pub fn lease_name(&self) -> String {
        format!("{}-lease", self.cache_config_name())
    }

    pub fn service_account_name(&self) -> String {
        format!("{}-agent-sa", self.name())
    }

    pub fn role_name(&self) -> String {
        format!("{}-agent-role", self.name())
    }

    pub fn role_binding_name(&self) -> String {
        format!("{}-agent-role-binding", self.name())
    }

    pub fn shares_cache(&self) -> bool {
        self.spec.cache_strategy == CacheStrategy::Shared
    }
}

#[cfg(test)]
mod tests {
    use super::CacheStrategy;

    #[test]
    fn test_cache_strategy_wire_names_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&CacheStrategy::Shared).expect("serialize"),
            "\"shared\""
        );
        assert_eq!(
            serde_json::from_str::<CacheStrategy>("\"none\"").expect("deserialize"),
            CacheStrategy::None
        );
    }

    #[test]
    fn test_derived_names_follow_resource_name() {
        let llm = crate::tests::create_test_llmservice(3, CacheStrategy::Shared);

        assert_eq!(llm.deployment_name(), "test-llm-deployment");
        assert_eq!(llm.cache_config_name(), "test-llm-cache");
        assert_eq!(llm.lease_name(), "test-llm-cache-lease");
    }

    #[test]
    fn test_owner_ref_controls_children() {
        let llm = crate::tests::create_test_llmservice(1, CacheStrategy::None);
        let owner = llm.new_owner_ref();

        assert_eq!(owner.kind, "LLMService");
        assert_eq!(owner.name, "test-llm");
        assert_eq!(owner.controller, Some(true));
    }
}
