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

use super::LLMService;
use k8s_openapi::api::apps::v1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

/// Port the inference server listens on inside each replica pod.
pub const INFERENCE_PORT: i32 = 8000;
/// Port the elected coordinator serves model files on.
pub const DISTRIBUTION_PORT: i32 = 8080;

const MODEL_VOLUME_NAME: &str = "model-cache";
const DEFAULT_MODEL_PATH: &str = "/models";

fn field_ref_env(name: &str, field_path: &str) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_owned(),
        value_from: Some(corev1::EnvVarSource {
            field_ref: Some(corev1::ObjectFieldSelector {
                field_path: field_path.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn literal_env(name: &str, value: String) -> corev1::EnvVar {
    corev1::EnvVar {
        name: name.to_owned(),
        value: Some(value),
        ..Default::default()
    }
}

impl LLMService {
    /// Derives the desired workload object from the spec.
    ///
    /// Pure function of the spec and object identity: equal inputs produce
    /// byte-equal Deployments, which keeps reconcile diffs meaningful.
    pub fn new_deployment(&self) -> v1::Deployment {
        let labels = self.labels();

        // The agent's operating contract: its own identity via the downward
        // API, the per-workload election anchor, and the model source/sink.
        let env_vars = vec![
            field_ref_env("POD_NAME", "metadata.name"),
            field_ref_env("POD_NAMESPACE", "metadata.namespace"),
            literal_env("CONFIGMAP_NAME", self.cache_config_name()),
            literal_env("MODEL_PATH", DEFAULT_MODEL_PATH.to_owned()),
            literal_env("MODEL_REPO", self.spec.model.clone()),
        ];

        let mut limits = std::collections::BTreeMap::new();
        if self.spec.gpu_per_replica > 0 {
            limits.insert(
                "nvidia.com/gpu".to_owned(),
                Quantity(self.spec.gpu_per_replica.to_string()),
            );
        }
        if let Some(memory) = &self.spec.gpu_memory {
            limits.insert("memory".to_owned(), Quantity(memory.clone()));
        }
        let resources = (!limits.is_empty()).then(|| corev1::ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        });

        let container = corev1::Container {
            name: "vllm".to_owned(),
            image: Some(self.spec.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_owned()),
            command: Some(vec!["kubeinfer-op".to_owned(), "agent".to_owned()]),
            env: Some(env_vars),
            ports: Some(vec![
                corev1::ContainerPort {
                    container_port: INFERENCE_PORT,
                    name: Some("http".to_owned()),
                    protocol: Some("TCP".to_owned()),
                    ..Default::default()
                },
                corev1::ContainerPort {
                    container_port: DISTRIBUTION_PORT,
                    name: Some("model-dist".to_owned()),
                    protocol: Some("TCP".to_owned()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![corev1::VolumeMount {
                name: MODEL_VOLUME_NAME.to_owned(),
                mount_path: DEFAULT_MODEL_PATH.to_owned(),
                ..Default::default()
            }]),
            resources,
            ..Default::default()
        };

        // Model storage is per-pod scratch space; durable storage is a
        // deliberate non-goal.
        let pod_volumes = vec![corev1::Volume {
            name: MODEL_VOLUME_NAME.to_owned(),
            empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
            ..Default::default()
        }];

        v1::Deployment {
            metadata: metav1::ObjectMeta {
                name: Some(self.deployment_name()),
                namespace: self.namespace().ok(),
                owner_references: Some(vec![self.new_owner_ref()]),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(v1::DeploymentSpec {
                replicas: Some(self.spec.replicas),
                selector: metav1::LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: corev1::PodTemplateSpec {
                    metadata: Some(metav1::ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(corev1::PodSpec {
                        service_account_name: self
                            .shares_cache()
                            .then(|| self.service_account_name()),
                        containers: vec![container],
                        volumes: Some(pod_volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_MODEL_PATH, DISTRIBUTION_PORT, INFERENCE_PORT, MODEL_VOLUME_NAME};
    use crate::types::v1alpha1::llmservice::CacheStrategy;

    #[test]
    fn test_deployment_derivation_is_deterministic() {
        let llm = crate::tests::create_test_llmservice(3, CacheStrategy::Shared);

        let first = serde_json::to_vec(&llm.new_deployment()).expect("serialize");
        let second = serde_json::to_vec(&llm.new_deployment()).expect("serialize");

        assert_eq!(first, second);
    }

    #[test]
    fn test_pod_template_carries_agent_contract() {
        let llm = crate::tests::create_test_llmservice(3, CacheStrategy::Shared);
        let deployment = llm.new_deployment();

        let pod_spec = deployment
            .spec
            .expect("Deployment should have spec")
            .template
            .spec
            .expect("Pod template should have spec");
        let container = &pod_spec.containers[0];
        let env = container.env.as_ref().expect("container env");

        let pod_name = env
            .iter()
            .find(|e| e.name == "POD_NAME")
            .expect("POD_NAME env");
        assert_eq!(
            pod_name
                .value_from
                .as_ref()
                .and_then(|v| v.field_ref.as_ref())
                .map(|f| f.field_path.as_str()),
            Some("metadata.name"),
            "POD_NAME must come from the downward API"
        );

        let by_name = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };
        assert_eq!(by_name("CONFIGMAP_NAME"), Some("test-llm-cache".to_owned()));
        assert_eq!(by_name("MODEL_PATH"), Some(DEFAULT_MODEL_PATH.to_owned()));
        assert_eq!(by_name("MODEL_REPO"), Some("acme/m-7b".to_owned()));

        let ports: Vec<i32> = container
            .ports
            .as_ref()
            .expect("container ports")
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert_eq!(ports, vec![INFERENCE_PORT, DISTRIBUTION_PORT]);
    }

    #[test]
    fn test_model_volume_is_ephemeral_scratch() {
        let llm = crate::tests::create_test_llmservice(1, CacheStrategy::Shared);
        let deployment = llm.new_deployment();

        let pod_spec = deployment
            .spec
            .expect("Deployment should have spec")
            .template
            .spec
            .expect("Pod template should have spec");

        let volume = pod_spec
            .volumes
            .as_ref()
            .and_then(|v| v.iter().find(|v| v.name == MODEL_VOLUME_NAME))
            .expect("model volume");
        assert!(volume.empty_dir.is_some(), "model volume must be emptyDir");

        let mount = pod_spec.containers[0]
            .volume_mounts
            .as_ref()
            .and_then(|m| m.iter().find(|m| m.name == MODEL_VOLUME_NAME))
            .expect("model volume mount");
        assert_eq!(mount.mount_path, DEFAULT_MODEL_PATH);
    }

    #[test]
    fn test_gpu_limits_present_only_when_requested() {
        let mut llm = crate::tests::create_test_llmservice(1, CacheStrategy::None);
        let pod_spec = llm
            .new_deployment()
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert!(pod_spec.containers[0].resources.is_none());

        llm.spec.gpu_per_replica = 2;
        llm.spec.gpu_memory = Some("24Gi".to_owned());
        let pod_spec = llm
            .new_deployment()
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        let resources = pod_spec.containers[0].resources.as_ref().expect("resources");

        let limits = resources.limits.as_ref().expect("limits");
        assert_eq!(
            limits.get("nvidia.com/gpu").map(|q| q.0.as_str()),
            Some("2")
        );
        assert_eq!(limits.get("memory").map(|q| q.0.as_str()), Some("24Gi"));
        assert!(
            resources.requests.is_none(),
            "scheduling hints are expressed as limits only"
        );
    }

    #[test]
    fn test_service_account_only_for_shared_cache() {
        let shared = crate::tests::create_test_llmservice(2, CacheStrategy::Shared);
        let pod_spec = shared
            .new_deployment()
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some("test-llm-agent-sa")
        );

        let isolated = crate::tests::create_test_llmservice(2, CacheStrategy::None);
        let pod_spec = isolated
            .new_deployment()
            .spec
            .expect("spec")
            .template
            .spec
            .expect("pod spec");
        assert_eq!(pod_spec.service_account_name, None);
    }
}
