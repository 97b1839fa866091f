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
use k8s_openapi::Resource as _;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::ResourceExt;

impl LLMService {
    pub fn new_service_account(&self) -> corev1::ServiceAccount {
        corev1::ServiceAccount {
            metadata: metav1::ObjectMeta {
                name: Some(self.service_account_name()),
                namespace: self.namespace().ok(),
                owner_references: Some(vec![self.new_owner_ref()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Namespace-scoped permissions for the replica agents: they read pods
    /// to resolve the coordinator's IP and drive the election through the
    /// workload Lease.
    pub fn new_role(&self) -> rbacv1::Role {
        rbacv1::Role {
            metadata: metav1::ObjectMeta {
                name: Some(self.role_name()),
                namespace: self.namespace().ok(),
                owner_references: Some(vec![self.new_owner_ref()]),
                ..Default::default()
            },
            rules: Some(vec![
                rbacv1::PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_owned()]),
                    verbs: vec!["get".to_owned(), "list".to_owned(), "watch".to_owned()],
                    ..Default::default()
                },
                rbacv1::PolicyRule {
                    api_groups: Some(vec!["coordination.k8s.io".to_owned()]),
                    resources: Some(vec!["leases".to_owned()]),
                    verbs: vec![
                        "get".to_owned(),
                        "list".to_owned(),
                        "watch".to_owned(),
                        "create".to_owned(),
                        "update".to_owned(),
                    ],
                    ..Default::default()
                },
            ]),
        }
    }

    pub fn new_role_binding(&self, sa_name: &str, role: &rbacv1::Role) -> rbacv1::RoleBinding {
        rbacv1::RoleBinding {
            metadata: metav1::ObjectMeta {
                name: Some(self.role_binding_name()),
                namespace: self.namespace().ok(),
                owner_references: Some(vec![self.new_owner_ref()]),
                ..Default::default()
            },
            subjects: Some(vec![rbacv1::Subject {
                kind: corev1::ServiceAccount::KIND.to_owned(),
                namespace: self.namespace().ok(),
                name: sa_name.to_owned(),
                ..Default::default()
            }]),
            role_ref: rbacv1::RoleRef {
                api_group: rbacv1::Role::GROUP.to_owned(),
                kind: rbacv1::Role::KIND.to_owned(),
                name: role.name_any(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::types::v1alpha1::llmservice::CacheStrategy;

    #[test]
    fn test_agent_role_covers_pods_and_leases() {
        let llm = crate::tests::create_test_llmservice(2, CacheStrategy::Shared);
        let role = llm.new_role();
        let rules = role.rules.expect("role rules");

        let lease_rule = rules
            .iter()
            .find(|r| {
                r.resources
                    .as_ref()
                    .is_some_and(|res| res.contains(&"leases".to_owned()))
            })
            .expect("lease rule");
        for verb in ["get", "create", "update"] {
            assert!(
                lease_rule.verbs.contains(&verb.to_owned()),
                "lease rule missing verb {verb}"
            );
        }

        let pod_rule = rules
            .iter()
            .find(|r| {
                r.resources
                    .as_ref()
                    .is_some_and(|res| res.contains(&"pods".to_owned()))
            })
            .expect("pod rule");
        assert!(!pod_rule.verbs.contains(&"delete".to_owned()));
    }

    #[test]
    fn test_role_binding_points_at_agent_service_account() {
        let llm = crate::tests::create_test_llmservice(2, CacheStrategy::Shared);
        let role = llm.new_role();
        let binding = llm.new_role_binding(&llm.service_account_name(), &role);

        assert_eq!(binding.role_ref.name, "test-llm-agent-role");
        let subjects = binding.subjects.expect("subjects");
        assert_eq!(subjects[0].name, "test-llm-agent-sa");
    }
}
