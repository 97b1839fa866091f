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

use crate::types::v1alpha1::llmservice::{CacheStrategy, LLMService, LLMServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

// Helper function to create a test LLMService (available to submodule tests
// via crate::tests)
pub fn create_test_llmservice(replicas: i32, cache_strategy: CacheStrategy) -> LLMService {
    LLMService {
        metadata: metav1::ObjectMeta {
            name: Some("test-llm".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("test-uid-123".to_string()),
            ..Default::default()
        },
        spec: LLMServiceSpec {
            model: "acme/m-7b".to_string(),
            replicas,
            cache_strategy,
            image: "vllm/vllm-openai:latest".to_string(),
            gpu_per_replica: 0,
            gpu_memory: None,
        },
        status: None,
    }
}
