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

use crate::context::Context;
use crate::reconcile::Error;
use crate::types::v1alpha1::llmservice::LLMService;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// A missing top-level object means it was deleted; everything else is a
/// transient platform failure handled by the scheduler's retry loop.
pub fn error_policy(_object: Arc<LLMService>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_not_found() {
        Action::await_change()
    } else {
        error!("{:?}", error);
        Action::requeue(Duration::from_secs(5))
    }
}
