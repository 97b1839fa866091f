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
use crate::types::v1alpha1::llmservice::LLMService;
use crate::types::v1alpha1::status::{Condition, Status};
use crate::{context, types};
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::coordination::v1::Lease;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(transparent)]
    Context { source: context::Error },

    #[snafu(transparent)]
    Types { source: types::error::Error },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Context { source } if source.is_not_found())
    }
}

pub async fn reconcile_llmservice(llm: Arc<LLMService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = llm.namespace()?;
    let latest: LLMService = ctx.get(&llm.name(), &ns).await?;

    if latest.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    // Workload object: create when absent, then requeue for the status pass
    // once pods exist. In-place spec updates are a follow-up design.
    let deployment = match ctx
        .get::<appsv1::Deployment>(&latest.deployment_name(), &ns)
        .await
    {
        Ok(found) => found,
        Err(e) if e.is_not_found() => {
            return create_workload(&latest, &ctx, &ns).await;
        }
        Err(e) => return Err(e.into()),
    };

    if latest.shares_cache() {
        // The replica pods run their own election; they need pod read and
        // lease write permissions to do it.
        let role = ctx.apply(&latest.new_role(), &ns).await?;
        let sa = ctx.apply(&latest.new_service_account(), &ns).await?;
        ctx.apply(
            &latest.new_role_binding(&sa.metadata.name.clone().unwrap_or_default(), &role),
            &ns,
        )
        .await?;
    }

    // Snapshot consistency: the count written below is the count read from
    // the Deployment fetched in this same pass.
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    let previous = latest.status.clone().unwrap_or_default();
    let mut status = Status {
        available_replicas: available,
        cache_coordinator: previous.cache_coordinator.clone(),
        conditions: ready_conditions(&previous.conditions, available, latest.spec.replicas),
    };

    if latest.shares_cache()
        && let Some(holder) = observe_coordinator(&latest, &ctx, &ns).await?
    {
        status.cache_coordinator = Some(holder);
    }

    ctx.update_status(&latest, status).await?;

    Ok(Action::await_change())
}

async fn create_workload(
    llm: &LLMService,
    ctx: &Context,
    ns: &str,
) -> Result<Action, Error> {
    let desired = llm.new_deployment();
    info!(
        deployment = %llm.deployment_name(),
        namespace = ns,
        "creating workload for LLMService"
    );

    if let Err(e) = ctx.create(&desired, ns).await {
        let _ = ctx
            .record(
                llm,
                EventType::Warning,
                "CreateFailed",
                &format!("failed to create Deployment {}: {}", llm.deployment_name(), e),
            )
            .await;
        return Err(e.into());
    }

    ctx.record(
        llm,
        EventType::Normal,
        "Created",
        &format!("created Deployment {}", llm.deployment_name()),
    )
    .await?;

    // Creation is not an error; pods just are not ready yet.
    Ok(Action::requeue(Duration::from_secs(2)))
}

/// Mirrors the election holder into the status and adopts the Lease so it
/// is garbage-collected with the LLMService. The Lease stays authoritative;
/// this field is informational.
async fn observe_coordinator(
    llm: &LLMService,
    ctx: &Context,
    ns: &str,
) -> Result<Option<String>, Error> {
    let lease = match ctx.get::<Lease>(&llm.lease_name(), ns).await {
        Ok(lease) => lease,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if lease
        .metadata
        .owner_references
        .as_ref()
        .is_none_or(|refs| refs.is_empty())
    {
        let patch = serde_json::json!({
            "metadata": { "ownerReferences": [llm.new_owner_ref()] }
        });
        ctx.patch_merge::<Lease, _>(&llm.lease_name(), ns, &patch)
            .await?;
    }

    Ok(lease.spec.and_then(|s| s.holder_identity))
}

/// Refreshes the Ready condition only when its truth value flips, so a
/// steady-state reconcile produces a byte-identical status write.
fn ready_conditions(previous: &[Condition], available: i32, desired: i32) -> Vec<Condition> {
    let ready = available >= desired;
    if let Some(existing) = previous.iter().find(|c| c.type_ == "Ready")
        && (existing.status == "True") == ready
    {
        return previous.to_vec();
    }

    let (reason, message) = if ready {
        ("WorkloadReady", format!("{available}/{desired} replicas ready"))
    } else {
        ("WorkloadPending", format!("{available}/{desired} replicas ready"))
    };
    vec![Condition::new("Ready", ready, reason, &message)]
}
