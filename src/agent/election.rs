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

//! Coordinator election on a Kubernetes Lease.
//!
//! Every candidate runs the same tick: read the Lease, then create, renew
//! or take over depending on holder and expiry. All writes carry the
//! resourceVersion read in the same tick, so the API server serializes
//! concurrent acquires and exactly one challenger wins.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use snafu::Snafu;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum time a holder may go unrenewed before challengers take over.
const LEASE_DURATION: Duration = Duration::from_secs(15);
/// Interval at which every candidate re-evaluates; the holder renews on
/// each tick, well inside half the lease duration.
const RETRY_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },
}

pub struct LeaseManager {
    api: Api<Lease>,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    retry_period: Duration,
    is_holder: RwLock<bool>,
}

impl LeaseManager {
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_owned(),
            namespace: namespace.to_owned(),
            identity: identity.to_owned(),
            lease_duration: LEASE_DURATION,
            retry_period: RETRY_PERIOD,
            is_holder: RwLock::new(false),
        }
    }

    pub async fn is_holder(&self) -> bool {
        *self.is_holder.read().await
    }

    /// Election loop. `on_elected`/`on_lost` fire on role transitions and
    /// must only spawn their work; a slow callback would delay renewal and
    /// forfeit the lease. Cancelling `token` demotes locally and fires
    /// `on_lost` exactly once if this pod was the holder.
    pub async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        mut on_elected: impl FnMut(),
        mut on_lost: impl FnMut(),
    ) {
        info!(
            lease = %self.lease_name,
            identity = %self.identity,
            "starting election loop"
        );

        let mut ticker = tokio::time::interval(self.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<bool> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let acquired = match self.try_acquire_or_renew().await {
                        Ok(acquired) => acquired,
                        Err(e) => {
                            warn!(error = %e, "election tick failed");
                            false
                        }
                    };

                    if last != Some(acquired) {
                        *self.is_holder.write().await = acquired;
                        if acquired {
                            info!(identity = %self.identity, "elected coordinator");
                            on_elected();
                        } else {
                            info!(identity = %self.identity, "assuming follower role");
                            on_lost();
                        }
                        last = Some(acquired);
                    }
                }
                _ = token.cancelled() => {
                    if last == Some(true) {
                        *self.is_holder.write().await = false;
                        on_lost();
                    }
                    info!(lease = %self.lease_name, "election loop stopped");
                    return;
                }
            }
        }
    }

    /// One election tick: a single read plus at most one conditional write.
    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let lease = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.create_lease().await,
            Err(e) => return Err(Error::Kube { source: e }),
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(lease).await;
        }

        if lease
            .spec
            .as_ref()
            .is_none_or(|spec| spec.renew_time.is_none())
        {
            warn!(
                lease = %self.lease_name,
                "lease has no renew time, possibly created by another program; treating as expired"
            );
        }

        if is_expired(&lease, self.lease_duration, Utc::now()) {
            info!(
                lease = %self.lease_name,
                previous = holder.unwrap_or("<none>"),
                "lease expired, attempting takeover"
            );
            return self.take_over_lease(lease).await;
        }

        debug!(
            lease = %self.lease_name,
            holder = holder.unwrap_or("<none>"),
            "lease held by another pod"
        );
        Ok(false)
    }

    async fn create_lease(&self) -> Result<bool, Error> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.lease_name, "created lease, became coordinator");
                Ok(true)
            }
            // Another pod created it between our read and write.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube { source: e }),
        }
    }

    /// Renews a lease this pod holds. The replace carries the
    /// resourceVersion from the read; a conflict means another pod took
    /// ownership and this pod demotes on the spot.
    async fn renew_lease(&self, mut lease: Lease) -> Result<bool, Error> {
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.renew_time = Some(MicroTime(Utc::now()));

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(lease = %self.lease_name, "renewed lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(lease = %self.lease_name, "lease renewal conflicted, demoting");
                Ok(false)
            }
            Err(e) => Err(Error::Kube { source: e }),
        }
    }

    async fn take_over_lease(&self, mut lease: Lease) -> Result<bool, Error> {
        let now = MicroTime(Utc::now());
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let transitions = spec.lease_transitions.unwrap_or(0);
        spec.holder_identity = Some(self.identity.clone());
        spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);
        spec.acquire_time = Some(now.clone());
        spec.renew_time = Some(now);
        spec.lease_transitions = Some(transitions + 1);

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    lease = %self.lease_name,
                    transitions = transitions + 1,
                    "took over expired lease"
                );
                Ok(true)
            }
            // Lost the race to another challenger.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(Error::Kube { source: e }),
        }
    }
}

fn is_expired(lease: &Lease, lease_duration: Duration, now: DateTime<Utc>) -> bool {
    let Some(renew_time) = lease.spec.as_ref().and_then(|spec| spec.renew_time.as_ref()) else {
        return true;
    };
    now > renew_time.0 + chrono::Duration::seconds(lease_duration.as_secs() as i64)
}
