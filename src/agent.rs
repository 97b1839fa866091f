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

//! Replica-local agent.
//!
//! Every inference pod runs one agent. It joins the per-workload election
//! and flips between two roles: the coordinator downloads the model from
//! the external registry and serves it to siblings, a follower pulls the
//! files from the coordinator. Both end up launching the inference server.

use crate::agent::config::AgentConfig;
use crate::agent::election::LeaseManager;
use kube::Client;
use snafu::Snafu;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod config;
pub mod coordinator;
pub mod election;
pub mod follower;
pub mod server;
pub mod vllm;

/// How long a failed role body waits before re-entering the same role.
/// Matches the election retry period so re-attempts line up with ticks.
pub(crate) const ROLE_RETRY_PERIOD: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Kubernetes API error: {}", source))]
    Kube { source: kube::Error },

    #[snafu(display("failed to create model directory {}: {}", path.display(), source))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to bind model distribution server: {}", source))]
    Bind { source: std::io::Error },

    #[snafu(display("MODEL_REPO environment variable not set"))]
    MissingModelRepo,

    #[snafu(display("failed to spawn model downloader: {}", source))]
    SpawnDownload { source: std::io::Error },

    #[snafu(display("model downloader wait failed: {}", source))]
    DownloadWait { source: std::io::Error },

    #[snafu(display("model download exited with {}", status))]
    Download { status: ExitStatus },

    #[snafu(display("lease {} has no holder", lease))]
    NoHolder { lease: String },

    #[snafu(display("coordinator pod {} has no IP yet", pod))]
    NoPodIp { pod: String },

    #[snafu(display("http request error: {}", source))]
    Http { source: reqwest::Error },

    #[snafu(display("unexpected status {} fetching {}", status, url))]
    Fetch {
        url: String,
        status: reqwest::StatusCode,
    },

    #[snafu(display("failed to write {}: {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to spawn inference server: {}", source))]
    SpawnInference { source: std::io::Error },

    #[snafu(display("inference server not started"))]
    InferenceNotStarted,

    #[snafu(display("inference server wait failed: {}", source))]
    InferenceWait { source: std::io::Error },

    #[snafu(display("inference server exited with {}", status))]
    InferenceExited { status: ExitStatus },
}

enum RoleEvent {
    Elected,
    Lost,
}

/// Keeps the cancel handle of the active role. Every transition cancels
/// the previous role before spawning the next one, so at most one role
/// runs per pod and `Lost` always observes the coordinator teardown.
struct RoleSupervisor {
    root: CancellationToken,
    active: Option<CancellationToken>,
}

impl RoleSupervisor {
    fn new(root: CancellationToken) -> Self {
        Self { root, active: None }
    }

    fn assume(&mut self, event: RoleEvent, config: &AgentConfig, client: &Client) {
        self.stop();
        let token = self.root.child_token();
        self.active = Some(token.clone());

        let config = config.clone();
        match event {
            RoleEvent::Elected => {
                tokio::spawn(coordinator::run(config, token));
            }
            RoleEvent::Lost => {
                let client = client.clone();
                tokio::spawn(follower::run(config, client, token));
            }
        }
    }

    fn stop(&mut self) {
        if let Some(token) = self.active.take() {
            token.cancel();
        }
    }
}

/// Agent entry point: election loop as the event source, role bodies as
/// the transition handlers.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid agent configuration: {}", e);
            std::process::exit(2);
        }
    };
    info!(
        pod = %config.pod_name,
        namespace = %config.namespace,
        lease = %config.lease_name(),
        "agent starting"
    );

    // In-cluster credentials; without them the agent cannot participate at
    // all, so this aborts the process.
    let client = Client::try_default().await?;

    let manager = Arc::new(LeaseManager::new(
        client.clone(),
        &config.lease_name(),
        &config.namespace,
        &config.pod_name,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let (events, mut role_events) = mpsc::unbounded_channel();
    let elected = {
        let events = events.clone();
        move || {
            let _ = events.send(RoleEvent::Elected);
        }
    };
    let lost = move || {
        let _ = events.send(RoleEvent::Lost);
    };
    let election = tokio::spawn(manager.run(shutdown.clone(), elected, lost));

    let mut supervisor = RoleSupervisor::new(shutdown.clone());
    while let Some(event) = role_events.recv().await {
        if shutdown.is_cancelled() {
            break;
        }
        supervisor.assume(event, &config, &client);
    }

    supervisor.stop();
    let _ = election.await;
    info!("agent shut down gracefully");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}
