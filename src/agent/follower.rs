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

//! Follower role: copy the model from the coordinator over the pod
//! network, then run inference.

use crate::agent::config::AgentConfig;
use crate::agent::server::SERVER_PORT;
use crate::agent::vllm::{VllmConfig, VllmServer};
use crate::agent::{
    self, CreateDirSnafu, Error, FetchSnafu, HttpSnafu, KubeSnafu, NoHolderSnafu, NoPodIpSnafu,
    WriteFileSnafu,
};
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::Api;
use kube::Client;
use reqwest::StatusCode;
use snafu::{OptionExt, ResultExt};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Role body with re-entry: holder lookup or fetch failures are logged and
/// retried on the next tick. Each pass re-resolves the coordinator, so a
/// failover between passes is picked up automatically.
pub async fn run(config: AgentConfig, client: Client, token: CancellationToken) {
    info!("running as follower");
    loop {
        if token.is_cancelled() {
            return;
        }
        match run_once(&config, &client, &token).await {
            Ok(()) => return,
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(error = %e, "follower role failed");
                tokio::select! {
                    _ = tokio::time::sleep(agent::ROLE_RETRY_PERIOD) => {}
                    _ = token.cancelled() => return,
                }
            }
        }
    }
}

async fn run_once(
    config: &AgentConfig,
    client: &Client,
    token: &CancellationToken,
) -> Result<(), Error> {
    let coordinator_ip = resolve_coordinator_ip(client, config).await?;
    info!(coordinator_ip = %coordinator_ip, "syncing model from coordinator");

    tokio::select! {
        synced = sync_model(&coordinator_ip, &config.model_path) => synced?,
        _ = token.cancelled() => return Ok(()),
    }

    let mut inference = VllmServer::new(VllmConfig::from_env(&config.model_path));
    inference.start()?;

    let exited = tokio::select! {
        status = inference.wait() => Some(status),
        _ = token.cancelled() => None,
    };
    match exited {
        Some(status) => status.and_then(|status| Err(Error::InferenceExited { status })),
        None => {
            info!("follower shutting down");
            inference.stop();
            let _ = inference.wait().await;
            Ok(())
        }
    }
}

/// The Lease names the holder pod; the pod carries the IP. Both reads go
/// to the platform rather than a cache so a fresh failover is observed.
async fn resolve_coordinator_ip(client: &Client, config: &AgentConfig) -> Result<String, Error> {
    let lease_name = config.lease_name();
    let leases: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);
    let lease = leases.get(&lease_name).await.context(KubeSnafu)?;

    let holder = lease
        .spec
        .and_then(|spec| spec.holder_identity)
        .filter(|holder| !holder.is_empty())
        .context(NoHolderSnafu { lease: lease_name })?;

    let pods: Api<corev1::Pod> = Api::namespaced(client.clone(), &config.namespace);
    let pod = pods.get(&holder).await.context(KubeSnafu)?;
    pod.status
        .and_then(|status| status.pod_ip)
        .filter(|ip| !ip.is_empty())
        .context(NoPodIpSnafu { pod: holder })
}

async fn sync_model(coordinator_ip: &str, model_path: &Path) -> Result<(), Error> {
    let files = fetch_file_list(coordinator_ip).await?;

    tokio::fs::create_dir_all(model_path)
        .await
        .context(CreateDirSnafu {
            path: model_path.to_path_buf(),
        })?;

    for filename in &files {
        download_file(coordinator_ip, filename, model_path).await?;
    }

    info!(count = files.len(), "all model files downloaded");
    Ok(())
}

async fn fetch_file_list(coordinator_ip: &str) -> Result<Vec<String>, Error> {
    let url = format!("http://{coordinator_ip}:{SERVER_PORT}/models");
    debug!(url = %url, "fetching model file list");

    let response = reqwest::get(&url).await.context(HttpSnafu)?;
    if response.status() != StatusCode::OK {
        return FetchSnafu {
            url,
            status: response.status(),
        }
        .fail();
    }

    let body = response.text().await.context(HttpSnafu)?;
    Ok(parse_file_list(&body))
}

fn parse_file_list(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

async fn download_file(
    coordinator_ip: &str,
    filename: &str,
    model_path: &Path,
) -> Result<(), Error> {
    let url = format!("http://{coordinator_ip}:{SERVER_PORT}/models/{filename}");
    info!(filename, "downloading model file");

    let response = reqwest::get(&url).await.context(HttpSnafu)?;
    if response.status() != StatusCode::OK {
        return FetchSnafu {
            url,
            status: response.status(),
        }
        .fail();
    }

    let local_path = model_path.join(filename);
    let mut file = tokio::fs::File::create(&local_path)
        .await
        .context(WriteFileSnafu {
            path: local_path.clone(),
        })?;

    // Stream straight to disk; the artifact may be many gigabytes.
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context(HttpSnafu)?;
        file.write_all(&chunk).await.context(WriteFileSnafu {
            path: local_path.clone(),
        })?;
        written += chunk.len() as u64;
    }
    file.flush().await.context(WriteFileSnafu {
        path: local_path.clone(),
    })?;

    debug!(filename, bytes = written, "downloaded model file");
    Ok(())
}
