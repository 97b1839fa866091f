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

//! Coordinator role: stage the model from the external registry, serve it
//! to followers, run inference.

use crate::agent::config::AgentConfig;
use crate::agent::vllm::{VllmConfig, VllmServer};
use crate::agent::{
    self, BindSnafu, CreateDirSnafu, DownloadWaitSnafu, Error, MissingModelRepoSnafu,
    SpawnDownloadSnafu, server,
};
use snafu::{OptionExt, ResultExt};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Role body with re-entry: a failed pass is logged and retried on the
/// next tick until the role is cancelled. Election state is unchanged by
/// failures here.
pub async fn run(config: AgentConfig, token: CancellationToken) {
    info!("running as coordinator");
    loop {
        if token.is_cancelled() {
            return;
        }
        match run_once(&config, &token).await {
            Ok(()) => return,
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                error!(error = %e, "coordinator role failed");
                tokio::select! {
                    _ = tokio::time::sleep(agent::ROLE_RETRY_PERIOD) => {}
                    _ = token.cancelled() => return,
                }
            }
        }
    }
}

async fn run_once(config: &AgentConfig, token: &CancellationToken) -> Result<(), Error> {
    ensure_model(config, token).await?;
    if token.is_cancelled() {
        return Ok(());
    }

    // Serving is gated on the completed download: a 200 listing from this
    // pod implies the artifact set is whole.
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server::SERVER_PORT))
        .await
        .context(BindSnafu)?;
    info!(port = server::SERVER_PORT, "starting model distribution server");
    let app = server::router(config.model_path.clone());
    let shutdown = token.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "model distribution server failed");
        }
    });

    let mut inference = VllmServer::new(VllmConfig::from_env(&config.model_path));
    let outcome = match inference.start() {
        Ok(()) => {
            let exited = tokio::select! {
                status = inference.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            match exited {
                Some(status) => {
                    status.and_then(|status| Err(Error::InferenceExited { status }))
                }
                None => {
                    info!("coordinator shutting down");
                    inference.stop();
                    let _ = inference.wait().await;
                    Ok(())
                }
            }
        }
        Err(e) => Err(e),
    };

    server_task.abort();
    let _ = server_task.await;
    outcome
}

/// Skips the download when the model directory already has content, so a
/// promoted ex-follower serves immediately instead of re-downloading.
async fn ensure_model(config: &AgentConfig, token: &CancellationToken) -> Result<(), Error> {
    if model_present(&config.model_path).await {
        info!(
            path = %config.model_path.display(),
            "model already exists, skipping download"
        );
        return Ok(());
    }

    let repo = config
        .model_repo
        .as_deref()
        .context(MissingModelRepoSnafu)?;
    info!(
        repo,
        path = %config.model_path.display(),
        "model not found, starting download"
    );

    tokio::fs::create_dir_all(&config.model_path)
        .await
        .context(CreateDirSnafu {
            path: config.model_path.clone(),
        })?;

    // Stdio passes through so download progress stays visible in pod logs.
    let mut child = Command::new("huggingface-cli")
        .arg("download")
        .arg(repo)
        .arg("--local-dir")
        .arg(&config.model_path)
        .arg("--local-dir-use-symlinks")
        .arg("False")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .context(SpawnDownloadSnafu)?;

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = token.cancelled() => None,
    };
    match exited {
        Some(status) => {
            let status = status.context(DownloadWaitSnafu)?;
            if status.success() {
                info!("model download completed");
                Ok(())
            } else {
                Err(Error::Download { status })
            }
        }
        None => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

async fn model_present(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::model_present;

    #[tokio::test]
    async fn test_model_present_requires_at_least_one_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!model_present(dir.path()).await);

        std::fs::write(dir.path().join("config.json"), b"{}").expect("write");
        assert!(model_present(dir.path()).await);
    }

    #[tokio::test]
    async fn test_missing_directory_means_no_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("does-not-exist");
        assert!(!model_present(&missing).await);
    }
}
