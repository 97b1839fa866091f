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

//! Inference process launcher.
//!
//! Translates agent configuration into a vLLM subprocess invocation. The
//! launcher attaches stdio and forwards lifecycle; it never interprets the
//! child's output.

use crate::agent::{Error, InferenceWaitSnafu, SpawnInferenceSnafu};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::info;

#[derive(Clone, Debug)]
pub struct VllmConfig {
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub tensor_parallel_size: u32,
    pub gpu_memory_utilization: f64,
    /// Maximum context length; vLLM's own default applies when unset.
    pub max_model_len: Option<u32>,
    pub dtype: String,
    /// Pass-through for anything not modeled above.
    pub extra_args: Vec<String>,
}

impl VllmConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            host: "0.0.0.0".to_owned(),
            port: 8000,
            tensor_parallel_size: 1,
            gpu_memory_utilization: 0.9,
            max_model_len: None,
            dtype: "auto".to_owned(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_env(model_path: &Path) -> Self {
        Self::from_lookup(model_path, |name| std::env::var(name).ok())
    }

    /// Unparsable values keep their defaults; the launcher is not the place
    /// to fail a pod over a typo'd tuning knob.
    fn from_lookup(model_path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(model_path);

        if let Some(host) = lookup("VLLM_HOST").filter(|v| !v.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup("VLLM_PORT").and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        if let Some(tp) = lookup("VLLM_TENSOR_PARALLEL_SIZE").and_then(|v| v.parse().ok()) {
            config.tensor_parallel_size = tp;
        }
        if let Some(gpu) = lookup("VLLM_GPU_MEMORY_UTILIZATION").and_then(|v| v.parse().ok()) {
            config.gpu_memory_utilization = gpu;
        }
        if let Some(len) = lookup("VLLM_MAX_MODEL_LEN").and_then(|v| v.parse().ok()) {
            config.max_model_len = Some(len);
        }
        if let Some(dtype) = lookup("VLLM_DTYPE").filter(|v| !v.is_empty()) {
            config.dtype = dtype;
        }
        if let Some(extra) = lookup("VLLM_EXTRA_ARGS") {
            config.extra_args = extra.split_whitespace().map(str::to_owned).collect();
        }

        config
    }

    /// Deterministic argv for `python`.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_owned(),
            "vllm.entrypoints.openai.api_server".to_owned(),
            "--model".to_owned(),
            self.model_path.display().to_string(),
            "--host".to_owned(),
            self.host.clone(),
            "--port".to_owned(),
            self.port.to_string(),
            "--tensor-parallel-size".to_owned(),
            self.tensor_parallel_size.to_string(),
            "--gpu-memory-utilization".to_owned(),
            format!("{:.2}", self.gpu_memory_utilization),
            "--dtype".to_owned(),
            self.dtype.clone(),
        ];

        if let Some(max_model_len) = self.max_model_len {
            args.push("--max-model-len".to_owned());
            args.push(max_model_len.to_string());
        }
        args.extend(self.extra_args.iter().cloned());

        args
    }
}

pub struct VllmServer {
    config: VllmConfig,
    child: Option<Child>,
}

impl VllmServer {
    pub fn new(config: VllmConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    pub fn start(&mut self) -> Result<(), Error> {
        let args = self.config.build_args();
        info!(command = %format!("python {}", args.join(" ")), "starting inference server");

        let child = Command::new("python")
            .args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .context(SpawnInferenceSnafu)?;

        info!(pid = child.id(), "inference server started");
        self.child = Some(child);
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, Error> {
        match self.child.as_mut() {
            Some(child) => child.wait().await.context(InferenceWaitSnafu),
            None => Err(Error::InferenceNotStarted),
        }
    }

    /// Soft-terminate so vLLM can tear down its engine workers.
    pub fn stop(&mut self) {
        if let Some(child) = &self.child
            && let Some(pid) = child.id()
        {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::VllmConfig;
    use std::collections::HashMap;
    use std::path::Path;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_default_args_cover_required_flags() {
        let config = VllmConfig::new("/models");
        let args = config.build_args();

        assert_eq!(
            args,
            vec![
                "-m",
                "vllm.entrypoints.openai.api_server",
                "--model",
                "/models",
                "--host",
                "0.0.0.0",
                "--port",
                "8000",
                "--tensor-parallel-size",
                "1",
                "--gpu-memory-utilization",
                "0.90",
                "--dtype",
                "auto",
            ]
        );
    }

    #[test]
    fn test_max_model_len_included_only_when_set() {
        let mut config = VllmConfig::new("/models");
        assert!(!config.build_args().contains(&"--max-model-len".to_owned()));

        config.max_model_len = Some(4096);
        let args = config.build_args();
        let position = args
            .iter()
            .position(|a| a == "--max-model-len")
            .expect("flag present");
        assert_eq!(args[position + 1], "4096");
    }

    #[test]
    fn test_env_overrides_and_extra_args_pass_through() {
        let config = VllmConfig::from_lookup(
            Path::new("/models"),
            lookup(&[
                ("VLLM_PORT", "9000"),
                ("VLLM_TENSOR_PARALLEL_SIZE", "4"),
                ("VLLM_GPU_MEMORY_UTILIZATION", "0.85"),
                ("VLLM_DTYPE", "bfloat16"),
                ("VLLM_EXTRA_ARGS", "--enforce-eager --swap-space 8"),
            ]),
        );

        assert_eq!(config.port, 9000);
        assert_eq!(config.tensor_parallel_size, 4);
        assert_eq!(config.dtype, "bfloat16");

        let args = config.build_args();
        assert!(args.contains(&"--enforce-eager".to_owned()));
        assert!(args.windows(2).any(|w| w == ["--swap-space", "8"]));
        assert!(args.windows(2).any(|w| w == ["--gpu-memory-utilization", "0.85"]));
    }

    #[test]
    fn test_unparsable_env_keeps_defaults() {
        let config = VllmConfig::from_lookup(
            Path::new("/models"),
            lookup(&[("VLLM_PORT", "not-a-port"), ("VLLM_MAX_MODEL_LEN", "??")]),
        );

        assert_eq!(config.port, 8000);
        assert_eq!(config.max_model_len, None);
    }
}
