//! Workload trigger: launches one detached container per call.
//!
//! The trigger returns as soon as the runtime accepts the launch. It does not
//! wait for the container, capture its output, or track it afterwards.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

/// Environment variable carrying the caller's custom input.
pub const CUSTOM_INPUT_VAR: &str = "CUSTOM_INPUT";

/// Upper bound for the runtime to accept a launch (includes an image pull).
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(120);

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stderr fragments the docker and podman CLIs print for unknown images.
const IMAGE_NOT_FOUND_MARKERS: [&str; 4] = [
    "unable to find image",
    "pull access denied",
    "manifest unknown",
    "repository does not exist",
];

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid trigger request: {0}")]
    InvalidRequest(String),

    #[error("image '{0}' not found")]
    ImageNotFound(String),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container runtime rejected the launch (exit {code}): {stderr}")]
    Rejected { code: i32, stderr: String },
}

/// One launch: an image plus the environment handed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub image: String,
    pub env: BTreeMap<String, String>,
}

impl TriggerRequest {
    pub fn new(image: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        Self { image: image.into(), env }
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        let image = self.image.trim();
        if image.is_empty() {
            return Err(TriggerError::InvalidRequest("image reference is empty".to_string()));
        }
        if image.starts_with('-') || image.chars().any(char::is_whitespace) {
            return Err(TriggerError::InvalidRequest(format!(
                "invalid image reference '{}'",
                self.image
            )));
        }
        for (name, value) in &self.env {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(TriggerError::InvalidRequest(format!(
                    "invalid environment variable name '{name}'"
                )));
            }
            if value.contains('\0') {
                return Err(TriggerError::InvalidRequest(format!(
                    "environment variable '{name}' contains a NUL byte"
                )));
            }
        }
        Ok(())
    }
}

/// Acknowledgment that the runtime accepted a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchReceipt {
    pub image: String,
    pub container_id: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start one container and return once the runtime has accepted it.
    async fn run(&self, request: &TriggerRequest) -> Result<LaunchReceipt, TriggerError>;
}

/// Runtime driven through a docker-compatible CLI (`docker`, `podman`).
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: String,
}

impl CliRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }

    /// Check that the runtime binary runs and its daemon answers.
    pub async fn probe(&self) -> Result<(), TriggerError> {
        let mut command = Command::new(&self.program);
        command.arg("version").stdin(Stdio::null()).kill_on_drop(true);
        let output = tokio::time::timeout(PROBE_TIMEOUT, command.output())
            .await
            .map_err(|_| TriggerError::RuntimeUnavailable(format!("{} version timed out", self.program)))?
            .map_err(|e| TriggerError::RuntimeUnavailable(format!("{}: {e}", self.program)))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(TriggerError::RuntimeUnavailable(stderr))
    }

    fn run_args(request: &TriggerRequest) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string(), "--rm".to_string()];
        for (name, value) in &request.env {
            args.push("--env".to_string());
            args.push(format!("{name}={value}"));
        }
        args.push(request.image.trim().to_string());
        args
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn run(&self, request: &TriggerRequest) -> Result<LaunchReceipt, TriggerError> {
        let mut command = Command::new(&self.program);
        command
            .args(Self::run_args(request))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(LAUNCH_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
                return Err(TriggerError::RuntimeUnavailable(format!("{}: {e}", self.program)));
            }
            Ok(Err(e)) => return Err(TriggerError::RuntimeUnavailable(e.to_string())),
            Err(_) => {
                return Err(TriggerError::RuntimeUnavailable(format!(
                    "{} did not accept the launch within {}s",
                    self.program,
                    LAUNCH_TIMEOUT.as_secs()
                )));
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let container_id = stdout.lines().last().map(str::trim).filter(|id| !id.is_empty());
            return Ok(LaunchReceipt {
                image: request.image.trim().to_string(),
                container_id: container_id.map(str::to_string),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(&request.image, output.status.code().unwrap_or(-1), stderr))
    }
}

fn classify_failure(image: &str, code: i32, stderr: String) -> TriggerError {
    let lowered = stderr.to_lowercase();
    if IMAGE_NOT_FOUND_MARKERS.iter().any(|m| lowered.contains(m)) {
        TriggerError::ImageNotFound(image.trim().to_string())
    } else if lowered.contains("cannot connect to the docker daemon") {
        TriggerError::RuntimeUnavailable(stderr)
    } else {
        TriggerError::Rejected { code, stderr }
    }
}

/// Process-wide trigger, sharing one runtime handle across all calls.
#[derive(Clone)]
pub struct WorkloadTrigger {
    runtime: Arc<dyn ContainerRuntime>,
}

impl WorkloadTrigger {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Validate and launch. Failures are returned as-is; nothing is retried.
    pub async fn trigger(
        &self,
        image: &str,
        env: BTreeMap<String, String>,
    ) -> Result<LaunchReceipt, TriggerError> {
        let request = TriggerRequest::new(image, env);
        request.validate()?;
        tracing::info!(image = %request.image, env_vars = request.env.len(), "Launching workload");
        match self.runtime.run(&request).await {
            Ok(receipt) => {
                tracing::info!(
                    image = %receipt.image,
                    container_id = receipt.container_id.as_deref().unwrap_or("-"),
                    "Workload accepted by runtime"
                );
                Ok(receipt)
            }
            Err(e) => {
                tracing::error!(image = %request.image, error = %e, "Workload launch failed");
                Err(e)
            }
        }
    }
}
