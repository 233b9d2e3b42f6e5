//! Launched inference server processes.
//!
//! Epistemic foundation:
//! - K_i: A launched server is healthy once `GET /health` returns 200
//! - B_i: The launcher program exists on PATH → BackendUnavailable otherwise
//! - I^B: Start-up time unknowable → bounded poll with `startup_timeout`

use crate::models::{EvalError, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between health polls while a server starts.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Everything needed to start one server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Label used in logs and errors
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Base URL the server will answer on
    pub base_url: String,
    pub startup_timeout: Duration,
}

/// A running server child process.
///
/// The child is killed when this value is dropped.
pub struct ServerProcess {
    name: String,
    base_url: String,
    child: Mutex<Option<Child>>,
}

impl ServerProcess {
    /// Spawn the server and wait until it reports healthy.
    pub async fn launch(spec: LaunchSpec, http: &reqwest::Client) -> Result<Self> {
        info!(
            server = %spec.name,
            program = %spec.program,
            url = %spec.base_url,
            "Launching inference server"
        );

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EvalError::unavailable(&spec.name, format!("failed to spawn '{}': {e}", spec.program))
            })?;

        let process = Self {
            name: spec.name.clone(),
            base_url: spec.base_url.clone(),
            child: Mutex::new(Some(child)),
        };
        process.wait_until_healthy(http, spec.startup_timeout).await?;
        Ok(process)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn wait_until_healthy(&self, http: &reqwest::Client, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let url = format!("{}/health", self.base_url);

        loop {
            if let Some(status) = self.exit_status().await? {
                return Err(EvalError::unavailable(
                    &self.name,
                    format!("server exited during start-up ({status})"),
                ));
            }

            match http.get(&url).timeout(HEALTH_POLL_INTERVAL).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        server = %self.name,
                        startup_secs = start.elapsed().as_secs(),
                        "Inference server ready"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    debug!(server = %self.name, status = response.status().as_u16(), "Server not ready")
                }
                Err(e) => debug!(server = %self.name, error = %e, "Server not reachable yet"),
            }

            if start.elapsed() >= timeout {
                self.kill().await;
                return Err(EvalError::unavailable(
                    &self.name,
                    format!("not healthy after {}s", timeout.as_secs()),
                ));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn exit_status(&self) -> Result<Option<std::process::ExitStatus>> {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| EvalError::io("polling server process", e)),
            None => Ok(None),
        }
    }

    /// Kill and reap the server. Safe to call more than once.
    pub async fn kill(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        if let Err(e) = child.kill().await {
            warn!(server = %self.name, error = %e, "Failed to kill inference server");
        } else {
            info!(server = %self.name, "Inference server stopped");
        }
    }
}

/// `CUDA_VISIBLE_DEVICES` value for a device string.
///
/// "cuda:0,1" → Some("0,1"); "cpu" → Some("") (hide all GPUs); "cuda" → None (inherit).
pub fn visible_devices(device: &str) -> Option<String> {
    let device = device.trim();
    if device.eq_ignore_ascii_case("cpu") {
        return Some(String::new());
    }
    device
        .strip_prefix("cuda:")
        .map(|ids| ids.split(',').map(str::trim).collect::<Vec<_>>().join(","))
}

/// Map an error response from a local inference server to an error.
///
/// Out-of-memory, overload and context-length failures become `CapacityExceeded`.
pub fn classify_server_error(server: &str, status: u16, body: &str) -> EvalError {
    let lower = body.to_ascii_lowercase();
    let capacity = matches!(status, 413 | 429 | 507)
        || ["out of memory", "overloaded", "must be <=", "maximum context length"]
            .iter()
            .any(|needle| lower.contains(needle));

    if capacity {
        EvalError::CapacityExceeded(format!("{server} (HTTP {status}): {}", excerpt(body)))
    } else if status >= 500 {
        EvalError::unavailable(server, format!("HTTP {status}: {}", excerpt(body)))
    } else {
        EvalError::GenerationFailure(format!("{server} (HTTP {status}): {}", excerpt(body)))
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(300).collect()
}

/// POST a JSON body and decode a JSON reply, classifying failures.
pub(crate) async fn post_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    server: &str,
    url: &str,
    body: &serde_json::Value,
) -> Result<T> {
    let response = http.post(url).json(body).send().await.map_err(|e| {
        if e.is_timeout() {
            EvalError::GenerationFailure(format!("{server}: request timed out"))
        } else if e.is_connect() {
            EvalError::unavailable(server, format!("unreachable: {e}"))
        } else {
            EvalError::Network(e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_server_error(server, status.as_u16(), &text));
    }
    response
        .json()
        .await
        .map_err(|e| EvalError::ParseError(format!("{server}: invalid response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_devices() {
        assert_eq!(visible_devices("cuda:0, 1"), Some("0,1".to_string()));
        assert_eq!(visible_devices("cuda:3"), Some("3".to_string()));
        assert_eq!(visible_devices("CPU"), Some(String::new()));
        assert_eq!(visible_devices("cuda"), None);
    }

    #[test]
    fn test_classify_server_error() {
        assert!(matches!(
            classify_server_error("tgi", 422, "Input validation error: `inputs` tokens + `max_new_tokens` must be <= 4096"),
            EvalError::CapacityExceeded(_)
        ));
        assert!(matches!(
            classify_server_error("vllm", 500, "CUDA out of memory"),
            EvalError::CapacityExceeded(_)
        ));
        assert!(matches!(
            classify_server_error("vllm", 503, "engine dead"),
            EvalError::BackendUnavailable { .. }
        ));
        assert!(matches!(
            classify_server_error("tgi", 400, "bad json"),
            EvalError::GenerationFailure(_)
        ));
    }

    #[tokio::test]
    async fn test_launch_missing_program_is_unavailable() {
        let spec = LaunchSpec {
            name: "test".into(),
            program: "polyeval-no-such-launcher".into(),
            args: vec![],
            env: HashMap::new(),
            base_url: "http://127.0.0.1:1".into(),
            startup_timeout: Duration::from_secs(1),
        };
        let result = ServerProcess::launch(spec, &reqwest::Client::new()).await;
        assert!(matches!(result, Err(EvalError::BackendUnavailable { .. })));
    }
}
