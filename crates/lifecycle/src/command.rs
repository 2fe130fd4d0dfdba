//! Resource controller backed by shell commands.
//!
//! Each descriptor names its `create`, `delete` and `describe` commands in
//! `params`. Commands run through `sh -c` with the resource's identity and
//! parameters exported as environment variables:
//!
//! - `TESTBED_RESOURCE_ID`, `TESTBED_RESOURCE_KIND`
//! - `TESTBED_HANDLE` (delete and describe only)
//! - `TESTBED_PARAM_<NAME>` for every param, upper-cased
//!
//! `create` prints the provider handle on stdout; `describe` prints the
//! provider's status word. Failures are classified from stderr so the
//! retrier can tell throttling from a bad request.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::controller::{Handle, ResourceController, ResourceStatus};
use crate::descriptor::ResourceDescriptor;
use crate::error::ControllerError;

/// Default limit for a single command.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "rate exceeded",
    "throttl",
    "toomanyrequests",
    "too many requests",
    "requestlimitexceeded",
];

const NETWORK_MARKERS: &[&str] = &[
    "timed out",
    "connection reset",
    "connection refused",
    "could not resolve",
    "network is unreachable",
    "try again",
    "temporarily unavailable",
    "service unavailable",
    "internalfailure",
    "internal server error",
    "bad gateway",
    "gateway timeout",
];

/// Server-side HTTP statuses, matched only as whole tokens.
const SERVER_ERROR_CODES: &[&str] = &["500", "502", "503", "504"];

const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "notfound",
    "does not exist",
    "no such",
    "nosuchentity",
];

const AUTH_MARKERS: &[&str] = &[
    "accessdenied",
    "access denied",
    "unauthorized",
    "not authorized",
    "forbidden",
    "expiredtoken",
    "invalidclienttokenid",
];

const QUOTA_MARKERS: &[&str] = &["limitexceeded", "quota", "insufficientcapacity"];

const CONFIG_MARKERS: &[&str] = &["invalidparameter", "validationexception", "invalid", "malformed"];

/// Shell exit status for "command not found".
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Runs per-resource shell commands.
#[derive(Debug, Clone)]
pub struct CommandController {
    shell: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl Default for CommandController {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            working_dir: None,
        }
    }
}

impl CommandController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run commands from `dir` (typically the environment file's directory).
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(
        &self,
        descriptor: &ResourceDescriptor,
        operation: &str,
        handle: Option<&Handle>,
    ) -> Result<String, ControllerError> {
        let script = descriptor.params.get(operation).ok_or_else(|| {
            ControllerError::Config(format!(
                "resource '{}' has no '{operation}' command",
                descriptor.id
            ))
        })?;

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(script)
            .env("TESTBED_RESOURCE_ID", &descriptor.id)
            .env("TESTBED_RESOURCE_KIND", descriptor.kind.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(handle) = handle {
            cmd.env("TESTBED_HANDLE", handle.as_str());
        }
        for (name, value) in &descriptor.params {
            cmd.env(param_var(name), value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(
            resource = %descriptor.id,
            operation = %operation,
            "Executing resource command"
        );

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ControllerError::Timeout(self.timeout.as_secs()))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let error = classify_failure(operation, output.status.code(), stderr.trim());
        warn!(
            resource = %descriptor.id,
            operation = %operation,
            exit_code = ?output.status.code(),
            error = %error,
            "Resource command failed"
        );
        Err(error)
    }
}

/// Environment variable carrying param `name`.
fn param_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("TESTBED_PARAM_{name}")
}

/// Map a failed command to a classified error using its stderr.
fn classify_failure(operation: &str, code: Option<i32>, stderr: &str) -> ControllerError {
    let message = if stderr.is_empty() {
        code.map_or_else(
            || "terminated by signal".to_string(),
            |c| format!("exit status {c}"),
        )
    } else {
        stderr.to_string()
    };

    if code == Some(EXIT_COMMAND_NOT_FOUND) {
        return ControllerError::Config(message);
    }

    let lower = stderr.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));
    let server_error = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| SERVER_ERROR_CODES.contains(&token));

    // Deterministic failures first, so a message that merely mentions a
    // network or timeout setting is not retried.
    if has(AUTH_MARKERS) {
        ControllerError::Auth(message)
    } else if has(RATE_LIMIT_MARKERS) {
        ControllerError::RateLimited(message)
    } else if has(QUOTA_MARKERS) {
        ControllerError::QuotaExceeded(message)
    } else if has(NOT_FOUND_MARKERS) {
        ControllerError::NotFound(message)
    } else if has(CONFIG_MARKERS) {
        ControllerError::Config(message)
    } else if has(NETWORK_MARKERS) || server_error {
        ControllerError::Network(message)
    } else {
        ControllerError::Command {
            operation: operation.to_string(),
            code: code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr: message,
        }
    }
}

#[async_trait]
impl ResourceController for CommandController {
    async fn create(&self, descriptor: &ResourceDescriptor) -> Result<Handle, ControllerError> {
        let stdout = self.run(descriptor, "create", None).await?;
        // Last line wins so chatty tools can log progress before the handle.
        let handle = stdout.lines().last().map(str::trim).unwrap_or_default();
        if handle.is_empty() {
            Ok(Handle::new(descriptor.id.clone()))
        } else {
            Ok(Handle::new(handle))
        }
    }

    async fn delete(
        &self,
        descriptor: &ResourceDescriptor,
        handle: &Handle,
    ) -> Result<(), ControllerError> {
        self.run(descriptor, "delete", Some(handle)).await.map(|_| ())
    }

    async fn describe(
        &self,
        descriptor: &ResourceDescriptor,
        handle: &Handle,
    ) -> Result<ResourceStatus, ControllerError> {
        match self.run(descriptor, "describe", Some(handle)).await {
            Ok(stdout) => Ok(ResourceStatus::from_provider_status(
                stdout.lines().last().unwrap_or_default(),
            )),
            Err(e) if e.is_not_found() => Ok(ResourceStatus::Absent),
            Err(e) => Err(e),
        }
    }
}
