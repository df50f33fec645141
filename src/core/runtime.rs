//! Container runtime client - Typed requests against the container manager CLI

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use super::error::{RuntimeError, VpsResult};
use super::settings::Timeouts;

/// Resource limit keys settable on a running container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKey {
    Memory,
    Cpu,
}

impl LimitKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "limits.memory",
            Self::Cpu => "limits.cpu",
        }
    }
}

/// One invocation of the container manager.
///
/// Arguments are passed to the runtime as an argv vector, never through a
/// shell, so user-supplied values cannot inject host commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeRequest {
    Launch {
        image: String,
        name: String,
        memory_mb: u64,
        cpu_cores: u32,
        pool: String,
    },
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Restart {
        name: String,
    },
    Delete {
        name: String,
        force: bool,
    },
    OverrideRootSize {
        name: String,
        size_gb: u32,
    },
    SetLimit {
        name: String,
        key: LimitKey,
        value: String,
    },
    Snapshot {
        name: String,
        snapshot: String,
    },
    Restore {
        name: String,
        snapshot: String,
    },
    Info {
        name: String,
    },
    /// Run an argv inside the container
    Exec {
        name: String,
        argv: Vec<String>,
    },
    /// Force-stop every container on the host
    StopAll,
}

impl RuntimeRequest {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch",
            Self::Start { .. } => "start",
            Self::Stop { .. } | Self::StopAll => "stop",
            Self::Restart { .. } => "restart",
            Self::Delete { .. } => "delete",
            Self::OverrideRootSize { .. } | Self::SetLimit { .. } => "config",
            Self::Snapshot { .. } => "snapshot",
            Self::Restore { .. } => "restore",
            Self::Info { .. } => "info",
            Self::Exec { .. } => "exec",
        }
    }

    /// Target container, `None` for host-wide requests
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Launch { name, .. }
            | Self::Start { name }
            | Self::Stop { name }
            | Self::Restart { name }
            | Self::Delete { name, .. }
            | Self::OverrideRootSize { name, .. }
            | Self::SetLimit { name, .. }
            | Self::Snapshot { name, .. }
            | Self::Restore { name, .. }
            | Self::Info { name }
            | Self::Exec { name, .. } => Some(name.as_str()),
            Self::StopAll => None,
        }
    }

    /// Command-line arguments passed to the runtime binary
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![self.verb().to_string()];
        match self {
            Self::Launch {
                image,
                name,
                memory_mb,
                cpu_cores,
                pool,
            } => {
                args.extend([
                    image.clone(),
                    name.clone(),
                    "--config".to_string(),
                    format!("limits.memory={}MB", memory_mb),
                    "--config".to_string(),
                    format!("limits.cpu={}", cpu_cores),
                    "-s".to_string(),
                    pool.clone(),
                ]);
            }
            Self::Start { name } | Self::Stop { name } | Self::Restart { name } => {
                args.push(name.clone());
            }
            Self::Delete { name, force } => {
                args.push(name.clone());
                if *force {
                    args.push("--force".to_string());
                }
            }
            Self::OverrideRootSize { name, size_gb } => {
                args.extend([
                    "device".to_string(),
                    "override".to_string(),
                    name.clone(),
                    "root".to_string(),
                    format!("size={}GB", size_gb),
                ]);
            }
            Self::SetLimit { name, key, value } => {
                args.extend([
                    "set".to_string(),
                    name.clone(),
                    key.as_str().to_string(),
                    value.clone(),
                ]);
            }
            Self::Snapshot { name, snapshot } | Self::Restore { name, snapshot } => {
                args.extend([name.clone(), snapshot.clone()]);
            }
            Self::Info { name } => args.push(name.clone()),
            Self::Exec { name, argv } => {
                args.push(name.clone());
                args.push("--".to_string());
                args.extend(argv.iter().cloned());
            }
            Self::StopAll => {
                args.extend(["--all".to_string(), "--force".to_string()]);
            }
        }
        args
    }
}

/// Raw result of a finished runtime process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a non-zero exit into a `RuntimeError`
    pub fn into_result(self) -> Result<String, RuntimeError> {
        if self.success() {
            return Ok(self.stdout.trim().to_string());
        }
        let stderr = self.stderr.trim().to_string();
        let stderr = if stderr.is_empty() {
            format!("runtime returned code {:?}", self.exit_code)
        } else {
            stderr
        };
        Err(RuntimeError::Exit {
            code: self.exit_code,
            stderr,
        })
    }
}

/// Client for the external container manager.
///
/// Calls suspend the caller until the process exits or the timeout fires.
/// No retries happen at this layer.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a request and return its output whatever the exit status
    async fn execute(
        &self,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError>;

    /// Run a request, treating a non-zero exit as failure
    async fn run(&self, request: &RuntimeRequest, timeout: Duration) -> Result<String, RuntimeError> {
        let result = self.execute(request, timeout).await?.into_result();
        if let Err(e) = &result {
            error!(
                verb = request.verb(),
                container = request.container().unwrap_or("*"),
                "Runtime command failed: {}",
                e
            );
        }
        result
    }
}

/// Runtime client backed by the `lxc` command-line tool
pub struct LxcRuntime {
    binary: String,
}

impl LxcRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn execute(
        &self,
        request: &RuntimeRequest,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        let args = request.args();
        info!(
            verb = request.verb(),
            container = request.container().unwrap_or("*"),
            "Executing: {} {}",
            self.binary,
            args.join(" ")
        );

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Spawn(format!("{}: {}", self.binary, e)))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(e)) => Err(RuntimeError::Spawn(e.to_string())),
            Err(_) => {
                error!(
                    verb = request.verb(),
                    "Runtime command timed out after {:?}",
                    timeout
                );
                Err(RuntimeError::Timeout { after: timeout })
            }
        }
    }
}

/// Outcome of a disk resize: the quota is applied, filesystem growth is
/// best-effort and every failed step leaves a warning here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskGrowth {
    pub size_gb: u32,
    pub warnings: Vec<String>,
}

/// In-guest steps attempted after the quota override
const FILESYSTEM_GROW_STEPS: &[(&str, &[&str])] = &[
    (
        "install growth utilities",
        &[
            "sh",
            "-c",
            "apt-get update -y && apt-get install -y cloud-guest-utils",
        ],
    ),
    ("extend partition", &["growpart", "/dev/sda", "1"]),
    (
        "resize ext4",
        &[
            "sh",
            "-c",
            "if command -v resize2fs >/dev/null 2>&1; then resize2fs /dev/sda1; fi",
        ],
    ),
    (
        "grow xfs",
        &[
            "sh",
            "-c",
            "if command -v xfs_growfs >/dev/null 2>&1; then xfs_growfs /; fi",
        ],
    ),
];

/// Set the root disk quota, then try to grow the guest filesystem.
///
/// Only the quota step can fail the operation.
pub async fn grow_disk(
    runtime: &dyn ContainerRuntime,
    name: &str,
    size_gb: u32,
    timeouts: &Timeouts,
) -> VpsResult<DiskGrowth> {
    runtime
        .run(
            &RuntimeRequest::OverrideRootSize {
                name: name.to_string(),
                size_gb,
            },
            timeouts.default,
        )
        .await?;

    let mut growth = DiskGrowth {
        size_gb,
        warnings: Vec::new(),
    };

    for (step, argv) in FILESYSTEM_GROW_STEPS {
        let request = RuntimeRequest::Exec {
            name: name.to_string(),
            argv: argv.iter().map(|s| s.to_string()).collect(),
        };
        if let Err(e) = runtime.run(&request, timeouts.filesystem_grow).await {
            warn!(
                "Filesystem growth step '{}' may have failed in {}: {}",
                step, name, e
            );
            growth.warnings.push(format!("{}: {}", step, e));
        }
    }

    Ok(growth)
}

/// Pull snapshot names out of `info` output: every line containing
/// `snapshot:` contributes the text after its first colon.
pub fn parse_snapshot_names(info: &str) -> Vec<String> {
    info.lines()
        .filter(|line| line.contains("snapshot:"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, rest)| rest.trim().to_string())
        .collect()
}

#[cfg(test)]
pub mod testing {
    //! Scripted in-process runtime used by tests

    use std::sync::{Arc, Mutex};

    use tokio::sync::Barrier;

    use super::*;

    /// Records every request; failures and outputs are matched by argv prefix
    #[derive(Default)]
    pub struct FakeRuntime {
        calls: Mutex<Vec<RuntimeRequest>>,
        failures: Mutex<Vec<(String, RuntimeError)>>,
        outputs: Mutex<Vec<(String, CommandOutput)>>,
        launch_gate: Mutex<Option<Arc<Barrier>>>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail every request whose argv starts with `prefix`
        pub fn fail(&self, prefix: &str, error: RuntimeError) {
            self.failures
                .lock()
                .unwrap()
                .push((prefix.to_string(), error));
        }

        /// Fail with a plain non-zero exit
        pub fn fail_exit(&self, prefix: &str, stderr: &str) {
            self.fail(
                prefix,
                RuntimeError::Exit {
                    code: Some(1),
                    stderr: stderr.to_string(),
                },
            );
        }

        /// Answer requests whose argv starts with `prefix`
        pub fn respond(&self, prefix: &str, output: CommandOutput) {
            self.outputs
                .lock()
                .unwrap()
                .push((prefix.to_string(), output));
        }

        pub fn clear_failures(&self) {
            self.failures.lock().unwrap().clear();
        }

        /// Make `launch` wait until `parties` launches are in flight
        pub fn gate_launches(&self, parties: usize) {
            *self.launch_gate.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
        }

        pub fn calls(&self) -> Vec<RuntimeRequest> {
            self.calls.lock().unwrap().clone()
        }

        /// Each recorded request rendered as its argv string
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(|r| r.args().join(" ")).collect()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.command_lines()
                .iter()
                .filter(|line| line.starts_with(prefix))
                .count()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn execute(
            &self,
            request: &RuntimeRequest,
            _timeout: Duration,
        ) -> Result<CommandOutput, RuntimeError> {
            self.calls.lock().unwrap().push(request.clone());

            if matches!(request, RuntimeRequest::Launch { .. }) {
                let gate = self.launch_gate.lock().unwrap().clone();
                if let Some(gate) = gate {
                    gate.wait().await;
                }
            }

            let line = request.args().join(" ");
            let failure = self
                .failures
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, e)| e.clone());
            match failure {
                Some(RuntimeError::Exit { code, stderr }) => {
                    return Ok(CommandOutput {
                        exit_code: code,
                        stdout: String::new(),
                        stderr,
                    });
                }
                Some(e) => return Err(e),
                None => {}
            }

            let output = self
                .outputs
                .lock()
                .unwrap()
                .iter()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, o)| o.clone());
            Ok(output.unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}
