use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, StagecraftError};
use crate::exec::{CommandRunner, CommandSpec};
use crate::providers::{NetworkContext, NetworkProvider};

/// A bootstrap target. Ephemeral: lives only for the duration of one
/// bootstrap call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Captured output of a remote command that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Transport seam for running commands on a host. A non-zero exit or a
/// transport failure is an `Err` whose display carries the underlying
/// diagnostic.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        host: &Host,
        command: &str,
    ) -> Result<CommandOutput>;
}

/// `CommandExecutor` that dispatches over `ssh` in batch mode.
pub struct SshExecutor {
    runner: Arc<dyn CommandRunner>,
    user: String,
}

impl SshExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, user: impl Into<String>) -> Self {
        Self {
            runner,
            user: user.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn run(
        &self,
        cancel: &CancellationToken,
        host: &Host,
        command: &str,
    ) -> Result<CommandOutput> {
        let cmd = CommandSpec::new("ssh")
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
            ])
            .arg(format!("{}@{}", self.user, host.public_ip))
            .arg(command);
        let output = self.runner.run(cancel, &cmd).await?;
        if output.success() {
            Ok(CommandOutput {
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            Err(StagecraftError::CommandFailed(format!(
                "`{command}` exited with status {:?}: {}",
                output.status,
                output.stderr.trim()
            )))
        }
    }
}

/// Outcome for a single host. `error` is empty on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResult {
    pub host: Host,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Aggregated bootstrap report, ordered like the input host list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapResult {
    pub hosts: Vec<HostResult>,
}

impl BootstrapResult {
    pub fn all_succeeded(&self) -> bool {
        self.hosts.iter().all(|h| h.success)
    }

    pub fn success_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.hosts.len() - self.success_count()
    }
}

/// Mesh-network provider plus the opaque config it was selected with.
#[derive(Clone)]
pub struct NetworkHandle {
    pub provider: Arc<dyn NetworkProvider>,
    pub config: serde_yaml::Value,
}

const DOCKER_PROBE: &str = "docker version";
const DOCKER_INSTALL_STEPS: [&str; 3] = [
    "apt-get update -y",
    "apt-get install -y docker.io",
    "systemctl enable --now docker",
];

/// Per-host bootstrap states. Terminal states are `Succeeded` and `Failed`.
#[derive(Debug)]
enum HostState {
    Init,
    DockerCheck,
    InstallDocker,
    DockerRecheck,
    NetInstall,
    NetJoin,
    Succeeded,
    Failed(String),
}

/// Brings hosts from "SSH-reachable" to "Docker running and joined to the
/// mesh", fanning out across hosts while keeping per-host failures isolated.
pub struct BootstrapOrchestrator {
    executor: Arc<dyn CommandExecutor>,
    network: Option<NetworkHandle>,
}

impl BootstrapOrchestrator {
    pub fn new(executor: Arc<dyn CommandExecutor>, network: Option<NetworkHandle>) -> Self {
        Self { executor, network }
    }

    /// Process every host in parallel and return one result per input host,
    /// in input order. Never fails at the top level: per-host errors land in
    /// the corresponding [`HostResult`].
    pub async fn bootstrap(&self, cancel: &CancellationToken, hosts: &[Host]) -> BootstrapResult {
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let executor = Arc::clone(&self.executor);
            let network = self.network.clone();
            let host = host.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let outcome = run_host(executor.as_ref(), network.as_ref(), &cancel, &host).await;
                match outcome {
                    Ok(()) => HostResult {
                        host,
                        success: true,
                        error: String::new(),
                    },
                    Err(message) => HostResult {
                        host,
                        success: false,
                        error: message,
                    },
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, host) in handles.into_iter().zip(hosts) {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(HostResult {
                    host: host.clone(),
                    success: false,
                    error: format!("bootstrap task failed: {join_err}"),
                }),
            }
        }

        let result = BootstrapResult { hosts: results };
        info!(
            succeeded = result.success_count(),
            failed = result.failure_count(),
            "bootstrap finished"
        );
        result
    }
}

async fn run_host(
    executor: &dyn CommandExecutor,
    network: Option<&NetworkHandle>,
    cancel: &CancellationToken,
    host: &Host,
) -> std::result::Result<(), String> {
    let mut state = HostState::Init;
    loop {
        state = match state {
            HostState::Init => HostState::DockerCheck,

            HostState::DockerCheck => match executor.run(cancel, host, DOCKER_PROBE).await {
                Ok(_) => HostState::NetInstall,
                Err(_) => HostState::InstallDocker,
            },

            HostState::InstallDocker => {
                let mut failure = None;
                for step in DOCKER_INSTALL_STEPS {
                    if let Err(err) = executor.run(cancel, host, step).await {
                        failure = Some(format!("docker install failed: {err}"));
                        break;
                    }
                }
                match failure {
                    Some(message) => HostState::Failed(message),
                    None => HostState::DockerRecheck,
                }
            }

            HostState::DockerRecheck => match executor.run(cancel, host, DOCKER_PROBE).await {
                Ok(_) => HostState::NetInstall,
                Err(_) => {
                    HostState::Failed("docker verification failed after install".to_string())
                }
            },

            HostState::NetInstall => match network {
                None => HostState::Succeeded,
                Some(handle) => {
                    let ctx = NetworkContext {
                        executor,
                        cancel,
                        config: &handle.config,
                    };
                    match handle.provider.ensure_installed(&ctx, host).await {
                        Ok(()) => HostState::NetJoin,
                        Err(err) => HostState::Failed(format!(
                            "{} install failed: {}",
                            handle.provider.id(),
                            err.message
                        )),
                    }
                }
            },

            HostState::NetJoin => {
                let handle = match network {
                    Some(handle) => handle,
                    None => return Err("network join reached without a provider".to_string()),
                };
                let ctx = NetworkContext {
                    executor,
                    cancel,
                    config: &handle.config,
                };
                match handle.provider.ensure_joined(&ctx, host, &host.tags).await {
                    Ok(()) => HostState::Succeeded,
                    Err(err) => HostState::Failed(format!(
                        "{} join failed: {}",
                        handle.provider.id(),
                        err.message
                    )),
                }
            }

            HostState::Succeeded => {
                info!(host = %host.name, "bootstrap succeeded");
                return Ok(());
            }

            HostState::Failed(message) => {
                warn!(host = %host.name, error = %message, "bootstrap failed");
                return Err(message);
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted executor: commands containing a configured failure token
    /// error; everything else succeeds. All commands are recorded.
    struct ScriptedExecutor {
        fail_on: Vec<(String, String)>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedExecutor {
        fn new(fail_on: Vec<(&str, &str)>) -> Self {
            Self {
                fail_on: fail_on
                    .into_iter()
                    .map(|(h, c)| (h.to_string(), c.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, host: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, c)| c.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn run(
            &self,
            _cancel: &CancellationToken,
            host: &Host,
            command: &str,
        ) -> Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((host.name.clone(), command.to_string()));
            let fails = self
                .fail_on
                .iter()
                .any(|(h, c)| h == &host.name && command.contains(c.as_str()));
            if fails {
                Err(StagecraftError::CommandFailed(format!(
                    "`{command}` exited with status Some(1): simulated"
                )))
            } else {
                Ok(CommandOutput::default())
            }
        }
    }

    fn host(name: &str) -> Host {
        Host {
            id: name.to_string(),
            name: name.to_string(),
            public_ip: "192.0.2.1".to_string(),
            tags: vec!["web".to_string()],
        }
    }

    #[tokio::test]
    async fn healthy_host_only_probes() {
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let orchestrator = BootstrapOrchestrator::new(executor.clone(), None);
        let result = orchestrator
            .bootstrap(&CancellationToken::new(), &[host("h1")])
            .await;
        assert!(result.all_succeeded());
        assert_eq!(executor.calls_for("h1"), vec![DOCKER_PROBE.to_string()]);
    }

    #[tokio::test]
    async fn install_failure_is_isolated_and_prefixed() {
        let executor = Arc::new(ScriptedExecutor::new(vec![
            ("h2", "docker version"),
            ("h2", "apt-get install"),
        ]));
        let orchestrator = BootstrapOrchestrator::new(executor, None);
        let hosts = [host("h1"), host("h2")];
        let result = orchestrator
            .bootstrap(&CancellationToken::new(), &hosts)
            .await;
        assert_eq!(result.hosts.len(), 2);
        assert!(result.hosts[0].success);
        assert!(!result.hosts[1].success);
        assert!(result.hosts[1].error.starts_with("docker install failed:"));
        assert_eq!(result.success_count(), 1);
        assert_eq!(result.failure_count(), 1);
    }

    #[tokio::test]
    async fn failed_recheck_after_install_reports_verification() {
        // Probe fails both before and after the (successful) install steps.
        let executor = Arc::new(ScriptedExecutor::new(vec![("h1", "docker version")]));
        let orchestrator = BootstrapOrchestrator::new(executor, None);
        let result = orchestrator
            .bootstrap(&CancellationToken::new(), &[host("h1")])
            .await;
        assert_eq!(
            result.hosts[0].error,
            "docker verification failed after install"
        );
    }
}
