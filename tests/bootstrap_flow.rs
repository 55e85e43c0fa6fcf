use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stagecraft::bootstrap::{
    BootstrapOrchestrator, CommandExecutor, CommandOutput, Host, NetworkHandle,
};
use stagecraft::providers::{
    NetworkContext, NetworkProvider, PlanOptions, ProviderError, ProviderErrorKind,
    ProviderIdentity, ProviderOp, ProviderPlan, ProviderResult,
};
use stagecraft::{Result, StagecraftError};

/// Executor scripted per (host, command-substring) failure pairs; records
/// every dispatched command.
struct ScriptedExecutor {
    fail_on: Vec<(String, String)>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    fn new(fail_on: &[(&str, &str)]) -> Self {
        Self {
            fail_on: fail_on
                .iter()
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
                "`{command}` exited with status Some(100): E: Unable to locate package"
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
        public_ip: "192.0.2.7".to_string(),
        tags: vec!["web".to_string()],
    }
}

#[tokio::test]
async fn mixed_results_keep_input_order_and_isolation() {
    // host-1 has Docker; host-3 lacks it and fails at apt-get install.
    // The successful install path is covered separately below.
    let executor = Arc::new(ScriptedExecutor::new(&[
        ("host-3", "docker version"),
        ("host-3", "apt-get install"),
    ]));
    let orchestrator =
        BootstrapOrchestrator::new(Arc::clone(&executor) as Arc<dyn CommandExecutor>, None);
    let hosts = [host("host-1"), host("host-3")];
    let result = orchestrator
        .bootstrap(&CancellationToken::new(), &hosts)
        .await;

    assert_eq!(result.hosts.len(), 2);
    assert_eq!(result.hosts[0].host.name, "host-1");
    assert_eq!(result.hosts[1].host.name, "host-3");
    assert!(result.hosts[0].success);
    assert!(!result.hosts[1].success);
    assert!(result.hosts[1].error.starts_with("docker install failed:"));
    assert!(!result.all_succeeded());
    assert_eq!(result.success_count(), 1);
    assert_eq!(result.failure_count(), 1);

    // No install commands were issued for the healthy host.
    assert_eq!(executor.calls_for("host-1"), vec!["docker version".to_string()]);
    // The failing host stopped at the failing step.
    let host3 = executor.calls_for("host-3");
    assert_eq!(
        host3,
        vec![
            "docker version".to_string(),
            "apt-get update -y".to_string(),
            "apt-get install -y docker.io".to_string(),
        ]
    );
}

/// Stateful executor: the docker probe fails once, then succeeds, modelling
/// a host whose install brings Docker up.
struct InstallingExecutor {
    probes: Mutex<u32>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandExecutor for InstallingExecutor {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        _host: &Host,
        command: &str,
    ) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(command.to_string());
        if command == "docker version" {
            let mut probes = self.probes.lock().unwrap();
            *probes += 1;
            if *probes == 1 {
                return Err(StagecraftError::CommandFailed(
                    "`docker version` exited with status Some(127): not found".to_string(),
                ));
            }
        }
        Ok(CommandOutput::default())
    }
}

#[tokio::test]
async fn install_path_runs_all_steps_then_verifies() {
    let executor = Arc::new(InstallingExecutor {
        probes: Mutex::new(0),
        calls: Mutex::new(Vec::new()),
    });
    let orchestrator = BootstrapOrchestrator::new(Arc::clone(&executor) as Arc<dyn CommandExecutor>, None);
    let result = orchestrator
        .bootstrap(&CancellationToken::new(), &[host("host-2")])
        .await;
    assert!(result.all_succeeded());
    assert_eq!(
        *executor.calls.lock().unwrap(),
        vec![
            "docker version",
            "apt-get update -y",
            "apt-get install -y docker.io",
            "systemctl enable --now docker",
            "docker version",
        ]
    );
}

/// Network provider whose join always fails; install succeeds.
struct FailingJoinNetwork;

impl ProviderIdentity for FailingJoinNetwork {
    fn id(&self) -> &'static str {
        "meshnet"
    }
}

#[async_trait]
impl NetworkProvider for FailingJoinNetwork {
    async fn plan(&self, _opts: &PlanOptions) -> ProviderResult<ProviderPlan> {
        Ok(ProviderPlan {
            provider: "meshnet".to_string(),
            steps: Vec::new(),
        })
    }

    async fn ensure_installed(
        &self,
        _ctx: &NetworkContext<'_>,
        _host: &Host,
    ) -> ProviderResult<()> {
        Ok(())
    }

    async fn ensure_joined(
        &self,
        _ctx: &NetworkContext<'_>,
        _host: &Host,
        _tags: &[String],
    ) -> ProviderResult<()> {
        Err(ProviderError::new(
            "meshnet",
            ProviderOp::Join,
            ProviderErrorKind::InstallFailed,
            "auth key rejected",
        ))
    }

    fn node_fqdn(
        &self,
        _config: &serde_yaml::Value,
        host: &Host,
    ) -> ProviderResult<String> {
        Ok(format!("{}.mesh.example", host.name))
    }
}

#[tokio::test]
async fn network_join_failures_use_the_provider_prefix() {
    let executor = Arc::new(ScriptedExecutor::new(&[]));
    let network = NetworkHandle {
        provider: Arc::new(FailingJoinNetwork),
        config: serde_yaml::Value::Null,
    };
    let orchestrator = BootstrapOrchestrator::new(executor, Some(network));
    let result = orchestrator
        .bootstrap(&CancellationToken::new(), &[host("host-1")])
        .await;
    assert!(!result.all_succeeded());
    assert!(result.hosts[0].error.starts_with("meshnet join failed:"));
    assert!(result.hosts[0].error.contains("auth key rejected"));
}

#[tokio::test]
async fn every_input_host_appears_exactly_once_in_order() {
    let executor = Arc::new(ScriptedExecutor::new(&[]));
    let hosts: Vec<Host> = (0..8).map(|i| host(&format!("node-{i}"))).collect();
    let orchestrator = BootstrapOrchestrator::new(executor, None);
    let result = orchestrator
        .bootstrap(&CancellationToken::new(), &hosts)
        .await;
    assert_eq!(result.hosts.len(), hosts.len());
    for (expected, got) in hosts.iter().zip(&result.hosts) {
        assert_eq!(expected.name, got.host.name);
    }
}
