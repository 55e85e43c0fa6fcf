use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use crate::actions::{
    self, ApplyComposeInputs, BuildInputs, HealthCheckInputs, MigrateInputs, RenderComposeInputs,
    RolloutInputs,
};
use crate::bootstrap::{BootstrapOrchestrator, Host, NetworkHandle, SshExecutor};
use crate::compose;
use crate::config::Config;
use crate::error::{Result, StagecraftError};
use crate::exec::{binary_available, CommandRunner, CommandSpec};
use crate::plan::{Operation, OperationKind, Plan};
use crate::providers::{BuildContext, MigrateContext, Registries};

/// Base compose file expected at the project root.
const DEFAULT_COMPOSE: &str = "docker-compose.yml";

/// Default probe shape for service-based health checks. The producer sets
/// these explicitly so they travel over the wire.
const HEALTH_TIMEOUT_SECONDS: u64 = 30;
const HEALTH_INTERVAL_SECONDS: u64 = 2;
const HEALTH_RETRIES: u32 = 5;

/// Remote user for host bootstrap.
const BOOTSTRAP_USER: &str = "root";

/// Walks a plan's operations in order, converting each into its typed
/// step-action payload (normalize -> validate -> marshal) and handing the
/// strictly re-decoded payload to the matching handler. The operation
/// sequence is a total order; nothing here reorders it.
pub struct PlanExecutor<'a> {
    pub config: &'a Config,
    pub registries: &'a Registries,
    pub runner: Arc<dyn CommandRunner>,
    pub workdir: PathBuf,
    pub dry_run: bool,
}

impl PlanExecutor<'_> {
    pub async fn execute(&self, cancel: &CancellationToken, plan: &Plan) -> Result<()> {
        let span = info_span!("execute", environment = %plan.environment);
        let _enter = span.enter();
        for operation in &plan.operations {
            self.execute_operation(cancel, plan, operation).await?;
        }
        Ok(())
    }

    async fn execute_operation(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        operation: &Operation,
    ) -> Result<()> {
        info!(kind = operation.kind.as_str(), "operation");
        match operation.kind {
            OperationKind::InfraProvision => self.provision_hosts(cancel, plan).await,
            OperationKind::Migration => self.run_migration(cancel, operation).await,
            OperationKind::Build => self.run_build(cancel, operation).await,
            OperationKind::Deploy => self.run_deploy(cancel, plan, operation).await,
            OperationKind::HealthCheck => self.run_health_check(cancel, plan, operation).await,
        }
    }

    async fn provision_hosts(&self, cancel: &CancellationToken, plan: &Plan) -> Result<()> {
        let env_config = self.config.environment(&plan.environment)?;
        let hosts: Vec<Host> = env_config
            .hosts
            .iter()
            .map(|h| Host {
                id: h.name.clone(),
                name: h.name.clone(),
                public_ip: h.public_ip.clone(),
                tags: h.tags.clone(),
            })
            .collect();

        let network = match self.config.network_for(&plan.environment) {
            Some(selection) => {
                let provider =
                    self.registries.networks.get(&selection.provider).ok_or_else(|| {
                        StagecraftError::InvalidConfig(format!(
                            "network: unknown provider '{}'",
                            selection.provider
                        ))
                    })?;
                Some(NetworkHandle {
                    provider,
                    config: selection.provider_config()?.clone(),
                })
            }
            None => None,
        };

        if self.dry_run {
            info!(hosts = hosts.len(), "dry run: skipping host bootstrap");
            return Ok(());
        }

        let executor = Arc::new(SshExecutor::new(Arc::clone(&self.runner), BOOTSTRAP_USER));
        let orchestrator = BootstrapOrchestrator::new(executor, network);
        let result = orchestrator.bootstrap(cancel, &hosts).await;
        for host in &result.hosts {
            if host.success {
                info!(host = %host.host.name, "host ready");
            } else {
                warn!(host = %host.host.name, error = %host.error, "host bootstrap failed");
            }
        }
        if !result.all_succeeded() {
            return Err(StagecraftError::InstallFailed(format!(
                "bootstrap failed on {} of {} host(s)",
                result.failure_count(),
                result.hosts.len()
            )));
        }
        Ok(())
    }

    async fn run_migration(&self, cancel: &CancellationToken, operation: &Operation) -> Result<()> {
        let mut inputs = MigrateInputs {
            database: meta(operation, "database")?.to_string(),
            strategy: meta(operation, "strategy")?.to_string(),
            engine: meta(operation, "engine")?.to_string(),
            path: meta(operation, "path")?.to_string(),
            conn_env: meta(operation, "conn_env")?.to_string(),
            timeout_seconds: None,
            args: Vec::new(),
        };
        let payload = actions::encode(&mut inputs)?;
        let inputs: MigrateInputs = actions::decode_validated(&payload)?;

        let engine = self.registries.migrations.get(&inputs.engine).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!("migrations: unknown engine '{}'", inputs.engine))
        })?;

        let mut opts = crate::plan::migration_plan_options(self.config);
        opts.database = inputs.database.clone();
        opts.sources.raw_sql_dir = Some(inputs.path.clone());

        let ctx = MigrateContext {
            runner: self.runner.as_ref(),
            cancel,
            conn_env: inputs.conn_env.clone(),
            dry_run: self.dry_run,
        };

        let migrate = engine.migrate(&ctx, &opts);
        match inputs.timeout_seconds {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), migrate)
                .await
                .map_err(|_| {
                    StagecraftError::CommandFailed(format!(
                        "migration for {} timed out after {seconds}s",
                        inputs.database
                    ))
                })??,
            None => migrate.await?,
        }
        Ok(())
    }

    async fn run_build(&self, cancel: &CancellationToken, operation: &Operation) -> Result<()> {
        let role = meta(operation, "role")?;
        let image = meta(operation, "image")?.to_string();
        let provider_id = meta(operation, "provider")?.to_string();

        let selection = match role {
            "backend" => self.config.backend.as_ref(),
            "frontend" => self.config.frontend.as_ref(),
            other => {
                return Err(StagecraftError::ExecutionFailed(format!(
                    "build operation with unknown role '{other}'"
                )));
            }
        }
        .ok_or_else(|| {
            StagecraftError::InvalidConfig(format!("no {role} section configured for build"))
        })?;
        let provider_config = selection.provider_config()?.clone();

        let mut inputs = BuildInputs {
            provider: provider_id,
            workdir: ".".to_string(),
            dockerfile: yaml_str(&provider_config, "dockerfile").unwrap_or("Dockerfile").to_string(),
            context: yaml_str(&provider_config, "context").unwrap_or(".").to_string(),
            target: None,
            tags: vec![image],
            build_args: Vec::new(),
            labels: Vec::new(),
        };
        let payload = actions::encode(&mut inputs)?;
        let inputs: BuildInputs = actions::decode_validated(&payload)?;

        let ctx = BuildContext {
            runner: self.runner.as_ref(),
            cancel,
            config: &provider_config,
            workdir: self.workdir.to_string_lossy().into_owned(),
            image: inputs.tags[0].clone(),
            dry_run: self.dry_run,
        };
        let built = match role {
            "backend" => {
                let provider = self.registries.backends.get(&inputs.provider).ok_or_else(|| {
                    StagecraftError::InvalidConfig(format!(
                        "backend: unknown provider '{}'",
                        inputs.provider
                    ))
                })?;
                provider.build_docker(&ctx).await?
            }
            _ => {
                let provider = self.registries.frontends.get(&inputs.provider).ok_or_else(|| {
                    StagecraftError::InvalidConfig(format!(
                        "frontend: unknown provider '{}'",
                        inputs.provider
                    ))
                })?;
                provider.build_docker(&ctx).await?
            }
        };
        info!(image = %built, role, "image built");
        Ok(())
    }

    async fn run_deploy(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        operation: &Operation,
    ) -> Result<()> {
        let environment = meta(operation, "environment")?;
        let env_config = self.config.environment(environment)?;
        let image_tag = format!("{}:{}", self.config.project.name, plan.metadata.version);

        let mut render = RenderComposeInputs {
            environment: environment.to_string(),
            base_compose_path: Some(DEFAULT_COMPOSE.to_string()),
            base_compose_inline: None,
            overlays: env_config.overlays.clone(),
            variables: Vec::new(),
            output_path: format!(".stagecraft/rendered/{environment}/docker-compose.yml"),
            expected_compose_hash_alg: None,
            expected_compose_hash: None,
        };
        let payload = actions::encode(&mut render)?;
        let render: RenderComposeInputs = actions::decode_validated(&payload)?;

        let base = render
            .base_compose_path
            .as_deref()
            .unwrap_or(DEFAULT_COMPOSE);
        let rendered = compose::render_environment(
            &self.workdir,
            Path::new(base),
            &render.environment,
            &image_tag,
            env_config.env_file.as_deref().map(Path::new),
            &render.overlays,
        )?;

        let services: Vec<String> = meta(operation, "services")?
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let compose_rel = rendered
            .path
            .strip_prefix(&self.workdir)
            .unwrap_or(&rendered.path)
            .to_string_lossy()
            .replace('\\', "/");
        let mut inputs = ApplyComposeInputs {
            environment: environment.to_string(),
            compose_path: compose_rel,
            project_name: self.config.project.name.clone(),
            pull: Some(false),
            detach: Some(true),
            services,
            expected_compose_hash_alg: Some("sha256".to_string()),
            expected_compose_hash: Some(rendered.sha256.clone()),
        };
        let payload = actions::encode(&mut inputs)?;
        let inputs: ApplyComposeInputs = actions::decode_validated(&payload)?;
        self.apply_compose(cancel, &inputs).await
    }

    /// Consumer side of `apply_compose`: verify the content address, then
    /// roll out with docker-rollout when available, plain compose otherwise.
    pub async fn apply_compose(
        &self,
        cancel: &CancellationToken,
        inputs: &ApplyComposeInputs,
    ) -> Result<()> {
        let compose_path =
            crate::paths::resolve_under_root(&self.workdir, Path::new(&inputs.compose_path))
                .map_err(|err| StagecraftError::InvalidConfig(err.to_string()))?;
        if let Some(expected) = &inputs.expected_compose_hash {
            let bytes = std::fs::read(&compose_path)?;
            let actual = compose::sha256_hex(&bytes);
            if &actual != expected {
                return Err(StagecraftError::ExecutionFailed(format!(
                    "compose content hash mismatch for {}: expected {expected}, found {actual}",
                    inputs.compose_path
                )));
            }
        }

        if self.dry_run {
            info!(path = %compose_path.display(), "dry run: skipping compose apply");
            return Ok(());
        }

        if inputs.pull == Some(true) {
            let pull = CommandSpec::new("docker")
                .args(["compose", "-f"])
                .arg(compose_path.to_string_lossy().into_owned())
                .arg("pull");
            self.run_checked(cancel, &pull).await?;
        }

        if !inputs.services.is_empty() && self.rollout_available(cancel).await {
            let mut rollout = RolloutInputs {
                mode: "rolling".to_string(),
                batch_size: None,
                targets: inputs.services.clone(),
            };
            let payload = actions::encode(&mut rollout)?;
            let rollout: RolloutInputs = actions::decode_validated(&payload)?;
            info!(mode = %rollout.mode, "rolling out via docker-rollout");
            let cmd = CommandSpec::new("docker-rollout")
                .args(["up", "-f"])
                .arg(compose_path.to_string_lossy().into_owned());
            return self.run_checked(cancel, &cmd).await;
        }

        let mut cmd = CommandSpec::new("docker")
            .args(["compose", "-f"])
            .arg(compose_path.to_string_lossy().into_owned())
            .args(["-p", inputs.project_name.as_str()])
            .arg("up");
        if inputs.detach == Some(true) {
            cmd = cmd.arg("-d");
        }
        self.run_checked(cancel, &cmd).await
    }

    /// Availability probe: a clean `docker-rollout --version` exit.
    async fn rollout_available(&self, cancel: &CancellationToken) -> bool {
        if !binary_available("docker-rollout") {
            return false;
        }
        let probe = CommandSpec::new("docker-rollout").arg("--version");
        matches!(self.runner.run(cancel, &probe).await, Ok(output) if output.success())
    }

    async fn run_health_check(
        &self,
        cancel: &CancellationToken,
        plan: &Plan,
        operation: &Operation,
    ) -> Result<()> {
        let environment = meta(operation, "environment")?;
        let services: Vec<String> = plan
            .operations
            .iter()
            .find(|op| op.kind == OperationKind::Deploy)
            .and_then(|op| op.meta("services"))
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if services.is_empty() {
            info!("no services to health check");
            return Ok(());
        }

        let mut inputs = HealthCheckInputs {
            environment: environment.to_string(),
            endpoints: Vec::new(),
            services,
            timeout_seconds: Some(HEALTH_TIMEOUT_SECONDS),
            interval_seconds: Some(HEALTH_INTERVAL_SECONDS),
            retries: Some(HEALTH_RETRIES),
        };
        let payload = actions::encode(&mut inputs)?;
        let inputs: HealthCheckInputs = actions::decode_validated(&payload)?;
        self.health_check(cancel, &inputs).await
    }

    /// Consumer side of `health_check`: service probes go through
    /// `docker compose ps`; endpoint probes issue real HTTP requests.
    pub async fn health_check(
        &self,
        cancel: &CancellationToken,
        inputs: &HealthCheckInputs,
    ) -> Result<()> {
        if self.dry_run {
            info!("dry run: skipping health checks");
            return Ok(());
        }
        let interval = Duration::from_secs(inputs.interval_seconds.unwrap_or(2));
        let timeout = Duration::from_secs(inputs.timeout_seconds.unwrap_or(30));
        let retries = inputs.retries.unwrap_or(3);

        for service in &inputs.services {
            let compose_path = self
                .workdir
                .join(".stagecraft")
                .join("rendered")
                .join(&inputs.environment)
                .join("docker-compose.yml");
            let cmd = CommandSpec::new("docker")
                .args(["compose", "-f"])
                .arg(compose_path.to_string_lossy().into_owned())
                .args(["ps", "--status", "running"])
                .arg(service.as_str());
            self.probe_with_retries(cancel, retries, interval, service, || async {
                let output = self.runner.run(cancel, &cmd).await?;
                if output.success() && output.stdout.contains(service.as_str()) {
                    Ok(())
                } else {
                    Err(StagecraftError::CommandFailed(format!(
                        "service {service} is not running"
                    )))
                }
            })
            .await?;
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StagecraftError::ExecutionFailed(err.to_string()))?;
        for endpoint in &inputs.endpoints {
            let method = reqwest::Method::from_bytes(endpoint.method.as_bytes())
                .map_err(|_| {
                    StagecraftError::InvalidConfig(format!(
                        "endpoints.method: unknown method '{}'",
                        endpoint.method
                    ))
                })?;
            self.probe_with_retries(cancel, retries, interval, &endpoint.name, || async {
                let mut request = client.request(method.clone(), &endpoint.url);
                for header in &endpoint.headers {
                    request = request.header(&header.key, &header.value);
                }
                let response = request.send().await.map_err(|err| {
                    StagecraftError::CommandFailed(format!(
                        "endpoint {} unreachable: {err}",
                        endpoint.name
                    ))
                })?;
                if response.status().as_u16() == endpoint.expected_status {
                    Ok(())
                } else {
                    Err(StagecraftError::CommandFailed(format!(
                        "endpoint {} returned {}, expected {}",
                        endpoint.name,
                        response.status().as_u16(),
                        endpoint.expected_status
                    )))
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn probe_with_retries<F, Fut>(
        &self,
        cancel: &CancellationToken,
        retries: u32,
        interval: Duration,
        subject: &str,
        probe: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut last_error = None;
        for attempt in 1..=retries {
            if cancel.is_cancelled() {
                return Err(StagecraftError::Cancelled);
            }
            match probe().await {
                Ok(()) => {
                    info!(subject, attempt, "health check passed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(subject, attempt, error = %err, "health check attempt failed");
                    last_error = Some(err);
                    if attempt < retries {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            StagecraftError::ExecutionFailed(format!("health check for {subject} never ran"))
        }))
    }

    async fn run_checked(&self, cancel: &CancellationToken, cmd: &CommandSpec) -> Result<()> {
        let output = self.runner.run(cancel, cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(StagecraftError::CommandFailed(format!(
                "`{}` exited with status {:?}: {}",
                cmd.display_line(),
                output.status,
                output.stderr.trim()
            )))
        }
    }
}

fn meta<'a>(operation: &'a Operation, field: &str) -> Result<&'a str> {
    operation.meta(field).ok_or_else(|| {
        StagecraftError::ExecutionFailed(format!(
            "{} operation missing metadata field '{field}'",
            operation.kind.as_str()
        ))
    })
}

fn yaml_str<'a>(value: &'a serde_yaml::Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(|v| v.as_str())
}
