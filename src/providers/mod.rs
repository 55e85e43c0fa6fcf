use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::Host;
use crate::config::{Config, MigrationSelection, MigrationSources};
use crate::error::{Result, StagecraftError};
use crate::exec::CommandRunner;
use crate::secrets::SecretSpec;

pub mod digitalocean;
pub mod encore;
pub mod generic;
pub mod raw_sql;
pub mod tailscale;

pub use digitalocean::DigitalOceanCloud;
pub use encore::EncoreBackend;
pub use generic::{GenericBackend, GenericFrontend};
pub use raw_sql::RawSqlEngine;
pub use tailscale::TailscaleNetwork;

/// Operation a provider was performing when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOp {
    Plan,
    Dev,
    Build,
    Migrate,
    Install,
    Join,
    Sync,
    Diff,
}

impl ProviderOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderOp::Plan => "plan",
            ProviderOp::Dev => "dev",
            ProviderOp::Build => "build",
            ProviderOp::Migrate => "migrate",
            ProviderOp::Install => "install",
            ProviderOp::Join => "join",
            ProviderOp::Sync => "sync",
            ProviderOp::Diff => "diff",
        }
    }
}

impl fmt::Display for ProviderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy shared by every provider domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    InvalidConfig,
    NotAvailable,
    DevServerFailed,
    BuildFailed,
    SecretSyncFailed,
    InstallFailed,
    UnsupportedOs,
    ExecutionFailed,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::InvalidConfig => "INVALID_CONFIG",
            ProviderErrorKind::NotAvailable => "PROVIDER_NOT_AVAILABLE",
            ProviderErrorKind::DevServerFailed => "DEV_SERVER_FAILED",
            ProviderErrorKind::BuildFailed => "BUILD_FAILED",
            ProviderErrorKind::SecretSyncFailed => "SECRET_SYNC_FAILED",
            ProviderErrorKind::InstallFailed => "INSTALL_FAILED",
            ProviderErrorKind::UnsupportedOs => "UNSUPPORTED_OS",
            ProviderErrorKind::ExecutionFailed => "EXECUTION_FAILED",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const DETAIL_LIMIT: usize = 600;

/// Provider-level error carrying the provider ID and the failing operation.
/// Secret values must never reach `message` or `detail`; callers scrub
/// child-process output before attaching it.
#[derive(Debug, Clone, Error)]
#[error("provider '{provider}' {operation}: {kind}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub operation: ProviderOp,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        operation: ProviderOp,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            operation,
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach truncated diagnostic output (e.g. child stderr).
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let mut detail = detail.into();
        if detail.len() > DETAIL_LIMIT {
            let mut cut = DETAIL_LIMIT;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
            detail.push_str("…");
        }
        self.detail = Some(detail);
        self
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A provider's declarative account of the steps it would perform.
/// Step order is meaningful and preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPlan {
    pub provider: String,
    pub steps: Vec<ProviderStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStep {
    pub name: String,
    pub description: String,
}

impl ProviderStep {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Read-only inputs handed to a provider's `plan`. Providers must derive
/// their steps from these values alone: no network, no host probing, no
/// environment lookups.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub project: String,
    pub environment: String,
    pub version: String,
    /// Opaque provider-scoped config; the provider decodes and validates it.
    pub config: serde_yaml::Value,
}

/// Execution context for backend builds.
pub struct BuildContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub cancel: &'a CancellationToken,
    pub config: &'a serde_yaml::Value,
    pub workdir: String,
    /// Fully qualified image reference to produce (`name:tag`).
    pub image: String,
    pub dry_run: bool,
}

/// Execution context for `dev` mode.
pub struct DevContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub cancel: &'a CancellationToken,
    pub config: &'a serde_yaml::Value,
    pub workdir: String,
    /// Local CA certificate handed to the dev server, when one exists.
    pub ca_cert: Option<String>,
    pub dry_run: bool,
}

/// Execution context for network install/join against a remote host.
pub struct NetworkContext<'a> {
    pub executor: &'a dyn crate::bootstrap::CommandExecutor,
    pub cancel: &'a CancellationToken,
    pub config: &'a serde_yaml::Value,
}

/// Planning inputs for a migration engine.
#[derive(Debug, Clone)]
pub struct MigrationPlanOptions {
    pub database: String,
    pub sources: MigrationSources,
    pub selection: MigrationSelection,
    pub engine_config: serde_yaml::Value,
}

/// Execution context for running discovered migrations.
pub struct MigrateContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub cancel: &'a CancellationToken,
    pub conn_env: String,
    pub dry_run: bool,
}

/// Common identity spine shared by every provider domain.
pub trait ProviderIdentity {
    /// Stable identifier matched against `config.<domain>.provider`.
    fn id(&self) -> &'static str;
}

/// Backend runtime provider: plans, runs dev servers, builds images.
#[async_trait]
pub trait BackendProvider: ProviderIdentity + Send + Sync {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan>;
    async fn dev(&self, ctx: &DevContext<'_>) -> ProviderResult<()>;
    /// Builds the backend image and returns the produced image reference.
    async fn build_docker(&self, ctx: &BuildContext<'_>) -> ProviderResult<String>;
}

/// Frontend provider: plans and builds static or SSR frontends into images.
#[async_trait]
pub trait FrontendProvider: ProviderIdentity + Send + Sync {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan>;
    async fn build_docker(&self, ctx: &BuildContext<'_>) -> ProviderResult<String>;
}

/// Migration engine: discovers ordered migration sources and applies them.
#[async_trait]
pub trait MigrationEngine: ProviderIdentity + Send + Sync {
    async fn plan(&self, opts: &MigrationPlanOptions) -> ProviderResult<ProviderPlan>;
    /// Ordered, deduplicated migration source paths for these options.
    fn discover(&self, opts: &MigrationPlanOptions) -> ProviderResult<Vec<String>>;
    async fn migrate(
        &self,
        ctx: &MigrateContext<'_>,
        opts: &MigrationPlanOptions,
    ) -> ProviderResult<()>;
}

/// Mesh-network provider: installs the network CLI on hosts and joins them.
#[async_trait]
pub trait NetworkProvider: ProviderIdentity + Send + Sync {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan>;
    async fn ensure_installed(&self, ctx: &NetworkContext<'_>, host: &Host) -> ProviderResult<()>;
    async fn ensure_joined(
        &self,
        ctx: &NetworkContext<'_>,
        host: &Host,
        tags: &[String],
    ) -> ProviderResult<()>;
    /// Pure derivation of the host's mesh FQDN from declared config.
    fn node_fqdn(&self, config: &serde_yaml::Value, host: &Host) -> ProviderResult<String>;
}

/// A cloud resource in the desired/current inventory handed to cloud diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    pub kind: String,
    pub name: String,
}

/// Cloud provider: plans are pure diffs of desired vs current inventory;
/// discovery of `current` happens outside `plan_diff`.
pub trait CloudProvider: ProviderIdentity + Send + Sync {
    fn plan_diff(&self, desired: &[CloudResource], current: &[CloudResource]) -> ProviderPlan;
}

/// CI provider: plans pipeline wiring for the project.
#[async_trait]
pub trait CiProvider: ProviderIdentity + Send + Sync {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan>;
}

/// Secrets provider: pushes declared secrets into a backing store.
#[async_trait]
pub trait SecretsProvider: ProviderIdentity + Send + Sync {
    async fn sync(
        &self,
        runner: &dyn CommandRunner,
        cancel: &CancellationToken,
        specs: &[SecretSpec],
    ) -> ProviderResult<()>;
}

/// Per-domain provider registry. Populated once at startup via
/// [`register_providers`]; read-only afterwards.
pub struct Registry<P: ?Sized> {
    entries: BTreeMap<String, Arc<P>>,
}

impl<P: ProviderIdentity + ?Sized> Registry<P> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<P>) {
        self.entries.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<P>> {
        self.entries.get(id).cloned()
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered IDs in lexicographic order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

impl<P: ProviderIdentity + ?Sized> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// All domain registries, created empty and populated explicitly at startup.
#[derive(Default)]
pub struct Registries {
    pub backends: Registry<dyn BackendProvider>,
    pub frontends: Registry<dyn FrontendProvider>,
    pub migrations: Registry<dyn MigrationEngine>,
    pub networks: Registry<dyn NetworkProvider>,
    pub clouds: Registry<dyn CloudProvider>,
    pub ci: Registry<dyn CiProvider>,
    pub secrets: Registry<dyn SecretsProvider>,
}

impl Registries {
    /// Validate that every provider ID the config references is registered.
    pub fn validate_config(&self, config: &Config) -> Result<()> {
        if let Some(backend) = &config.backend {
            self.require("backend", &backend.provider, self.backends.has(&backend.provider))?;
        }
        if let Some(frontend) = &config.frontend {
            self.require(
                "frontend",
                &frontend.provider,
                self.frontends.has(&frontend.provider),
            )?;
        }
        if let Some(network) = &config.network {
            self.require("network", &network.provider, self.networks.has(&network.provider))?;
        }
        for (env, spec) in &config.environments {
            if let Some(network) = &spec.network {
                self.require(
                    &format!("environments.{env}.network"),
                    &network.provider,
                    self.networks.has(&network.provider),
                )?;
            }
        }
        for (name, db) in &config.databases {
            if let Some(migrations) = &db.migrations {
                self.require(
                    &format!("databases.{name}.migrations"),
                    &migrations.engine,
                    self.migrations.has(&migrations.engine),
                )?;
            }
        }
        if let Some(migrations) = &config.migrations {
            self.require(
                "migrations",
                &migrations.default_engine,
                self.migrations.has(&migrations.default_engine),
            )?;
        }
        Ok(())
    }

    fn require(&self, field: &str, id: &str, present: bool) -> Result<()> {
        if present {
            Ok(())
        } else {
            Err(StagecraftError::InvalidConfig(format!(
                "{field}: unknown provider '{id}'"
            )))
        }
    }
}

/// Explicit startup registration of the built-in providers. Called from
/// command dispatch so registration order and content are deterministic and
/// visible in one place.
pub fn register_providers(registries: &mut Registries) {
    registries.backends.register(Arc::new(GenericBackend));
    registries.backends.register(Arc::new(EncoreBackend));
    registries.frontends.register(Arc::new(GenericFrontend));
    registries.migrations.register(Arc::new(RawSqlEngine));
    registries.networks.register(Arc::new(TailscaleNetwork));
    registries.clouds.register(Arc::new(DigitalOceanCloud));
}

/// Decode an opaque provider config map into the provider's own shape,
/// erroring with the provider ID and serde's field path on mismatch.
pub fn decode_provider_config<T: DeserializeOwned>(
    provider: &'static str,
    operation: ProviderOp,
    value: &serde_yaml::Value,
) -> ProviderResult<T> {
    serde_yaml::from_value(value.clone()).map_err(|err| {
        ProviderError::new(
            provider,
            operation,
            ProviderErrorKind::InvalidConfig,
            err.to_string(),
        )
    })
}
