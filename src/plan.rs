use std::collections::{BTreeMap, BTreeSet};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::config::{Config, MigrationStrategy};
use crate::error::{Result, StagecraftError};
use crate::providers::{MigrationPlanOptions, PlanOptions, ProviderPlan, Registries};

/// Operation kinds in the canonical deploy sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    InfraProvision,
    Migration,
    Build,
    Deploy,
    HealthCheck,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::InfraProvision => "infra_provision",
            OperationKind::Migration => "migration",
            OperationKind::Build => "build",
            OperationKind::Deploy => "deploy",
            OperationKind::HealthCheck => "health_check",
        }
    }
}

/// One step of a plan. Metadata keys are sorted by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Operation {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            metadata: BTreeMap::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Plan metadata. Provider plans are kept as a map keyed by provider ID for
/// fast lookup; JSON emits them as a provider-sorted sequence so output is
/// byte-stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub version: String,
    #[serde(
        serialize_with = "provider_plans_as_sorted_seq",
        deserialize_with = "provider_plans_from_seq",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub provider_plans: BTreeMap<String, ProviderPlan>,
}

fn provider_plans_as_sorted_seq<S: Serializer>(
    plans: &BTreeMap<String, ProviderPlan>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(plans.values())
}

fn provider_plans_from_seq<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, ProviderPlan>, D::Error> {
    let plans = Vec::<ProviderPlan>::deserialize(deserializer)?;
    Ok(plans
        .into_iter()
        .map(|plan| (plan.provider.clone(), plan))
        .collect())
}

/// A deterministic description of what `deploy` would do. Constructed once
/// by [`plan_deploy`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub environment: String,
    pub operations: Vec<Operation>,
    pub metadata: PlanMetadata,
}

impl Plan {
    pub fn provider_plan(&self, provider: &str) -> Option<&ProviderPlan> {
        self.metadata.provider_plans.get(provider)
    }

    /// Byte-stable JSON rendering: struct field order is fixed and every
    /// map is sorted, so identical plans serialize identically.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Compact text rendering for the CLI.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "Plan for environment {} (version {})\n",
            self.environment, self.metadata.version
        );
        for (index, op) in self.operations.iter().enumerate() {
            out.push_str(&format!("{:>3}. {}", index + 1, op.kind.as_str()));
            if !op.metadata.is_empty() {
                let fields: Vec<String> = op
                    .metadata
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                out.push_str(&format!(" [{}]", fields.join(" ")));
            }
            out.push('\n');
        }
        for plan in self.metadata.provider_plans.values() {
            out.push_str(&format!("provider {}:\n", plan.provider));
            for step in &plan.steps {
                out.push_str(&format!("  - {}: {}\n", step.name, step.description));
            }
        }
        out
    }
}

/// Pure planner: `(config, environment, version) -> Plan`. Consults each
/// involved provider's `plan` for its declarative steps; any provider error
/// aborts planning with no partial plan.
pub async fn plan_deploy(
    config: &Config,
    registries: &Registries,
    environment: &str,
    version: &str,
) -> Result<Plan> {
    let env_config = config.environment(environment)?;

    let mut operations = Vec::new();

    if !env_config.hosts.is_empty() {
        let hosts: Vec<&str> = env_config.hosts.iter().map(|h| h.name.as_str()).collect();
        operations.push(
            Operation::new(OperationKind::InfraProvision).with("hosts", hosts.join(",")),
        );
    }

    push_migration_ops(config, environment, MigrationStrategy::PreDeploy, &mut operations);

    let mut services = Vec::new();
    if let Some(backend) = &config.backend {
        services.push("backend");
        operations.push(
            Operation::new(OperationKind::Build)
                .with("provider", &backend.provider)
                .with("role", "backend")
                .with("service", "backend")
                .with("image", format!("{}-backend:{version}", config.project.name)),
        );
    }
    if let Some(frontend) = &config.frontend {
        services.push("frontend");
        operations.push(
            Operation::new(OperationKind::Build)
                .with("provider", &frontend.provider)
                .with("role", "frontend")
                .with("service", "frontend")
                .with("image", format!("{}-frontend:{version}", config.project.name)),
        );
    }

    operations.push(
        Operation::new(OperationKind::Deploy)
            .with("environment", environment)
            .with("services", services.join(",")),
    );

    push_migration_ops(config, environment, MigrationStrategy::PostDeploy, &mut operations);

    operations.push(Operation::new(OperationKind::HealthCheck).with("environment", environment));

    let provider_plans =
        collect_provider_plans(config, registries, environment, version).await?;

    Ok(Plan {
        environment: environment.to_string(),
        operations,
        metadata: PlanMetadata {
            version: version.to_string(),
            provider_plans,
        },
    })
}

fn push_migration_ops(
    config: &Config,
    environment: &str,
    strategy: MigrationStrategy,
    operations: &mut Vec<Operation>,
) {
    for (name, db) in &config.databases {
        let Some(migrations) = &db.migrations else {
            continue;
        };
        if migrations.strategy != strategy || !migrations_enabled(config, environment) {
            continue;
        }
        operations.push(
            Operation::new(OperationKind::Migration)
                .with("database", name)
                .with("engine", &migrations.engine)
                .with("path", &migrations.path)
                .with("strategy", strategy.as_str())
                .with("conn_env", &db.connection_env),
        );
    }
}

fn migrations_enabled(config: &Config, environment: &str) -> bool {
    let Some(migrations) = &config.migrations else {
        return true;
    };
    migrations
        .env
        .get(environment)
        .and_then(|o| o.enabled)
        .or(migrations.enabled)
        .unwrap_or(true)
}

async fn collect_provider_plans(
    config: &Config,
    registries: &Registries,
    environment: &str,
    version: &str,
) -> Result<BTreeMap<String, ProviderPlan>> {
    let mut plans = BTreeMap::new();

    if let Some(backend) = &config.backend {
        let provider = registries.backends.get(&backend.provider).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!("backend: unknown provider '{}'", backend.provider))
        })?;
        let opts = PlanOptions {
            project: config.project.name.clone(),
            environment: environment.to_string(),
            version: version.to_string(),
            config: backend.provider_config()?.clone(),
        };
        let plan = provider
            .plan(&opts)
            .await
            .map_err(|err| StagecraftError::PlanFailed(err.to_string()))?;
        plans.insert(plan.provider.clone(), plan);
    }

    if let Some(frontend) = &config.frontend {
        let provider = registries.frontends.get(&frontend.provider).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!(
                "frontend: unknown provider '{}'",
                frontend.provider
            ))
        })?;
        let opts = PlanOptions {
            project: config.project.name.clone(),
            environment: environment.to_string(),
            version: version.to_string(),
            config: frontend.provider_config()?.clone(),
        };
        let plan = provider
            .plan(&opts)
            .await
            .map_err(|err| StagecraftError::PlanFailed(err.to_string()))?;
        plans.insert(plan.provider.clone(), plan);
    }

    let engines: BTreeSet<&str> = config
        .databases
        .values()
        .filter_map(|db| db.migrations.as_ref())
        .map(|m| m.engine.as_str())
        .collect();
    for engine_id in engines {
        let engine = registries.migrations.get(engine_id).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!("migrations: unknown engine '{engine_id}'"))
        })?;
        let opts = migration_plan_options(config);
        let plan = engine
            .plan(&opts)
            .await
            .map_err(|err| StagecraftError::PlanFailed(err.to_string()))?;
        plans.insert(plan.provider.clone(), plan);
    }

    if let Some(network) = config.network_for(environment) {
        let provider = registries.networks.get(&network.provider).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!("network: unknown provider '{}'", network.provider))
        })?;
        let opts = PlanOptions {
            project: config.project.name.clone(),
            environment: environment.to_string(),
            version: version.to_string(),
            config: network.provider_config()?.clone(),
        };
        let plan = provider
            .plan(&opts)
            .await
            .map_err(|err| StagecraftError::PlanFailed(err.to_string()))?;
        plans.insert(plan.provider.clone(), plan);
    }

    Ok(plans)
}

/// Planning inputs for migration engines, derived from the global
/// `migrations` section. Per-database paths travel in operation metadata.
pub fn migration_plan_options(config: &Config) -> MigrationPlanOptions {
    let (sources, selection, engine_config) = match &config.migrations {
        Some(migrations) => (
            migrations.sources.clone(),
            migrations.selection.clone(),
            migrations
                .engine_config
                .get(&migrations.default_engine)
                .cloned()
                .unwrap_or(serde_yaml::Value::Null),
        ),
        None => (
            Default::default(),
            Default::default(),
            serde_yaml::Value::Null,
        ),
    };
    MigrationPlanOptions {
        database: String::new(),
        sources,
        selection,
        engine_config,
    }
}

/// Dependency-preserving service filter. A deploy operation is retained
/// when any of its services is selected; builds feeding a retained deploy
/// are retained even when the build itself was not selected. Operations
/// that are not service-scoped always survive.
pub fn filter_services(plan: &Plan, services: &[String]) -> Plan {
    if services.is_empty() {
        return plan.clone();
    }
    let selected: BTreeSet<&str> = services.iter().map(String::as_str).collect();

    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for op in &plan.operations {
        if op.kind != OperationKind::Deploy {
            continue;
        }
        let deploy_services = split_services(op.meta("services"));
        if deploy_services.iter().any(|s| selected.contains(s.as_str())) {
            referenced.extend(deploy_services);
        }
    }

    let operations = plan
        .operations
        .iter()
        .filter(|op| match op.kind {
            OperationKind::Build => op
                .meta("service")
                .is_some_and(|s| selected.contains(s) || referenced.contains(s)),
            OperationKind::Deploy => split_services(op.meta("services"))
                .iter()
                .any(|s| selected.contains(s.as_str())),
            _ => true,
        })
        .cloned()
        .collect();

    Plan {
        environment: plan.environment.clone(),
        operations,
        metadata: plan.metadata.clone(),
    }
}

fn split_services(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderStep;

    fn sample_plan() -> Plan {
        let mut provider_plans = BTreeMap::new();
        provider_plans.insert(
            "tailscale".to_string(),
            ProviderPlan {
                provider: "tailscale".to_string(),
                steps: vec![ProviderStep::new("join", "join tailnet")],
            },
        );
        provider_plans.insert(
            "generic".to_string(),
            ProviderPlan {
                provider: "generic".to_string(),
                steps: vec![ProviderStep::new("docker-build", "build image")],
            },
        );
        Plan {
            environment: "staging".to_string(),
            operations: vec![
                Operation::new(OperationKind::Build)
                    .with("service", "backend")
                    .with("role", "backend"),
                Operation::new(OperationKind::Deploy).with("services", "backend,frontend"),
                Operation::new(OperationKind::HealthCheck),
            ],
            metadata: PlanMetadata {
                version: "v1".to_string(),
                provider_plans,
            },
        }
    }

    #[test]
    fn provider_plans_serialize_sorted_by_provider() {
        let json = sample_plan().to_json().unwrap();
        let generic = json.find("\"generic\"").unwrap();
        let tailscale = json.find("\"tailscale\"").unwrap();
        assert!(generic < tailscale);
    }

    #[test]
    fn json_round_trip_preserves_the_plan() {
        let plan = sample_plan();
        let json = plan.to_json().unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.to_json().unwrap(), json);
    }

    #[test]
    fn filter_keeps_upstream_build_for_selected_deploy() {
        let plan = sample_plan();
        // Selecting only the frontend still keeps the backend build because
        // the retained deploy references the backend service.
        let filtered = filter_services(&plan, &["frontend".to_string()]);
        let kinds: Vec<OperationKind> = filtered.operations.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::Build,
                OperationKind::Deploy,
                OperationKind::HealthCheck
            ]
        );
    }

    #[test]
    fn filter_drops_unrelated_deploys() {
        let plan = sample_plan();
        let filtered = filter_services(&plan, &["worker".to_string()]);
        let kinds: Vec<OperationKind> = filtered.operations.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OperationKind::HealthCheck]);
    }

    #[test]
    fn empty_filter_is_identity() {
        let plan = sample_plan();
        assert_eq!(filter_services(&plan, &[]), plan);
    }
}
