use std::env;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::exec::{CommandRunner, CommandSpec};
use crate::providers::{
    decode_provider_config, BackendProvider, BuildContext, DevContext, PlanOptions, ProviderError,
    ProviderErrorKind, ProviderIdentity, ProviderOp, ProviderPlan, ProviderResult, ProviderStep,
};
use crate::secrets::{SecretNames, SecretSpec};
use tokio_util::sync::CancellationToken;

const ENCORE_ID: &str = "encore";

/// Telemetry is always disabled for reproducible, offline-friendly runs.
const TELEMETRY_DISABLE: (&str, &str) = ("ENCORE_TELEMETRY_DISABLED", "1");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EncoreConfig {
    #[serde(default)]
    workdir: Option<String>,
    /// Secrets synced before dev runs and builds. Values come from the
    /// local environment variable of the same name and travel over stdin.
    #[serde(default)]
    secrets: Vec<SecretSpec>,
}

impl EncoreConfig {
    fn decode(value: &serde_yaml::Value, operation: ProviderOp) -> ProviderResult<EncoreConfig> {
        decode_provider_config(ENCORE_ID, operation, value)
    }

    fn sorted_secrets(&self) -> Vec<SecretSpec> {
        let mut secrets = self.secrets.clone();
        secrets.sort_by(|a, b| (&a.name, &a.kind).cmp(&(&b.name, &b.kind)));
        secrets
    }
}

async fn sync_secrets(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    workdir: &str,
    secrets: &[SecretSpec],
    dry_run: bool,
) -> ProviderResult<()> {
    for spec in secrets {
        let value = env::var(&spec.name).map_err(|_| {
            ProviderError::new(
                ENCORE_ID,
                ProviderOp::Sync,
                ProviderErrorKind::SecretSyncFailed,
                format!("environment variable {} is not set", spec.name),
            )
        })?;

        let cmd = CommandSpec::new("encore")
            .args(["secret", "set", "--type", spec.kind.as_str()])
            .arg(spec.name.as_str())
            .workdir(workdir)
            .env(TELEMETRY_DISABLE.0, TELEMETRY_DISABLE.1)
            .stdin(value.into_bytes());

        if dry_run {
            info!(secret = %spec.name, "dry run: skipping secret sync");
            continue;
        }

        let output = runner.run(cancel, &cmd).await.map_err(|err| {
            ProviderError::new(
                ENCORE_ID,
                ProviderOp::Sync,
                ProviderErrorKind::NotAvailable,
                err.to_string(),
            )
        })?;
        if !output.success() {
            // Stderr may echo the value; report only the secret name.
            return Err(ProviderError::new(
                ENCORE_ID,
                ProviderOp::Sync,
                ProviderErrorKind::SecretSyncFailed,
                format!(
                    "secret set for {} exited with status {:?}",
                    spec.name, output.status
                ),
            ));
        }
        debug!(secret = %spec.name, kind = %spec.kind, "secret synced");
    }
    Ok(())
}

/// Encore.ts backend: disables telemetry, plumbs the local CA into Node,
/// syncs declared secrets over stdin, and builds via `encore build docker`.
pub struct EncoreBackend;

impl ProviderIdentity for EncoreBackend {
    fn id(&self) -> &'static str {
        ENCORE_ID
    }
}

#[async_trait]
impl BackendProvider for EncoreBackend {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan> {
        let config = EncoreConfig::decode(&opts.config, ProviderOp::Plan)?;
        let image = format!("{}-backend:{}", opts.project, opts.version);
        let mut steps = Vec::new();
        for spec in config.sorted_secrets() {
            steps.push(ProviderStep::new(
                format!("sync-secret-{}", spec.name.to_ascii_lowercase()),
                format!("encore secret set --type {} {}", spec.kind, spec.name),
            ));
        }
        steps.push(ProviderStep::new(
            "encore-build",
            format!("encore build docker {image}"),
        ));
        Ok(ProviderPlan {
            provider: ENCORE_ID.to_string(),
            steps,
        })
    }

    async fn dev(&self, ctx: &DevContext<'_>) -> ProviderResult<()> {
        let config = EncoreConfig::decode(ctx.config, ProviderOp::Dev)?;
        let workdir = config.workdir.as_deref().unwrap_or(ctx.workdir.as_str());
        sync_secrets(
            ctx.runner,
            ctx.cancel,
            workdir,
            &config.sorted_secrets(),
            ctx.dry_run,
        )
        .await?;

        let mut cmd = CommandSpec::new("encore")
            .arg("run")
            .workdir(workdir)
            .env(TELEMETRY_DISABLE.0, TELEMETRY_DISABLE.1);
        if let Some(cert) = &ctx.ca_cert {
            cmd = cmd.env("NODE_EXTRA_CA_CERTS", cert);
        }

        if ctx.dry_run {
            info!(command = %cmd.display_line(), "dry run: skipping encore dev server");
            return Ok(());
        }

        let mut sink = tokio::io::stderr();
        let status = ctx
            .runner
            .run_stream(ctx.cancel, &cmd, &mut sink)
            .await
            .map_err(|err| {
                ProviderError::new(
                    ENCORE_ID,
                    ProviderOp::Dev,
                    ProviderErrorKind::DevServerFailed,
                    err.to_string(),
                )
            })?;
        if status != 0 {
            return Err(ProviderError::new(
                ENCORE_ID,
                ProviderOp::Dev,
                ProviderErrorKind::DevServerFailed,
                format!("encore run exited with status {status}"),
            ));
        }
        Ok(())
    }

    async fn build_docker(&self, ctx: &BuildContext<'_>) -> ProviderResult<String> {
        let config = EncoreConfig::decode(ctx.config, ProviderOp::Build)?;
        let workdir = config.workdir.as_deref().unwrap_or(ctx.workdir.as_str());
        sync_secrets(
            ctx.runner,
            ctx.cancel,
            workdir,
            &config.sorted_secrets(),
            ctx.dry_run,
        )
        .await?;

        let cmd = CommandSpec::new("encore")
            .args(["build", "docker", ctx.image.as_str()])
            .workdir(workdir)
            .env(TELEMETRY_DISABLE.0, TELEMETRY_DISABLE.1);

        if ctx.dry_run {
            info!(command = %cmd.display_line(), "dry run: skipping encore build");
            return Ok(ctx.image.clone());
        }

        let output = ctx.runner.run(ctx.cancel, &cmd).await.map_err(|err| {
            ProviderError::new(
                ENCORE_ID,
                ProviderOp::Build,
                ProviderErrorKind::NotAvailable,
                err.to_string(),
            )
        })?;
        if !output.success() {
            // Build output can echo synced secret values; scrub them
            // before the stderr tail travels into the error.
            let names = SecretNames::from_specs(&config.secrets);
            let env_pairs: Vec<(String, String)> = config
                .secrets
                .iter()
                .filter_map(|s| env::var(&s.name).ok().map(|v| (s.name.clone(), v)))
                .collect();
            return Err(ProviderError::new(
                ENCORE_ID,
                ProviderOp::Build,
                ProviderErrorKind::BuildFailed,
                format!("encore build exited with status {:?}", output.status),
            )
            .with_detail(names.scrub(output.stderr.trim(), &env_pairs)));
        }
        Ok(ctx.image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plan_lists_secret_syncs_before_the_build() {
        let opts = PlanOptions {
            project: "shop".to_string(),
            environment: "prod".to_string(),
            version: "v9".to_string(),
            config: serde_yaml::from_str(
                "secrets:\n  - type: production\n    name: STRIPE_KEY\n  - type: production\n    name: API_TOKEN\n",
            )
            .unwrap(),
        };
        let plan = EncoreBackend.plan(&opts).await.unwrap();
        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["sync-secret-api_token", "sync-secret-stripe_key", "encore-build"]
        );
        assert_eq!(
            plan.steps[2].description,
            "encore build docker shop-backend:v9"
        );
    }
}
