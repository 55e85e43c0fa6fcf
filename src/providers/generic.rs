use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::exec::CommandSpec;
use crate::providers::{
    decode_provider_config, BackendProvider, BuildContext, DevContext, FrontendProvider,
    PlanOptions, ProviderError, ProviderErrorKind, ProviderIdentity, ProviderOp, ProviderPlan,
    ProviderResult, ProviderStep,
};

const GENERIC_ID: &str = "generic";

/// Opaque config accepted by the generic backend/frontend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenericConfig {
    /// Dev-server command, split on whitespace (e.g. `npm run dev`).
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    workdir: Option<String>,
    #[serde(default = "default_dockerfile")]
    dockerfile: String,
    #[serde(default = "default_context")]
    context: String,
    /// Extra environment merged over the inherited one for dev runs.
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

impl GenericConfig {
    fn decode(
        value: &serde_yaml::Value,
        operation: ProviderOp,
    ) -> ProviderResult<GenericConfig> {
        decode_provider_config(GENERIC_ID, operation, value)
    }

    fn dev_command(&self) -> ProviderResult<(String, Vec<String>)> {
        let raw = self.command.as_deref().unwrap_or("").trim().to_string();
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            ProviderError::new(
                GENERIC_ID,
                ProviderOp::Dev,
                ProviderErrorKind::InvalidConfig,
                "field 'command' must be set for dev runs",
            )
        })?;
        Ok((program, parts.collect()))
    }
}

fn build_steps(config: &GenericConfig, image: &str) -> Vec<ProviderStep> {
    vec![ProviderStep::new(
        "docker-build",
        format!(
            "docker build -f {} {} -t {}",
            config.dockerfile, config.context, image
        ),
    )]
}

async fn docker_build(ctx: &BuildContext<'_>, config: &GenericConfig) -> ProviderResult<String> {
    let cmd = CommandSpec::new("docker")
        .args(["build", "-t", ctx.image.as_str()])
        .args(["-f", config.dockerfile.as_str()])
        .arg(config.context.as_str())
        .workdir(config.workdir.as_deref().unwrap_or(ctx.workdir.as_str()));

    if ctx.dry_run {
        info!(command = %cmd.display_line(), "dry run: skipping docker build");
        return Ok(ctx.image.clone());
    }

    let output = ctx.runner.run(ctx.cancel, &cmd).await.map_err(|err| {
        ProviderError::new(
            GENERIC_ID,
            ProviderOp::Build,
            ProviderErrorKind::NotAvailable,
            err.to_string(),
        )
    })?;
    if !output.success() {
        return Err(ProviderError::new(
            GENERIC_ID,
            ProviderOp::Build,
            ProviderErrorKind::BuildFailed,
            format!("docker build exited with status {:?}", output.status),
        )
        .with_detail(output.stderr.trim().to_string()));
    }
    Ok(ctx.image.clone())
}

/// Backend that runs a configured command and builds with plain
/// `docker build`.
pub struct GenericBackend;

impl ProviderIdentity for GenericBackend {
    fn id(&self) -> &'static str {
        GENERIC_ID
    }
}

#[async_trait]
impl BackendProvider for GenericBackend {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan> {
        let config = GenericConfig::decode(&opts.config, ProviderOp::Plan)?;
        let image = format!("{}-backend:{}", opts.project, opts.version);
        Ok(ProviderPlan {
            provider: GENERIC_ID.to_string(),
            steps: build_steps(&config, &image),
        })
    }

    async fn dev(&self, ctx: &DevContext<'_>) -> ProviderResult<()> {
        let config = GenericConfig::decode(ctx.config, ProviderOp::Dev)?;
        let (program, args) = config.dev_command()?;
        let mut cmd = CommandSpec::new(program)
            .args(args)
            .workdir(config.workdir.as_deref().unwrap_or(ctx.workdir.as_str()));
        for (key, value) in &config.env {
            cmd = cmd.env(key, value);
        }
        if let Some(cert) = &ctx.ca_cert {
            cmd = cmd.env("NODE_EXTRA_CA_CERTS", cert);
        }

        if ctx.dry_run {
            info!(command = %cmd.display_line(), "dry run: skipping dev server");
            return Ok(());
        }

        let mut sink = tokio::io::stderr();
        let status = ctx
            .runner
            .run_stream(ctx.cancel, &cmd, &mut sink)
            .await
            .map_err(|err| {
                ProviderError::new(
                    GENERIC_ID,
                    ProviderOp::Dev,
                    ProviderErrorKind::DevServerFailed,
                    err.to_string(),
                )
            })?;
        if status != 0 {
            return Err(ProviderError::new(
                GENERIC_ID,
                ProviderOp::Dev,
                ProviderErrorKind::DevServerFailed,
                format!("dev server exited with status {status}"),
            ));
        }
        Ok(())
    }

    async fn build_docker(&self, ctx: &BuildContext<'_>) -> ProviderResult<String> {
        let config = GenericConfig::decode(ctx.config, ProviderOp::Build)?;
        docker_build(ctx, &config).await
    }
}

/// Frontend flavour of the generic provider; shares its config shape.
pub struct GenericFrontend;

impl ProviderIdentity for GenericFrontend {
    fn id(&self) -> &'static str {
        GENERIC_ID
    }
}

#[async_trait]
impl FrontendProvider for GenericFrontend {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan> {
        let config = GenericConfig::decode(&opts.config, ProviderOp::Plan)?;
        let image = format!("{}-frontend:{}", opts.project, opts.version);
        Ok(ProviderPlan {
            provider: GENERIC_ID.to_string(),
            steps: build_steps(&config, &image),
        })
    }

    async fn build_docker(&self, ctx: &BuildContext<'_>) -> ProviderResult<String> {
        let config = GenericConfig::decode(ctx.config, ProviderOp::Build)?;
        docker_build(ctx, &config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plan_derives_build_step_from_config() {
        let opts = PlanOptions {
            project: "shop".to_string(),
            environment: "staging".to_string(),
            version: "v3".to_string(),
            config: serde_yaml::from_str("dockerfile: docker/Dockerfile.api\ncontext: api")
                .unwrap(),
        };
        let plan = GenericBackend.plan(&opts).await.unwrap();
        assert_eq!(plan.provider, "generic");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(
            plan.steps[0].description,
            "docker build -f docker/Dockerfile.api api -t shop-backend:v3"
        );
    }

    #[tokio::test]
    async fn unknown_config_field_names_the_provider() {
        let opts = PlanOptions {
            project: "shop".to_string(),
            environment: "staging".to_string(),
            version: "v3".to_string(),
            config: serde_yaml::from_str("dockerfil: typo").unwrap(),
        };
        let err = GenericBackend.plan(&opts).await.unwrap_err();
        assert_eq!(err.provider, "generic");
        assert_eq!(err.kind, ProviderErrorKind::InvalidConfig);
        assert!(err.message.contains("dockerfil"));
    }
}
