use std::env;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::bootstrap::Host;
use crate::providers::{
    decode_provider_config, NetworkContext, NetworkProvider, PlanOptions, ProviderError,
    ProviderErrorKind, ProviderIdentity, ProviderOp, ProviderPlan, ProviderResult, ProviderStep,
};

const TAILSCALE_ID: &str = "tailscale";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TailscaleConfig {
    /// Tailnet DNS suffix used to derive node FQDNs (e.g. `tail1234.ts.net`).
    tailnet_domain: String,
    /// Environment variable holding the pre-auth key for joins.
    #[serde(default = "default_auth_key_env")]
    auth_key_env: String,
    /// Prefix applied to host tags when advertising (`web` -> `tag:web`).
    #[serde(default = "default_tag_prefix")]
    tag_prefix: String,
}

fn default_auth_key_env() -> String {
    "TAILSCALE_AUTH_KEY".to_string()
}

fn default_tag_prefix() -> String {
    "tag:".to_string()
}

impl TailscaleConfig {
    fn decode(
        value: &serde_yaml::Value,
        operation: ProviderOp,
    ) -> ProviderResult<TailscaleConfig> {
        decode_provider_config(TAILSCALE_ID, operation, value)
    }

    fn advertise_tags(&self, tags: &[String]) -> String {
        tags.iter()
            .map(|tag| format!("{}{tag}", self.tag_prefix))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Tailscale mesh provider: installs the CLI on Debian/Ubuntu targets,
/// joins with computed tags, and derives FQDNs as a pure string function of
/// the declared tailnet domain.
pub struct TailscaleNetwork;

impl ProviderIdentity for TailscaleNetwork {
    fn id(&self) -> &'static str {
        TAILSCALE_ID
    }
}

#[async_trait]
impl NetworkProvider for TailscaleNetwork {
    async fn plan(&self, opts: &PlanOptions) -> ProviderResult<ProviderPlan> {
        let config = TailscaleConfig::decode(&opts.config, ProviderOp::Plan)?;
        Ok(ProviderPlan {
            provider: TAILSCALE_ID.to_string(),
            steps: vec![
                ProviderStep::new("install", "install tailscale CLI on Debian/Ubuntu hosts"),
                ProviderStep::new(
                    "join",
                    format!("join tailnet {} with advertised tags", config.tailnet_domain),
                ),
            ],
        })
    }

    async fn ensure_installed(&self, ctx: &NetworkContext<'_>, host: &Host) -> ProviderResult<()> {
        TailscaleConfig::decode(ctx.config, ProviderOp::Install)?;

        if ctx
            .executor
            .run(ctx.cancel, host, "tailscale version")
            .await
            .is_ok()
        {
            debug!(host = %host.name, "tailscale already installed");
            return Ok(());
        }

        let os_release = ctx
            .executor
            .run(ctx.cancel, host, "cat /etc/os-release")
            .await
            .map_err(|err| {
                ProviderError::new(
                    TAILSCALE_ID,
                    ProviderOp::Install,
                    ProviderErrorKind::InstallFailed,
                    err.to_string(),
                )
            })?;
        let id_line = os_release.stdout.to_ascii_lowercase();
        if !id_line.contains("debian") && !id_line.contains("ubuntu") {
            return Err(ProviderError::new(
                TAILSCALE_ID,
                ProviderOp::Install,
                ProviderErrorKind::UnsupportedOs,
                format!("host {} is not Debian/Ubuntu", host.name),
            ));
        }

        ctx.executor
            .run(
                ctx.cancel,
                host,
                "curl -fsSL https://tailscale.com/install.sh | sh",
            )
            .await
            .map_err(|err| {
                ProviderError::new(
                    TAILSCALE_ID,
                    ProviderOp::Install,
                    ProviderErrorKind::InstallFailed,
                    err.to_string(),
                )
            })?;
        Ok(())
    }

    async fn ensure_joined(
        &self,
        ctx: &NetworkContext<'_>,
        host: &Host,
        tags: &[String],
    ) -> ProviderResult<()> {
        let config = TailscaleConfig::decode(ctx.config, ProviderOp::Join)?;

        // `tailscale status` exits non-zero while logged out; a clean exit
        // means the host is already joined and the call is a no-op.
        if ctx
            .executor
            .run(ctx.cancel, host, "tailscale status")
            .await
            .is_ok()
        {
            debug!(host = %host.name, "already joined tailnet");
            return Ok(());
        }

        let auth_key = env::var(&config.auth_key_env).map_err(|_| {
            ProviderError::new(
                TAILSCALE_ID,
                ProviderOp::Join,
                ProviderErrorKind::InvalidConfig,
                format!("environment variable {} is not set", config.auth_key_env),
            )
        })?;

        let mut command = format!("tailscale up --auth-key={auth_key}");
        let advertised = config.advertise_tags(tags);
        if !advertised.is_empty() {
            command.push_str(" --advertise-tags=");
            command.push_str(&advertised);
        }

        ctx.executor
            .run(ctx.cancel, host, &command)
            .await
            .map_err(|err| {
                // The command line carries the auth key; scrub it from
                // whatever the transport echoes back.
                let scrubbed = err.to_string().replace(auth_key.as_str(), "<redacted>");
                ProviderError::new(
                    TAILSCALE_ID,
                    ProviderOp::Join,
                    ProviderErrorKind::InstallFailed,
                    scrubbed,
                )
            })?;
        Ok(())
    }

    fn node_fqdn(&self, config: &serde_yaml::Value, host: &Host) -> ProviderResult<String> {
        let config = TailscaleConfig::decode(config, ProviderOp::Plan)?;
        Ok(format!(
            "{}.{}",
            sanitize_node_name(&host.name),
            config.tailnet_domain
        ))
    }
}

fn sanitize_node_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
