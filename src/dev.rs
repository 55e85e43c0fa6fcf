use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::exec::{binary_available, CommandRunner, CommandSpec};

/// Hostnames routed by the local proxy.
const DEV_DOMAIN: &str = "dev.localhost";
const API_DOMAIN: &str = "api.dev.localhost";

/// Local dev artifacts written under `.stagecraft/dev/`.
#[derive(Debug, Clone)]
pub struct DevArtifacts {
    pub compose_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// False when mkcert is unavailable and HTTPS is disabled.
    pub tls_enabled: bool,
}

/// Write the dev compose file, traefik configuration, and (when mkcert is
/// available) local certificates. Artifact content depends only on the
/// project config, so repeated runs rewrite identical files.
pub async fn prepare(
    workdir: &Path,
    config: &Config,
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
) -> Result<DevArtifacts> {
    let dev_dir = workdir.join(".stagecraft").join("dev");
    let certs_dir = dev_dir.join("certs");
    let traefik_dir = dev_dir.join("traefik");
    fs::create_dir_all(&certs_dir)?;
    fs::create_dir_all(&traefik_dir)?;

    let cert_path = certs_dir.join("dev-local.pem");
    let key_path = certs_dir.join("dev-local-key.pem");
    let tls_enabled = ensure_certificates(runner, cancel, &cert_path, &key_path).await?;

    fs::write(
        traefik_dir.join("traefik-static.yaml"),
        traefik_static_config(),
    )?;
    fs::write(
        traefik_dir.join("traefik-dynamic.yaml"),
        traefik_dynamic_config(&config.project.name),
    )?;

    let compose_path = dev_dir.join("compose.yaml");
    fs::write(&compose_path, dev_compose(&config.project.name))?;

    info!(path = %compose_path.display(), tls = tls_enabled, "dev artifacts written");
    Ok(DevArtifacts {
        compose_path,
        cert_path,
        key_path,
        tls_enabled,
    })
}

/// Generate local certificates with mkcert. Existing certificates are kept;
/// a missing mkcert binary downgrades dev mode to plain HTTP.
async fn ensure_certificates(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    cert_path: &Path,
    key_path: &Path,
) -> Result<bool> {
    if cert_path.exists() && key_path.exists() {
        return Ok(true);
    }
    if !binary_available("mkcert") {
        warn!("mkcert not found on PATH; dev mode will run without HTTPS");
        return Ok(false);
    }

    let cmd = CommandSpec::new("mkcert")
        .arg("-cert-file")
        .arg(cert_path.to_string_lossy().into_owned())
        .arg("-key-file")
        .arg(key_path.to_string_lossy().into_owned())
        .args([DEV_DOMAIN, API_DOMAIN, "localhost", "127.0.0.1"]);
    let output = runner.run(cancel, &cmd).await?;
    if !output.success() {
        warn!(
            stderr = %output.stderr.trim(),
            "mkcert failed; dev mode will run without HTTPS"
        );
        return Ok(false);
    }
    Ok(true)
}

fn traefik_static_config() -> String {
    concat!(
        "entryPoints:\n",
        "  web:\n",
        "    address: ':80'\n",
        "  websecure:\n",
        "    address: ':443'\n",
        "providers:\n",
        "  file:\n",
        "    filename: /etc/traefik/traefik-dynamic.yaml\n",
        "    watch: true\n",
        "api:\n",
        "  dashboard: false\n",
    )
    .to_string()
}

fn traefik_dynamic_config(project: &str) -> String {
    format!(
        concat!(
            "tls:\n",
            "  certificates:\n",
            "    - certFile: /etc/traefik/certs/dev-local.pem\n",
            "      keyFile: /etc/traefik/certs/dev-local-key.pem\n",
            "http:\n",
            "  routers:\n",
            "    {project}-api:\n",
            "      rule: Host(`{api_domain}`)\n",
            "      service: {project}-api\n",
            "      entryPoints: [websecure]\n",
            "      tls: {{}}\n",
            "    {project}-web:\n",
            "      rule: Host(`{dev_domain}`)\n",
            "      service: {project}-web\n",
            "      entryPoints: [websecure]\n",
            "      tls: {{}}\n",
            "  services:\n",
            "    {project}-api:\n",
            "      loadBalancer:\n",
            "        servers:\n",
            "          - url: http://host.docker.internal:4000\n",
            "    {project}-web:\n",
            "      loadBalancer:\n",
            "        servers:\n",
            "          - url: http://host.docker.internal:3000\n",
        ),
        project = project,
        api_domain = API_DOMAIN,
        dev_domain = DEV_DOMAIN,
    )
}

fn dev_compose(project: &str) -> String {
    format!(
        concat!(
            "services:\n",
            "  traefik:\n",
            "    image: traefik:v3.1\n",
            "    container_name: {project}-dev-traefik\n",
            "    ports:\n",
            "      - '80:80'\n",
            "      - '443:443'\n",
            "    volumes:\n",
            "      - ./traefik/traefik-static.yaml:/etc/traefik/traefik.yaml:ro\n",
            "      - ./traefik/traefik-dynamic.yaml:/etc/traefik/traefik-dynamic.yaml:ro\n",
            "      - ./certs:/etc/traefik/certs:ro\n",
            "    extra_hosts:\n",
            "      - host.docker.internal:host-gateway\n",
        ),
        project = project,
    )
}

/// Start the dev proxy stack. With TLS disabled traefik is scaled to zero
/// so the backend still runs plain HTTP.
pub async fn start_proxy(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    artifacts: &DevArtifacts,
    dry_run: bool,
) -> Result<()> {
    let mut cmd = CommandSpec::new("docker")
        .args(["compose", "-f"])
        .arg(artifacts.compose_path.to_string_lossy().into_owned())
        .args(["up", "-d"]);
    if !artifacts.tls_enabled {
        cmd = cmd.args(["--scale", "traefik=0"]);
    }
    if dry_run {
        info!(command = %cmd.display_line(), "dry run: skipping dev proxy");
        return Ok(());
    }
    let output = runner.run(cancel, &cmd).await?;
    if !output.success() {
        return Err(crate::error::StagecraftError::CommandFailed(format!(
            "`{}` exited with status {:?}: {}",
            cmd.display_line(),
            output.status,
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Tear the dev proxy stack down once the dev server has exited.
pub async fn stop_proxy(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    artifacts: &DevArtifacts,
    dry_run: bool,
) -> Result<()> {
    let cmd = CommandSpec::new("docker")
        .args(["compose", "-f"])
        .arg(artifacts.compose_path.to_string_lossy().into_owned())
        .arg("down");
    if dry_run {
        info!(command = %cmd.display_line(), "dry run: skipping dev proxy teardown");
        return Ok(());
    }
    let output = runner.run(cancel, &cmd).await?;
    if !output.success() {
        warn!(
            stderr = %output.stderr.trim(),
            "dev proxy teardown failed; containers may still be running"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecOutput;
    use async_trait::async_trait;

    struct NoopRunner;

    #[async_trait]
    impl CommandRunner for NoopRunner {
        async fn run(&self, _: &CancellationToken, _: &CommandSpec) -> Result<ExecOutput> {
            Ok(ExecOutput {
                status: Some(0),
                ..Default::default()
            })
        }

        async fn run_stream(
            &self,
            _: &CancellationToken,
            _: &CommandSpec,
            _: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        ) -> Result<i32> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn artifacts_land_on_normative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_yaml("project:\n  name: shop\n").unwrap();
        let artifacts = prepare(dir.path(), &config, &NoopRunner, &CancellationToken::new())
            .await
            .unwrap();
        assert!(artifacts.compose_path.ends_with(".stagecraft/dev/compose.yaml"));
        assert!(dir
            .path()
            .join(".stagecraft/dev/traefik/traefik-static.yaml")
            .exists());
        assert!(dir
            .path()
            .join(".stagecraft/dev/traefik/traefik-dynamic.yaml")
            .exists());
        let dynamic = fs::read_to_string(
            dir.path().join(".stagecraft/dev/traefik/traefik-dynamic.yaml"),
        )
        .unwrap();
        assert!(dynamic.contains("shop-api"));
    }

    #[tokio::test]
    async fn repeated_preparation_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_yaml("project:\n  name: shop\n").unwrap();
        let cancel = CancellationToken::new();
        prepare(dir.path(), &config, &NoopRunner, &cancel).await.unwrap();
        let first =
            fs::read(dir.path().join(".stagecraft/dev/compose.yaml")).unwrap();
        prepare(dir.path(), &config, &NoopRunner, &cancel).await.unwrap();
        let second =
            fs::read(dir.path().join(".stagecraft/dev/compose.yaml")).unwrap();
        assert_eq!(first, second);
    }
}
