use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span};

use crate::actions::ApplyComposeInputs;
use crate::cli::{CliArgs, Command, PlanFormat};
use crate::compose;
use crate::config::Config;
use crate::dev;
use crate::error::{Result, StagecraftError};
use crate::exec::{CommandRunner, LocalProcessRunner};
use crate::executor::PlanExecutor;
use crate::plan::{self, OperationKind};
use crate::providers::{register_providers, DevContext, Registries};

/// Entry point for the CLI: registers providers, wires cancellation to
/// Ctrl-C, and dispatches the subcommand.
pub async fn run(cli: CliArgs) -> Result<()> {
    let mut registries = Registries::default();
    register_providers(&mut registries);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let workdir = std::env::current_dir()?;
    let runner: Arc<dyn CommandRunner> = Arc::new(LocalProcessRunner);

    match &cli.command {
        Command::Init => return init(&cli.config),
        Command::Releases => return releases(&workdir),
        _ => {}
    }

    let config = Config::load(&cli.config)?;
    registries.validate_config(&config)?;

    match cli.command {
        Command::Plan(args) => {
            let span = info_span!("plan", environment = %args.env.env);
            let _enter = span.enter();
            let full = plan::plan_deploy(&config, &registries, &args.env.env, &args.version).await?;
            let filtered = plan::filter_services(&full, &args.services);
            match args.format {
                PlanFormat::Text => print!("{}", filtered.to_text()),
                PlanFormat::Json => println!("{}", filtered.to_json()?),
            }
            Ok(())
        }

        Command::Build(args) => {
            let full = plan::plan_deploy(&config, &registries, &args.env.env, &args.version).await?;
            let filtered = plan::filter_services(&full, &args.services);
            let builds = restrict_to(&filtered, OperationKind::Build);
            let executor = executor(&config, &registries, &runner, &workdir, cli.dry_run);
            executor.execute(&cancel, &builds).await
        }

        Command::Deploy(args) => {
            let span = info_span!("deploy", environment = %args.env.env);
            let _enter = span.enter();
            let full = plan::plan_deploy(&config, &registries, &args.env.env, &args.version).await?;
            let filtered = plan::filter_services(&full, &args.services);
            let executor = executor(&config, &registries, &runner, &workdir, cli.dry_run);
            executor.execute(&cancel, &filtered).await
        }

        Command::Rollback(args) => {
            rollback(&config, &registries, &runner, &workdir, &cancel, &args, cli.dry_run).await
        }

        Command::Dev(args) => {
            let span = info_span!("dev", environment = %args.env);
            let _enter = span.enter();
            run_dev(&config, &registries, &runner, &workdir, &cancel, cli.dry_run).await
        }

        Command::Migrate(args) => {
            let full = plan::plan_deploy(&config, &registries, &args.env.env, "dev").await?;
            let migrations = restrict_migrations(&full, args.database.as_deref());
            if migrations.operations.is_empty() {
                info!("no migrations to run");
                return Ok(());
            }
            let executor = executor(&config, &registries, &runner, &workdir, cli.dry_run);
            executor.execute(&cancel, &migrations).await
        }

        Command::Releases | Command::Init => unreachable!("handled before config load"),
    }
}

fn executor<'a>(
    config: &'a Config,
    registries: &'a Registries,
    runner: &Arc<dyn CommandRunner>,
    workdir: &Path,
    dry_run: bool,
) -> PlanExecutor<'a> {
    PlanExecutor {
        config,
        registries,
        runner: Arc::clone(runner),
        workdir: workdir.to_path_buf(),
        dry_run,
    }
}

fn restrict_to(full: &plan::Plan, kind: OperationKind) -> plan::Plan {
    plan::Plan {
        environment: full.environment.clone(),
        operations: full
            .operations
            .iter()
            .filter(|op| op.kind == kind)
            .cloned()
            .collect(),
        metadata: full.metadata.clone(),
    }
}

fn restrict_migrations(full: &plan::Plan, database: Option<&str>) -> plan::Plan {
    plan::Plan {
        environment: full.environment.clone(),
        operations: full
            .operations
            .iter()
            .filter(|op| op.kind == OperationKind::Migration)
            .filter(|op| database.is_none_or(|wanted| op.meta("database") == Some(wanted)))
            .cloned()
            .collect(),
        metadata: full.metadata.clone(),
    }
}

async fn rollback(
    config: &Config,
    registries: &Registries,
    runner: &Arc<dyn CommandRunner>,
    workdir: &Path,
    cancel: &CancellationToken,
    env: &crate::cli::EnvArgs,
    dry_run: bool,
) -> Result<()> {
    config.environment(&env.env)?;
    let rendered = workdir
        .join(".stagecraft")
        .join("rendered")
        .join(&env.env)
        .join("docker-compose.yml");
    if !rendered.exists() {
        return Err(StagecraftError::InvalidProject(format!(
            "no rendered release for environment '{}' (expected {})",
            env.env,
            rendered.display()
        )));
    }
    let bytes = fs::read(&rendered)?;
    let sha256 = compose::sha256_hex(&bytes);
    info!(environment = %env.env, sha256 = %sha256, "rolling back to last rendered release");

    let mut inputs = ApplyComposeInputs {
        environment: env.env.clone(),
        compose_path: relative_to(workdir, &rendered),
        project_name: config.project.name.clone(),
        pull: Some(false),
        detach: Some(true),
        services: Vec::new(),
        expected_compose_hash_alg: Some("sha256".to_string()),
        expected_compose_hash: Some(sha256),
    };
    let payload = crate::actions::encode(&mut inputs)?;
    let inputs: ApplyComposeInputs = crate::actions::decode_validated(&payload)?;
    let executor = executor(config, registries, runner, workdir, dry_run);
    executor.apply_compose(cancel, &inputs).await
}

async fn run_dev(
    config: &Config,
    registries: &Registries,
    runner: &Arc<dyn CommandRunner>,
    workdir: &Path,
    cancel: &CancellationToken,
    dry_run: bool,
) -> Result<()> {
    let artifacts = dev::prepare(workdir, config, runner.as_ref(), cancel).await?;
    dev::start_proxy(runner.as_ref(), cancel, &artifacts, dry_run).await?;

    let Some(backend) = &config.backend else {
        info!("no backend configured; dev proxy is running");
        return Ok(());
    };

    let provider = registries.backends.get(&backend.provider).ok_or_else(|| {
        StagecraftError::InvalidConfig(format!("backend: unknown provider '{}'", backend.provider))
    })?;
    let provider_config = backend.provider_config()?.clone();
    let ctx = DevContext {
        runner: runner.as_ref(),
        cancel,
        config: &provider_config,
        workdir: workdir.to_string_lossy().into_owned(),
        ca_cert: artifacts
            .tls_enabled
            .then(|| artifacts.cert_path.to_string_lossy().into_owned()),
        dry_run,
    };
    let dev_result = provider.dev(&ctx).await;
    // Teardown must still run when the dev server was cancelled, so it
    // gets its own token.
    let teardown = CancellationToken::new();
    dev::stop_proxy(runner.as_ref(), &teardown, &artifacts, dry_run).await?;
    dev_result?;
    Ok(())
}

fn releases(workdir: &Path) -> Result<()> {
    let rendered_root = workdir.join(".stagecraft").join("rendered");
    if !rendered_root.is_dir() {
        println!("No rendered releases.");
        return Ok(());
    }
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&rendered_root)? {
        let entry = entry?;
        let compose = entry.path().join("docker-compose.yml");
        if compose.is_file() {
            entries.push((entry.file_name().to_string_lossy().into_owned(), compose));
        }
    }
    entries.sort();
    if entries.is_empty() {
        println!("No rendered releases.");
        return Ok(());
    }
    for (environment, path) in entries {
        let bytes = fs::read(&path)?;
        println!("{environment}  {}", compose::sha256_hex(&bytes));
    }
    Ok(())
}

const STARTER_CONFIG: &str = r#"# Stagecraft project description.
project:
  name: myapp

backend:
  provider: generic
  providers:
    generic:
      command: npm run dev
      dockerfile: Dockerfile
      context: .

environments:
  staging:
    driver: docker
    env_file: .env.staging
  production:
    driver: docker
    env_file: .env.production

databases:
  app:
    connection_env: DATABASE_URL
    migrations:
      engine: raw_sql
      path: db/migrations
      strategy: pre_deploy

migrations:
  default_engine: raw_sql
  sources:
    raw_sql_dir: db/migrations
  selection:
    all: true
"#;

fn init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        return Err(StagecraftError::InvalidProject(format!(
            "{} already exists; refusing to overwrite",
            config_path.display()
        )));
    }
    fs::write(config_path, STARTER_CONFIG)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

fn relative_to(workdir: &Path, path: &Path) -> String {
    path.strip_prefix(workdir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
