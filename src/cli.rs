use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for `plan`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "stagecraft",
    version,
    about = "Local-first deployment orchestrator for Docker Compose projects.",
    long_about = "Turns a declarative stagecraft.yml into deterministic deployment plans and \
executes them across one or more hosts with Docker Compose. `stagecraft dev` runs the same \
topology locally with HTTPS and routing."
)]
pub struct CliArgs {
    /// Path to the project config file.
    #[arg(long, global = true, default_value = "stagecraft.yml")]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Describe external commands without executing them.
    #[arg(long, global = true, default_value_t = false)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compute and print the deployment plan for an environment.
    Plan(PlanArgs),
    /// Build backend/frontend images for an environment.
    Build(ReleaseArgs),
    /// Render the environment compose file and roll it out.
    Deploy(ReleaseArgs),
    /// Re-apply the last rendered release for an environment.
    Rollback(EnvArgs),
    /// Run the project locally with HTTPS and routing.
    Dev(DevArgs),
    /// Run database migrations for an environment.
    Migrate(MigrateArgs),
    /// List rendered releases and their content hashes.
    Releases,
    /// Write a starter stagecraft.yml into the current directory.
    Init,
}

#[derive(Debug, Args)]
pub struct EnvArgs {
    /// Environment name (must exist under `environments` in the config).
    #[arg(long)]
    pub env: String,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    /// Output format.
    #[arg(long, value_enum, default_value = "text")]
    pub format: PlanFormat,

    /// Version used for image tags and plan metadata.
    #[arg(long, default_value = "dev")]
    pub version: String,

    /// Restrict the plan to these services (dependencies are preserved).
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    /// Version used for image tags and plan metadata.
    #[arg(long, default_value = "dev")]
    pub version: String,

    /// Restrict the operation to these services (dependencies are preserved).
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,
}

#[derive(Debug, Args)]
pub struct DevArgs {
    /// Environment whose topology dev mode mirrors.
    #[arg(long, default_value = "dev")]
    pub env: String,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub env: EnvArgs,

    /// Run only this database's migrations.
    #[arg(long)]
    pub database: Option<String>,
}
