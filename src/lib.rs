#![forbid(unsafe_code)]

pub mod actions;
pub mod bootstrap;
pub mod cli;
pub mod commands;
pub mod compose;
pub mod config;
pub mod dev;
pub mod envfile;
pub mod error;
pub mod exec;
pub mod executor;
pub mod logging;
pub mod paths;
pub mod plan;
pub mod providers;
pub mod secrets;

pub use cli::{CliArgs, Command, PlanFormat};
pub use config::Config;
pub use error::{Result, StagecraftError};
pub use plan::{filter_services, plan_deploy, Operation, OperationKind, Plan, PlanMetadata};
pub use providers::{
    register_providers, ProviderError, ProviderPlan, ProviderStep, Registries, Registry,
};
