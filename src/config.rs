use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StagecraftError};
use crate::paths::normalize_relative;

/// Declarative project description loaded from `stagecraft.yml`.
///
/// Immutable for the duration of a command. Maps are `BTreeMap`-backed so
/// iteration order can never leak into plans or rendered artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<RoleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<RoleConfig>,
    /// Default mesh-network selection; environments may override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<RoleConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub databases: BTreeMap<String, DatabaseConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations: Option<MigrationsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    /// Oldest stagecraft release this project works with. Compared by
    /// semantic version, not lexicographically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
}

/// Provider selection for one domain (backend, frontend, network) with an
/// opaque per-provider configuration map. The core never interprets the
/// nested values; the selected provider decodes and validates its own entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleConfig {
    pub provider: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, serde_yaml::Value>,
}

impl RoleConfig {
    /// Returns the config map entry for the selected provider, or an error
    /// naming the provider when the entry is missing.
    pub fn provider_config(&self) -> Result<&serde_yaml::Value> {
        self.providers.get(&self.provider).ok_or_else(|| {
            StagecraftError::InvalidConfig(format!(
                "no provider config entry for '{}'",
                self.provider
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub connection_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrations: Option<DatabaseMigrations>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseMigrations {
    pub engine: String,
    pub path: String,
    pub strategy: MigrationStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    PreDeploy,
    PostDeploy,
    Manual,
}

impl MigrationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStrategy::PreDeploy => "pre_deploy",
            MigrationStrategy::PostDeploy => "post_deploy",
            MigrationStrategy::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<String>,
    /// Compose overlay files applied over the base, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<String>,
    /// Target host inventory for bootstrap and remote deploys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostConfig>,
    /// Per-environment mesh-network override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<RoleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    pub public_ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Global migration settings shared by every database unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    pub default_engine: String,
    #[serde(default)]
    pub sources: MigrationSources,
    #[serde(default)]
    pub selection: MigrationSelection,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub engine_config: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, MigrationOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationSources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_sql_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_sql_files: Vec<String>,
}

/// Either everything (`all: true`) or an explicit `ids`/`tags` selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationSelection {
    #[serde(default)]
    pub all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl Config {
    /// Load, normalize, and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            StagecraftError::InvalidConfig(format!(
                "cannot read config {}: {err}",
                path.display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a config document from YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|err| StagecraftError::InvalidConfig(err.to_string()))?;
        config.normalize_and_validate()?;
        Ok(config)
    }

    /// Look up an environment, erroring with the known names on a miss.
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.environments.keys().map(String::as_str).collect();
            StagecraftError::InvalidConfig(format!(
                "unknown environment '{name}' (known: {})",
                known.join(", ")
            ))
        })
    }

    /// Mesh-network selection for an environment: per-environment override
    /// first, then the project-wide default.
    pub fn network_for(&self, env: &str) -> Option<&RoleConfig> {
        self.environments
            .get(env)
            .and_then(|e| e.network.as_ref())
            .or(self.network.as_ref())
    }

    fn normalize_and_validate(&mut self) -> Result<()> {
        validate_project_name(&self.project.name)?;
        if let Some(required) = &self.project.minimum_version {
            check_minimum_version(required, env!("CARGO_PKG_VERSION"))?;
        }

        for (role, selection) in [
            ("backend", self.backend.as_ref()),
            ("frontend", self.frontend.as_ref()),
            ("network", self.network.as_ref()),
        ] {
            if let Some(selection) = selection {
                validate_role(role, selection)?;
            }
        }

        for (name, db) in self.databases.iter_mut() {
            if db.connection_env.trim().is_empty() {
                return Err(StagecraftError::InvalidConfig(format!(
                    "databases.{name}: connection_env must not be empty"
                )));
            }
            if let Some(migrations) = db.migrations.as_mut() {
                migrations.path = normalize_config_path(
                    &migrations.path,
                    &format!("databases.{name}.migrations.path"),
                )?;
                if migrations.engine.trim().is_empty() {
                    return Err(StagecraftError::InvalidConfig(format!(
                        "databases.{name}.migrations: engine must not be empty"
                    )));
                }
            }
        }

        for (name, env) in self.environments.iter_mut() {
            if env.driver.trim().is_empty() {
                return Err(StagecraftError::InvalidConfig(format!(
                    "environments.{name}: driver must not be empty"
                )));
            }
            if let Some(env_file) = env.env_file.as_mut() {
                *env_file =
                    normalize_config_path(env_file, &format!("environments.{name}.env_file"))?;
            }
            for overlay in env.overlays.iter_mut() {
                *overlay =
                    normalize_config_path(overlay, &format!("environments.{name}.overlays"))?;
            }
            for host in &env.hosts {
                if host.name.trim().is_empty() || host.public_ip.trim().is_empty() {
                    return Err(StagecraftError::InvalidConfig(format!(
                        "environments.{name}.hosts: name and public_ip are required"
                    )));
                }
            }
            if let Some(network) = env.network.as_ref() {
                validate_role(&format!("environments.{name}.network"), network)?;
            }
        }

        if let Some(migrations) = self.migrations.as_mut() {
            migrations.normalize_and_validate()?;
        }

        Ok(())
    }
}

impl MigrationsConfig {
    fn normalize_and_validate(&mut self) -> Result<()> {
        if self.default_engine.trim().is_empty() {
            return Err(StagecraftError::InvalidConfig(
                "migrations.default_engine must not be empty".to_string(),
            ));
        }

        if let Some(dir) = self.sources.raw_sql_dir.as_mut() {
            *dir = normalize_config_path(dir, "migrations.sources.raw_sql_dir")?;
        }
        for file in self.sources.raw_sql_files.iter_mut() {
            *file = normalize_config_path(file, "migrations.sources.raw_sql_files")?;
        }
        dedup_sorted(&mut self.sources.raw_sql_files);
        dedup_sorted(&mut self.selection.ids);
        dedup_sorted(&mut self.selection.tags);

        if self.selection.all
            && (!self.selection.ids.is_empty() || !self.selection.tags.is_empty())
        {
            return Err(StagecraftError::InvalidConfig(
                "migrations.selection: 'all' is mutually exclusive with 'ids'/'tags'".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_role(role: &str, selection: &RoleConfig) -> Result<()> {
    if selection.provider.trim().is_empty() {
        return Err(StagecraftError::InvalidConfig(format!(
            "{role}: provider must not be empty"
        )));
    }
    if !selection.providers.is_empty() && !selection.providers.contains_key(&selection.provider) {
        return Err(StagecraftError::InvalidConfig(format!(
            "{role}: providers map has no entry for selected provider '{}'",
            selection.provider
        )));
    }
    Ok(())
}

fn validate_project_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StagecraftError::InvalidConfig(format!(
            "project.name '{name}' must match [a-z0-9][a-z0-9_-]*"
        )))
    }
}

fn check_minimum_version(required: &str, current: &str) -> Result<()> {
    let required_version = semver::Version::parse(required).map_err(|err| {
        StagecraftError::InvalidConfig(format!(
            "project.minimum_version '{required}' is not a semantic version: {err}"
        ))
    })?;
    let current_version = semver::Version::parse(current).map_err(|err| {
        StagecraftError::InvalidConfig(format!("cannot parse own version '{current}': {err}"))
    })?;
    if current_version < required_version {
        return Err(StagecraftError::InvalidConfig(format!(
            "project requires stagecraft >= {required_version}, this is {current_version}"
        )));
    }
    Ok(())
}

fn normalize_config_path(raw: &str, field: &str) -> Result<String> {
    normalize_relative(raw)
        .map_err(|reason| StagecraftError::InvalidConfig(format!("{field}: {reason}")))
}

fn dedup_sorted(list: &mut Vec<String>) {
    list.sort();
    list.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
project:
  name: shop
backend:
  provider: generic
  providers:
    generic:
      command: npm run start
environments:
  staging:
    driver: docker
    env_file: .env.staging
databases:
  app:
    connection_env: DATABASE_URL
    migrations:
      engine: raw_sql
      path: db/migrations
      strategy: pre_deploy
"#;

    #[test]
    fn loads_minimal_config() {
        let config = Config::from_yaml(MINIMAL).expect("config parses");
        assert_eq!(config.project.name, "shop");
        assert_eq!(
            config.databases["app"].migrations.as_ref().unwrap().strategy,
            MigrationStrategy::PreDeploy
        );
    }

    #[test]
    fn unknown_environment_lists_known_names() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let err = config.environment("prod").unwrap_err();
        assert!(format!("{err}").contains("staging"));
    }

    #[test]
    fn selection_all_excludes_ids_and_tags() {
        let raw = format!(
            "{MINIMAL}migrations:\n  default_engine: raw_sql\n  selection:\n    all: true\n    tags: [schema]\n"
        );
        let err = Config::from_yaml(&raw).unwrap_err();
        assert!(format!("{err}").contains("migrations.selection"));
    }

    #[test]
    fn provider_config_requires_selected_entry() {
        let raw = r#"
project:
  name: shop
backend:
  provider: encore
  providers:
    generic:
      command: run
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert!(format!("{err}").contains("encore"));
    }

    #[test]
    fn migration_paths_are_normalized_and_sorted() {
        let raw = r#"
project:
  name: shop
migrations:
  default_engine: raw_sql
  sources:
    raw_sql_dir: db\migrations
    raw_sql_files: ["b.sql", "a.sql", "b.sql"]
"#;
        let config = Config::from_yaml(raw).unwrap();
        let migrations = config.migrations.unwrap();
        assert_eq!(migrations.sources.raw_sql_dir.as_deref(), Some("db/migrations"));
        assert_eq!(migrations.sources.raw_sql_files, vec!["a.sql", "b.sql"]);
    }

    #[test]
    fn minimum_version_compares_semantically() {
        // 0.10.0 sorts before 0.9.0 lexicographically; semver must win.
        check_minimum_version("0.9.0", "0.10.0").unwrap();
        assert!(check_minimum_version("999.0.0", env!("CARGO_PKG_VERSION")).is_err());
        assert!(check_minimum_version("not-a-version", "1.0.0").is_err());
    }

    #[test]
    fn rejects_traversal_in_migration_path() {
        let raw = r#"
project:
  name: shop
databases:
  app:
    connection_env: DATABASE_URL
    migrations:
      engine: raw_sql
      path: ../outside
      strategy: manual
"#;
        assert!(Config::from_yaml(raw).is_err());
    }
}
