use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use walkdir::WalkDir;

use crate::exec::CommandSpec;
use crate::providers::{
    MigrateContext, MigrationEngine, MigrationPlanOptions, ProviderError, ProviderErrorKind,
    ProviderIdentity, ProviderOp, ProviderPlan, ProviderResult, ProviderStep,
};

const RAW_SQL_ID: &str = "raw_sql";

/// How many leading lines of a migration are scanned for a tag header.
const TAG_SCAN_LINES: usize = 10;

/// Migration engine over plain `*.sql` files: discovers sources under the
/// configured directory plus explicit files, orders them lexicographically,
/// and applies them with `psql`. Connection strings are referenced by
/// environment variable name only and never logged.
pub struct RawSqlEngine;

impl ProviderIdentity for RawSqlEngine {
    fn id(&self) -> &'static str {
        RAW_SQL_ID
    }
}

#[async_trait]
impl MigrationEngine for RawSqlEngine {
    async fn plan(&self, opts: &MigrationPlanOptions) -> ProviderResult<ProviderPlan> {
        let files = self.discover(opts)?;
        let steps = files
            .iter()
            .map(|file| {
                ProviderStep::new(
                    format!("apply-{}", file_stem(file)),
                    format!("psql -f {file}"),
                )
            })
            .collect();
        Ok(ProviderPlan {
            provider: RAW_SQL_ID.to_string(),
            steps,
        })
    }

    fn discover(&self, opts: &MigrationPlanOptions) -> ProviderResult<Vec<String>> {
        let mut found = BTreeSet::new();

        if let Some(dir) = &opts.sources.raw_sql_dir {
            if Path::new(dir).is_dir() {
                for entry in WalkDir::new(dir).sort_by_file_name() {
                    let entry = entry.map_err(|err| {
                        ProviderError::new(
                            RAW_SQL_ID,
                            ProviderOp::Plan,
                            ProviderErrorKind::InvalidConfig,
                            format!("cannot walk {dir}: {err}"),
                        )
                    })?;
                    if entry.file_type().is_file()
                        && entry.path().extension().is_some_and(|ext| ext == "sql")
                    {
                        found.insert(entry.path().to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        for file in &opts.sources.raw_sql_files {
            found.insert(file.clone());
        }

        let selected = if opts.selection.all
            || (opts.selection.ids.is_empty() && opts.selection.tags.is_empty())
        {
            found.into_iter().collect()
        } else {
            found
                .into_iter()
                .filter(|file| {
                    opts.selection.ids.iter().any(|id| id == &file_stem(file))
                        || file_matches_tags(file, &opts.selection.tags)
                })
                .collect()
        };
        Ok(selected)
    }

    async fn migrate(
        &self,
        ctx: &MigrateContext<'_>,
        opts: &MigrationPlanOptions,
    ) -> ProviderResult<()> {
        let files = self.discover(opts)?;
        for file in &files {
            // The connection value stays inside the child's environment;
            // only the variable name appears in the command line.
            let cmd = CommandSpec::new("sh").args([
                "-c",
                &format!("psql \"${}\" -f {}", ctx.conn_env, file),
            ]);

            if ctx.dry_run {
                info!(file = %file, "dry run: skipping migration");
                continue;
            }

            let output = ctx.runner.run(ctx.cancel, &cmd).await.map_err(|err| {
                ProviderError::new(
                    RAW_SQL_ID,
                    ProviderOp::Migrate,
                    ProviderErrorKind::NotAvailable,
                    err.to_string(),
                )
            })?;
            if !output.success() {
                return Err(ProviderError::new(
                    RAW_SQL_ID,
                    ProviderOp::Migrate,
                    ProviderErrorKind::ExecutionFailed,
                    format!("{file} exited with status {:?}", output.status),
                )
                .with_detail(output.stderr.trim().to_string()));
            }
            info!(file = %file, database = %opts.database, "migration applied");
        }
        Ok(())
    }
}

fn file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// A migration opts into tag selection with a leading `-- tags: a, b` line.
fn file_matches_tags(path: &str, wanted: &[String]) -> bool {
    if wanted.is_empty() {
        return false;
    }
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    for line in contents.lines().take(TAG_SCAN_LINES) {
        let Some(rest) = line.trim().strip_prefix("--") else {
            continue;
        };
        let Some(tags) = rest.trim().strip_prefix("tags:") else {
            continue;
        };
        return tags
            .split(',')
            .map(str::trim)
            .any(|tag| wanted.iter().any(|w| w == tag));
    }
    false
}
