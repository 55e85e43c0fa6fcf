use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::envfile;
use crate::error::{Result, StagecraftError};

/// Top-level compose keys in their fixed output order. Anything else
/// (`x-*` extensions and unknown keys) is emitted afterwards, sorted.
const TOP_LEVEL_ORDER: [&str; 6] = [
    "version", "services", "networks", "volumes", "configs", "secrets",
];

/// An ordered compose document. Mutation is not safe for concurrent use;
/// callers serialize access.
#[derive(Debug, Clone)]
pub struct ComposeFile {
    doc: Mapping,
}

impl ComposeFile {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        match value {
            Value::Mapping(doc) => Ok(Self { doc }),
            _ => Err(StagecraftError::InvalidProject(
                "compose file root must be a mapping".to_string(),
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| {
            StagecraftError::InvalidProject(format!(
                "cannot read compose file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    /// Service names in document order.
    pub fn services(&self) -> Vec<String> {
        match self.doc.get(&key("services")) {
            Some(Value::Mapping(services)) => services
                .iter()
                .filter_map(|(name, _)| name.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Pin every service to `image`, overriding both `build:`-derived and
    /// explicit `image:` values. Services keep everything else untouched.
    pub fn set_service_images(&mut self, image: &str) {
        let Some(Value::Mapping(services)) = self.doc.get_mut(&key("services")) else {
            return;
        };
        for (_, service) in services.iter_mut() {
            if let Value::Mapping(service) = service {
                service.insert(key("image"), Value::String(image.to_string()));
            }
        }
    }

    /// Merge env-file variables into every service's `environment` under the
    /// rule that existing entries always win, then sort each environment by
    /// key. List-form environments (`- K=V`) are normalized to mappings.
    pub fn merge_environment(&mut self, vars: &BTreeMap<String, String>) {
        let Some(Value::Mapping(services)) = self.doc.get_mut(&key("services")) else {
            return;
        };
        for (_, service) in services.iter_mut() {
            let Value::Mapping(service) = service else {
                continue;
            };
            let mut env = normalize_environment(service.get(&key("environment")));
            for (name, value) in vars {
                env.entry(name.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
            if env.is_empty() && !service.contains_key(&key("environment")) {
                continue;
            }
            let mut sorted = Mapping::new();
            for (name, value) in env {
                sorted.insert(Value::String(name), value);
            }
            service.insert(key("environment"), Value::Mapping(sorted));
        }
    }

    /// Apply an overlay document on top of this one: mappings merge
    /// recursively with the overlay winning on conflicts; scalars and
    /// sequences are replaced wholesale, matching compose `-f a -f b`
    /// semantics.
    pub fn apply_overlay(&mut self, overlay: &ComposeFile) {
        merge_mapping(&mut self.doc, &overlay.doc);
    }

    /// Deterministic byte rendering: fixed top-level key order, sorted
    /// extension keys, 2-space indentation, a single document, a blank line
    /// after `version:`, blank lines between services, and exactly two
    /// trailing newlines.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();

        if let Some(version) = self.doc.get(&key("version")) {
            out.push_str(&emit_entry("version", version)?);
            out.push('\n');
        }

        if let Some(services) = self.doc.get(&key("services")) {
            match services {
                Value::Mapping(services) if !services.is_empty() => {
                    out.push_str("services:\n");
                    for (index, (name, service)) in services.iter().enumerate() {
                        if index > 0 {
                            out.push('\n');
                        }
                        let name = name.as_str().ok_or_else(|| {
                            StagecraftError::InvalidProject(
                                "service names must be strings".to_string(),
                            )
                        })?;
                        out.push_str(&indent(&emit_entry(name, service)?, 2));
                    }
                }
                _ => out.push_str(&emit_entry("services", services)?),
            }
        }

        for section in &TOP_LEVEL_ORDER[2..] {
            if let Some(value) = self.doc.get(&key(section)) {
                out.push_str(&emit_entry(section, value)?);
            }
        }

        let mut extensions: Vec<&str> = self
            .doc
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .filter(|k| !TOP_LEVEL_ORDER.contains(k))
            .collect();
        extensions.sort_unstable();
        for section in extensions {
            if let Some(value) = self.doc.get(&key(section)) {
                out.push_str(&emit_entry(section, value)?);
            }
        }

        let trimmed = out.trim_end_matches('\n');
        Ok(format!("{trimmed}\n\n"))
    }
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (name, value) in overlay {
        match (base.get_mut(name), value) {
            (Some(Value::Mapping(base_child)), Value::Mapping(overlay_child)) => {
                merge_mapping(base_child, overlay_child);
            }
            _ => {
                base.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Serialize one `key: value` entry without a document separator.
fn emit_entry(name: &str, value: &Value) -> Result<String> {
    let mut single = Mapping::new();
    single.insert(key(name), value.clone());
    let text = serde_yaml::to_string(&Value::Mapping(single))?;
    Ok(text.trim_start_matches("---\n").to_string())
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    let mut out = String::new();
    for line in text.lines() {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str(&pad);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Normalize a service `environment` node into an ordered name -> value map.
fn normalize_environment(node: Option<&Value>) -> BTreeMap<String, Value> {
    let mut env = BTreeMap::new();
    match node {
        Some(Value::Mapping(entries)) => {
            for (name, value) in entries {
                if let Some(name) = name.as_str() {
                    env.insert(name.to_string(), value.clone());
                }
            }
        }
        Some(Value::Sequence(entries)) => {
            for entry in entries {
                let Some(entry) = entry.as_str() else {
                    continue;
                };
                match entry.split_once('=') {
                    Some((name, value)) => {
                        env.insert(name.to_string(), Value::String(value.to_string()));
                    }
                    None => {
                        env.insert(entry.to_string(), Value::Null);
                    }
                }
            }
        }
        _ => {}
    }
    env
}

/// Default-value branch of compose variable interpolation: a
/// `${VAR:-default}` reference resolves to its default; anything else is
/// returned unchanged. Environment lookup is intentionally not performed.
pub fn resolve_volume_variable(reference: &str) -> String {
    let Some(inner) = reference
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return reference.to_string();
    };
    match inner.split_once(":-") {
        Some((_, default)) => default.to_string(),
        None => reference.to_string(),
    }
}

/// A rendered, content-addressed compose artifact.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Render the environment-pinned compose file under
/// `.stagecraft/rendered/<env>/docker-compose.yml` and return the exact
/// bytes plus their SHA-256. Output is identical for identical inputs
/// regardless of the invocation directory.
pub fn render_environment(
    workdir: &Path,
    base_compose: &Path,
    environment: &str,
    image_tag: &str,
    env_file: Option<&Path>,
    overlays: &[String],
) -> Result<Rendered> {
    let base_path = if base_compose.is_absolute() {
        base_compose.to_path_buf()
    } else {
        workdir.join(base_compose)
    };
    let mut compose = ComposeFile::load(&base_path)?;

    for overlay in overlays {
        let overlay = ComposeFile::load(&workdir.join(overlay))?;
        compose.apply_overlay(&overlay);
    }

    compose.set_service_images(image_tag);
    let mut vars = BTreeMap::new();
    if let Some(env_file) = env_file {
        let env_path = if env_file.is_absolute() {
            env_file.to_path_buf()
        } else {
            workdir.join(env_file)
        };
        if let Some(loaded) = envfile::load(&env_path)? {
            vars = loaded;
        }
    }
    compose.merge_environment(&vars);

    let bytes = compose.render()?.into_bytes();
    let sha256 = sha256_hex(&bytes);

    let out_dir = workdir
        .join(".stagecraft")
        .join("rendered")
        .join(environment);
    fs::create_dir_all(&out_dir)?;
    let path = out_dir.join("docker-compose.yml");
    fs::write(&path, &bytes)?;
    set_artifact_permissions(&out_dir, &path)?;

    info!(path = %path.display(), sha256 = %sha256, "compose rendered");
    Ok(Rendered {
        path,
        bytes,
        sha256,
    })
}

#[cfg(unix)]
fn set_artifact_permissions(dir: &Path, file: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    fs::set_permissions(file, fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_artifact_permissions(_dir: &Path, _file: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
version: "3.9"
services:
  api:
    image: old:tag
    environment:
      EXISTING: original
  worker:
    build:
      context: .
volumes:
  app_data:
    driver: local
x-custom:
  foo: bar
"#;

    #[test]
    fn image_injection_overrides_build_and_image() {
        let mut compose = ComposeFile::parse(BASE).unwrap();
        compose.set_service_images("myapp:v1");
        let rendered = compose.render().unwrap();
        assert!(!rendered.contains("old:tag"));
        assert_eq!(rendered.matches("image: myapp:v1").count(), 2);
        assert!(rendered.contains("build:"));
    }

    #[test]
    fn existing_environment_wins_and_result_is_sorted() {
        let mut compose = ComposeFile::parse(BASE).unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("NEW".to_string(), "one".to_string());
        vars.insert("EXISTING".to_string(), "keep_me".to_string());
        compose.merge_environment(&vars);
        let rendered = compose.render().unwrap();
        assert!(rendered.contains("EXISTING: original"));
        assert!(rendered.contains("NEW: one"));
        let existing = rendered.find("EXISTING").unwrap();
        let new = rendered.find("NEW").unwrap();
        assert!(existing < new);
    }

    #[test]
    fn rendering_is_deterministic_and_layout_is_fixed() {
        let mut first = ComposeFile::parse(BASE).unwrap();
        first.set_service_images("myapp:v1");
        let mut second = ComposeFile::parse(BASE).unwrap();
        second.set_service_images("myapp:v1");
        let a = first.render().unwrap();
        let b = second.render().unwrap();
        assert_eq!(a, b);
        assert_eq!(sha256_hex(a.as_bytes()), sha256_hex(b.as_bytes()));

        assert!(a.starts_with("version:"));
        // Blank line after the version section.
        let version_end = a.find('\n').unwrap();
        assert_eq!(&a[version_end + 1..version_end + 2], "\n");
        // Blank line between services.
        assert!(a.contains("\n\n  worker:"));
        // Exactly two trailing newlines.
        assert!(a.ends_with("\n\n"));
        assert!(!a.ends_with("\n\n\n"));
        // Extensions come after the known sections.
        assert!(a.find("volumes:").unwrap() < a.find("x-custom:").unwrap());
    }

    #[test]
    fn all_top_level_keys_survive() {
        let compose = ComposeFile::parse(BASE).unwrap();
        let rendered = compose.render().unwrap();
        for section in ["version:", "services:", "volumes:", "x-custom:"] {
            assert!(rendered.contains(section), "missing {section}");
        }
    }

    #[test]
    fn list_form_environment_is_normalized() {
        let raw = "services:\n  api:\n    environment:\n      - B=2\n      - A=1\n";
        let mut compose = ComposeFile::parse(raw).unwrap();
        compose.merge_environment(&BTreeMap::new());
        let rendered = compose.render().unwrap();
        let a = rendered.find("A: '1'").or_else(|| rendered.find("A: \"1\"")).or_else(|| rendered.find("A: 1"));
        assert!(a.is_some(), "normalized mapping missing: {rendered}");
        assert!(rendered.find("A:").unwrap() < rendered.find("B:").unwrap());
    }

    #[test]
    fn volume_variable_default_branch() {
        assert_eq!(resolve_volume_variable("${DATA_DIR:-/var/data}"), "/var/data");
        assert_eq!(resolve_volume_variable("${DATA_DIR}"), "${DATA_DIR}");
        assert_eq!(resolve_volume_variable("plain"), "plain");
    }
}
