use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Result, StagecraftError};
use crate::paths::{is_sha256_hex, normalize_relative};

/// Supported step actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Build,
    RenderCompose,
    ApplyCompose,
    Migrate,
    HealthCheck,
    Rollout,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Build => "build",
            ActionKind::RenderCompose => "render_compose",
            ActionKind::ApplyCompose => "apply_compose",
            ActionKind::Migrate => "migrate",
            ActionKind::HealthCheck => "health_check",
            ActionKind::Rollout => "rollout",
        }
    }
}

/// Field-level validation failure for a step-action payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct InputError {
    pub field: String,
    pub reason: String,
}

impl InputError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<InputError> for StagecraftError {
    fn from(err: InputError) -> Self {
        StagecraftError::InvalidConfig(err.to_string())
    }
}

pub type InputResult = std::result::Result<(), InputError>;

/// Wire contract shared by every step-action payload.
///
/// Producer: construct -> `normalize` -> `validate` -> [`encode`].
/// Consumer: [`decode_strict`] -> `validate` -> use.
pub trait StepInputs: Serialize + DeserializeOwned {
    const KIND: ActionKind;
    fn normalize(&mut self);
    fn validate(&self) -> InputResult;
}

/// Producer-side marshalling: normalize, validate, serialize.
pub fn encode<T: StepInputs>(inputs: &mut T) -> Result<Vec<u8>> {
    inputs.normalize();
    inputs.validate()?;
    Ok(serde_json::to_vec(inputs)?)
}

/// Strict decode: unknown fields and trailing tokens are hard errors.
pub fn decode_strict<T: StepInputs>(bytes: &[u8]) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_slice(bytes);
    let value = T::deserialize(&mut deserializer)
        .map_err(|err| StagecraftError::StrictDecodeFailed(err.to_string()))?;
    deserializer.end().map_err(|err| {
        StagecraftError::StrictDecodeFailed(format!("trailing input after payload: {err}"))
    })?;
    Ok(value)
}

/// Consumer-side entry point: strict decode plus re-validation.
pub fn decode_validated<T: StepInputs>(bytes: &[u8]) -> Result<T> {
    let value: T = decode_strict(bytes)?;
    value.validate()?;
    Ok(value)
}

/// One `key=value` entry. Key-value lists travel sorted by key with
/// duplicate keys forbidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

fn sort_set(list: &mut Vec<String>) {
    for item in list.iter_mut() {
        *item = item.trim().to_string();
    }
    list.sort();
    list.dedup();
}

fn sort_pairs(list: &mut [KeyValue]) {
    for pair in list.iter_mut() {
        pair.key = pair.key.trim().to_string();
    }
    list.sort_by(|a, b| a.key.cmp(&b.key));
}

fn check_no_duplicate_keys(field: &str, list: &[KeyValue]) -> InputResult {
    for window in list.windows(2) {
        if window[0].key == window[1].key {
            return Err(InputError::new(
                field,
                format!("duplicate key '{}'", window[0].key),
            ));
        }
    }
    Ok(())
}

fn check_non_empty(field: &str, value: &str) -> InputResult {
    if value.trim().is_empty() {
        Err(InputError::new(field, "must not be empty"))
    } else {
        Ok(())
    }
}

/// Canonicalize in place when the path is valid; leave invalid values for
/// `validate` to reject with the precise reason.
fn normalize_path_field(value: &mut String) {
    if let Ok(normalized) = normalize_relative(value) {
        *value = normalized;
    }
}

fn check_path(field: &str, value: &str) -> InputResult {
    normalize_relative(value)
        .map(|_| ())
        .map_err(|reason| InputError::new(field, reason))
}

fn check_positive_u64(field: &str, value: Option<u64>) -> InputResult {
    match value {
        Some(0) => Err(InputError::new(field, "must be greater than zero")),
        _ => Ok(()),
    }
}

fn check_hash_pair(alg: Option<&str>, hash: Option<&str>) -> InputResult {
    match (alg, hash) {
        (None, None) => Ok(()),
        (Some(alg), Some(hash)) => {
            if alg != "sha256" {
                return Err(InputError::new(
                    "expected_compose_hash_alg",
                    format!("unsupported algorithm '{alg}'"),
                ));
            }
            if !is_sha256_hex(hash) {
                return Err(InputError::new(
                    "expected_compose_hash",
                    "must be exactly 64 lowercase hex characters",
                ));
            }
            Ok(())
        }
        (Some(_), None) => Err(InputError::new("expected_compose_hash", "must be set when an algorithm is given")),
        (None, Some(_)) => Err(InputError::new(
            "expected_compose_hash_alg",
            "must be set when a hash is given",
        )),
    }
}

/// Inputs for `build`. `dockerfile` and `context` are required so the
/// producer's intent is explicit; there is no "." defaulting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildInputs {
    pub provider: String,
    pub workdir: String,
    pub dockerfile: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_args: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<KeyValue>,
}

impl StepInputs for BuildInputs {
    const KIND: ActionKind = ActionKind::Build;

    fn normalize(&mut self) {
        self.provider = self.provider.trim().to_string();
        normalize_path_field(&mut self.workdir);
        normalize_path_field(&mut self.dockerfile);
        normalize_path_field(&mut self.context);
        sort_set(&mut self.tags);
        sort_pairs(&mut self.build_args);
        sort_pairs(&mut self.labels);
    }

    fn validate(&self) -> InputResult {
        check_non_empty("provider", &self.provider)?;
        check_path("workdir", &self.workdir)?;
        check_path("dockerfile", &self.dockerfile)?;
        check_path("context", &self.context)?;
        if self.tags.is_empty() {
            return Err(InputError::new("tags", "at least one image tag is required"));
        }
        check_no_duplicate_keys("build_args", &self.build_args)?;
        check_no_duplicate_keys("labels", &self.labels)?;
        Ok(())
    }
}

/// Inputs for `render_compose`. Exactly one of `base_compose_path` and
/// `base_compose_inline` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderComposeInputs {
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_compose_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_compose_inline: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overlays: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<KeyValue>,
    pub output_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_compose_hash_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_compose_hash: Option<String>,
}

impl StepInputs for RenderComposeInputs {
    const KIND: ActionKind = ActionKind::RenderCompose;

    fn normalize(&mut self) {
        self.environment = self.environment.trim().to_string();
        if let Some(path) = self.base_compose_path.as_mut() {
            normalize_path_field(path);
        }
        normalize_path_field(&mut self.output_path);
        for overlay in self.overlays.iter_mut() {
            normalize_path_field(overlay);
        }
        sort_set(&mut self.overlays);
        sort_pairs(&mut self.variables);
        if let Some(alg) = self.expected_compose_hash_alg.as_mut() {
            *alg = alg.trim().to_ascii_lowercase();
        }
    }

    fn validate(&self) -> InputResult {
        check_non_empty("environment", &self.environment)?;
        match (&self.base_compose_path, &self.base_compose_inline) {
            (Some(_), Some(_)) => {
                return Err(InputError::new(
                    "base_compose_path",
                    "mutually exclusive with base_compose_inline",
                ));
            }
            (None, None) => {
                return Err(InputError::new(
                    "base_compose_path",
                    "one of base_compose_path or base_compose_inline is required",
                ));
            }
            _ => {}
        }
        if let Some(path) = &self.base_compose_path {
            check_path("base_compose_path", path)?;
        }
        for overlay in &self.overlays {
            check_path("overlays", overlay)?;
        }
        check_no_duplicate_keys("variables", &self.variables)?;
        check_path("output_path", &self.output_path)?;
        check_hash_pair(
            self.expected_compose_hash_alg.as_deref(),
            self.expected_compose_hash.as_deref(),
        )
    }
}

/// Inputs for `apply_compose`. `pull` and `detach` are presence-required:
/// a missing value is a validation error, forcing intent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyComposeInputs {
    pub environment: String,
    pub compose_path: String,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detach: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_compose_hash_alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_compose_hash: Option<String>,
}

impl StepInputs for ApplyComposeInputs {
    const KIND: ActionKind = ActionKind::ApplyCompose;

    fn normalize(&mut self) {
        self.environment = self.environment.trim().to_string();
        self.project_name = self.project_name.trim().to_string();
        normalize_path_field(&mut self.compose_path);
        sort_set(&mut self.services);
        if let Some(alg) = self.expected_compose_hash_alg.as_mut() {
            *alg = alg.trim().to_ascii_lowercase();
        }
    }

    fn validate(&self) -> InputResult {
        check_non_empty("environment", &self.environment)?;
        check_path("compose_path", &self.compose_path)?;
        check_non_empty("project_name", &self.project_name)?;
        if self.pull.is_none() {
            return Err(InputError::new("pull", "must be set explicitly"));
        }
        if self.detach.is_none() {
            return Err(InputError::new("detach", "must be set explicitly"));
        }
        check_hash_pair(
            self.expected_compose_hash_alg.as_deref(),
            self.expected_compose_hash.as_deref(),
        )
    }
}

/// Inputs for `migrate`. `args` order is meaningful and preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrateInputs {
    pub database: String,
    pub strategy: String,
    pub engine: String,
    pub path: String,
    pub conn_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl StepInputs for MigrateInputs {
    const KIND: ActionKind = ActionKind::Migrate;

    fn normalize(&mut self) {
        self.database = self.database.trim().to_string();
        self.strategy = self.strategy.trim().to_string();
        self.engine = self.engine.trim().to_string();
        self.conn_env = self.conn_env.trim().to_string();
        normalize_path_field(&mut self.path);
    }

    fn validate(&self) -> InputResult {
        check_non_empty("database", &self.database)?;
        if !matches!(self.strategy.as_str(), "pre_deploy" | "post_deploy" | "manual") {
            return Err(InputError::new(
                "strategy",
                format!("unknown strategy '{}'", self.strategy),
            ));
        }
        check_non_empty("engine", &self.engine)?;
        check_path("path", &self.path)?;
        check_non_empty("conn_env", &self.conn_env)?;
        check_positive_u64("timeout_seconds", self.timeout_seconds)
    }
}

/// A single HTTP probe within a `health_check` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointInput {
    pub name: String,
    pub url: String,
    pub expected_status: u16,
    /// Explicit, never defaulted to GET by the producer.
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValue>,
}

/// Inputs for `health_check`. Exactly one of `endpoints` and `services`
/// must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckInputs {
    pub environment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl StepInputs for HealthCheckInputs {
    const KIND: ActionKind = ActionKind::HealthCheck;

    fn normalize(&mut self) {
        self.environment = self.environment.trim().to_string();
        self.endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        for endpoint in self.endpoints.iter_mut() {
            endpoint.name = endpoint.name.trim().to_string();
            endpoint.method = endpoint.method.trim().to_ascii_uppercase();
            sort_pairs(&mut endpoint.headers);
        }
        sort_set(&mut self.services);
    }

    fn validate(&self) -> InputResult {
        check_non_empty("environment", &self.environment)?;
        match (self.endpoints.is_empty(), self.services.is_empty()) {
            (true, true) => {
                return Err(InputError::new(
                    "endpoints",
                    "one of endpoints or services is required",
                ));
            }
            (false, false) => {
                return Err(InputError::new(
                    "endpoints",
                    "mutually exclusive with services",
                ));
            }
            _ => {}
        }
        for endpoint in &self.endpoints {
            check_non_empty("endpoints.name", &endpoint.name)?;
            check_non_empty("endpoints.url", &endpoint.url)?;
            if endpoint.expected_status == 0 {
                return Err(InputError::new(
                    "endpoints.expected_status",
                    "must be greater than zero",
                ));
            }
            check_non_empty("endpoints.method", &endpoint.method)?;
            check_no_duplicate_keys("endpoints.headers", &endpoint.headers)?;
        }
        check_positive_u64("timeout_seconds", self.timeout_seconds)?;
        check_positive_u64("interval_seconds", self.interval_seconds)?;
        if self.retries == Some(0) {
            return Err(InputError::new("retries", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Inputs for `rollout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RolloutInputs {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

impl StepInputs for RolloutInputs {
    const KIND: ActionKind = ActionKind::Rollout;

    fn normalize(&mut self) {
        self.mode = self.mode.trim().to_string();
        sort_set(&mut self.targets);
    }

    fn validate(&self) -> InputResult {
        check_non_empty("mode", &self.mode)?;
        if self.batch_size == Some(0) {
            return Err(InputError::new("batch_size", "must be greater than zero"));
        }
        Ok(())
    }
}
