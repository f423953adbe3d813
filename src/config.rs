//! Bridge configuration
//!
//! Loaded once at startup from YAML. `${VAR}` references are substituted
//! from the environment before parsing; unknown variables are left as-is.
//!
//! ```yaml
//! buffer:
//!   timeout_secs: 300
//! prefixes:
//!   event: hal_
//!   definition: had_
//! mappings:
//!   - topic: events/alarms/log
//!     target_kind: haAlarmEvent
//!     space: ${INSTANCE_SPACE}
//!     type_prefix: hal_
//!     trigger_key: alarms
//! ```

use crate::model::id::is_valid_prefix;
use crate::model::{PrefixTable, TargetKind};
use crate::routing::{PatternError, TopicPattern};
use crate::trigger::TriggerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("mapping '{topic}': {source}")]
    Pattern {
        topic: String,
        #[source]
        source: PatternError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How booleans are represented in the target kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanConvention {
    /// General-attribute sinks keep native booleans.
    #[default]
    Native,
    /// Scalar-numeric sinks take `1`/`0`.
    Numeric,
}

/// One topic pattern and where its records go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMapping {
    pub topic: String,
    /// Container or view identifier
    pub target_kind: String,
    /// Space the container/view is defined in; defaults to `space`
    #[serde(default)]
    pub model_space: Option<String>,
    /// View version; `None` writes to a container
    #[serde(default)]
    pub model_version: Option<String>,
    /// Instance space records are written into
    pub space: String,
    /// Space of referenced records; defaults to `space`
    #[serde(default)]
    pub relation_space: Option<String>,
    #[serde(default)]
    pub type_prefix: Option<String>,
    #[serde(default)]
    pub booleans: BooleanConvention,
    #[serde(default)]
    pub trigger_key: Option<String>,
    #[serde(default)]
    pub generate_missing_id: bool,
    /// Extra keys to parse as timestamps
    #[serde(default)]
    pub timestamp_fields: Vec<String>,
}

impl TopicMapping {
    pub fn new(
        topic: impl Into<String>,
        target_kind: impl Into<String>,
        space: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            target_kind: target_kind.into(),
            model_space: None,
            model_version: None,
            space: space.into(),
            relation_space: None,
            type_prefix: None,
            booleans: BooleanConvention::Native,
            trigger_key: None,
            generate_missing_id: false,
            timestamp_fields: Vec::new(),
        }
    }

    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = Some(prefix.into());
        self
    }

    pub fn with_model(mut self, space: impl Into<String>, version: Option<&str>) -> Self {
        self.model_space = Some(space.into());
        self.model_version = version.map(str::to_string);
        self
    }

    pub fn with_relation_space(mut self, space: impl Into<String>) -> Self {
        self.relation_space = Some(space.into());
        self
    }

    pub fn with_booleans(mut self, booleans: BooleanConvention) -> Self {
        self.booleans = booleans;
        self
    }

    pub fn with_trigger_key(mut self, key: impl Into<String>) -> Self {
        self.trigger_key = Some(key.into());
        self
    }

    pub fn with_generated_ids(mut self) -> Self {
        self.generate_missing_id = true;
        self
    }

    pub fn relation_space(&self) -> &str {
        self.relation_space.as_deref().unwrap_or(&self.space)
    }

    pub fn target(&self) -> TargetKind {
        TargetKind {
            external_id: self.target_kind.clone(),
            space: self.model_space.clone().unwrap_or_else(|| self.space.clone()),
            version: self.model_version.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        TopicPattern::parse(&self.topic).map_err(|source| ConfigError::Pattern {
            topic: self.topic.clone(),
            source,
        })?;
        let invalid =
            |what: &str| ConfigError::Invalid(format!("mapping '{}': {}", self.topic, what));
        if self.target_kind.trim().is_empty() {
            return Err(invalid("target_kind is empty"));
        }
        if self.space.trim().is_empty() {
            return Err(invalid("space is empty"));
        }
        if let Some(prefix) = &self.type_prefix {
            if !is_valid_prefix(prefix) {
                return Err(invalid(&format!(
                    "type_prefix '{}' is not a valid identifier start",
                    prefix
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tick_interval_secs: u64,
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            workers: 4,
        }
    }
}

impl PipelineConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub timeout_secs: u64,
    /// Optional cap; the item closest to expiry is flushed early when full
    pub max_items: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_items: None,
        }
    }
}

impl BufferConfig {
    pub fn timeout(&self) -> chrono::Duration {
        secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_queue_size: usize,
    pub max_age_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_age_secs: 86_400,
        }
    }
}

impl RetryConfig {
    pub fn max_age(&self) -> chrono::Duration {
        secs(self.max_age_secs)
    }
}

/// Per-key override of the trigger timing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerOverride {
    #[serde(default)]
    pub debounce_secs: Option<u64>,
    #[serde(default)]
    pub min_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub debounce_secs: u64,
    pub min_interval_secs: u64,
    pub keys: BTreeMap<String, TriggerOverride>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            debounce_secs: 5,
            min_interval_secs: 300,
            keys: BTreeMap::new(),
        }
    }
}

impl TriggerSettings {
    pub fn defaults(&self) -> TriggerConfig {
        TriggerConfig::new(secs(self.debounce_secs), secs(self.min_interval_secs))
    }

    /// Timing for one trigger key, falling back to the defaults.
    pub fn config_for(&self, key: &str) -> TriggerConfig {
        let over = self.keys.get(key).cloned().unwrap_or_default();
        TriggerConfig::new(
            secs(over.debounce_secs.unwrap_or(self.debounce_secs)),
            secs(over.min_interval_secs.unwrap_or(self.min_interval_secs)),
        )
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub trigger: TriggerSettings,
    #[serde(default)]
    pub prefixes: PrefixTable,
    pub mappings: Vec<TopicMapping>,
}

impl BridgeConfig {
    /// A configuration with default settings and the given mappings.
    pub fn with_mappings(mappings: Vec<TopicMapping>) -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            buffer: BufferConfig::default(),
            retry: RetryConfig::default(),
            trigger: TriggerSettings::default(),
            prefixes: PrefixTable::default(),
            mappings,
        }
    }

    /// Read, substitute, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(
            path = %path.display(),
            mappings = config.mappings.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let text = substitute_env(text, |name| std::env::var(name).ok());
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mappings.is_empty() {
            return Err(ConfigError::Invalid("at least one mapping is required".into()));
        }
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
        }
        if self.pipeline.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid("pipeline.tick_interval_secs must be positive".into()));
        }
        if self.retry.max_queue_size == 0 {
            return Err(ConfigError::Invalid("retry.max_queue_size must be positive".into()));
        }
        if self.buffer.max_items == Some(0) {
            return Err(ConfigError::Invalid("buffer.max_items must be positive when set".into()));
        }
        for (kind, prefix) in self.prefixes.iter() {
            if !is_valid_prefix(prefix) {
                return Err(ConfigError::Invalid(format!(
                    "prefix '{}' for '{}' is not a valid identifier start",
                    prefix, kind
                )));
            }
        }
        for mapping in &self.mappings {
            mapping.validate()?;
        }
        Ok(())
    }
}

/// `<config dir>/graphbridge/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("graphbridge").join("config.yaml"))
}

/// Replace `${NAME}` with `lookup(NAME)`. Unknown names and unterminated
/// references are copied through unchanged.
pub fn substitute_env(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            out.push(ch);
            continue;
        }
        chars.next();

        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }

        match (closed, lookup(&name)) {
            (true, Some(value)) => out.push_str(&value),
            (true, None) => {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
            (false, _) => {
                out.push_str("${");
                out.push_str(&name);
            }
        }
    }

    out
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
mappings:
  - topic: events/alarms/log
    target_kind: haAlarmEvent
    space: inst
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = BridgeConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.buffer.timeout_secs, 300);
        assert_eq!(config.retry.max_queue_size, 10_000);
        assert_eq!(config.retry.max_age_secs, 86_400);
        assert_eq!(config.trigger.debounce_secs, 5);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.mappings[0].booleans, BooleanConvention::Native);
        assert_eq!(config.mappings[0].relation_space(), "inst");
    }

    #[test]
    fn full_mapping_parses() {
        let yaml = r#"
prefixes:
  event: hal_
  frame: haf_
trigger:
  debounce_secs: 2
  keys:
    alarms:
      min_interval_secs: 60
mappings:
  - topic: states/+/temp
    target_kind: temperature
    model_space: schema
    model_version: v1
    space: inst
    relation_space: shared
    type_prefix: hal_
    booleans: numeric
    trigger_key: alarms
    generate_missing_id: true
    timestamp_fields: [observed]
"#;
        let config = BridgeConfig::from_yaml_str(yaml).unwrap();
        let m = &config.mappings[0];
        assert_eq!(m.booleans, BooleanConvention::Numeric);
        assert_eq!(m.target().to_string(), "schema/temperature/v1");
        assert_eq!(m.relation_space(), "shared");
        assert_eq!(config.prefixes.prefix_for("frame"), Some("haf_"));

        let alarms = config.trigger.config_for("alarms");
        assert_eq!(alarms.debounce, chrono::Duration::seconds(2));
        assert_eq!(alarms.min_interval, chrono::Duration::seconds(60));
        assert_eq!(config.trigger.config_for("other").min_interval, chrono::Duration::seconds(300));
    }

    #[test]
    fn rejects_bad_patterns_and_prefixes() {
        let yaml = MINIMAL.replace("events/alarms/log", "events/#/log");
        assert!(matches!(
            BridgeConfig::from_yaml_str(&yaml),
            Err(ConfigError::Pattern { .. })
        ));

        let yaml = format!("{}    type_prefix: 9x_\n", MINIMAL);
        assert!(matches!(
            BridgeConfig::from_yaml_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            BridgeConfig::from_yaml_str("mappings: []"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn substitution() {
        let lookup = |name: &str| (name == "SPACE").then(|| "prod".to_string());
        assert_eq!(substitute_env("space: ${SPACE}", lookup), "space: prod");
        assert_eq!(substitute_env("x: ${MISSING}", lookup), "x: ${MISSING}");
        assert_eq!(substitute_env("cost: $5 ${SPACE", lookup), "cost: $5 ${SPACE");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.mappings.len(), 1);

        let missing = BridgeConfig::load(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn default_path_ends_with_crate_dir() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("graphbridge/config.yaml"));
        }
    }
}
