//! Configuration for PostRoute

use crate::mail::state;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Spool dispatcher configuration
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Processing pipeline configuration
    pub pipeline: PipelineConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Spool dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Number of concurrent worker flows
    #[serde(default = "default_spool_workers")]
    pub workers: usize,

    /// Bounded queue capacity between front-ends and workers
    #[serde(default = "default_spool_queue_size")]
    pub queue_size: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            workers: default_spool_workers(),
            queue_size: default_spool_queue_size(),
        }
    }
}

fn default_spool_workers() -> usize {
    4
}

fn default_spool_queue_size() -> usize {
    512
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Processing pipeline: a list of named processors, each with an ordered
/// list of matcher/mailet step declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

impl PipelineConfig {
    /// Validate the pipeline shape before assembly.
    ///
    /// A `root` processor is mandatory (every mail starts there) and
    /// processor names must be unique. A missing `error` processor is
    /// legal but downgrades every fault to a hard routing failure, so it
    /// is worth a warning at startup.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::new();
        for processor in &self.processors {
            if processor.name == state::VANISH {
                return Err(crate::Error::Config(format!(
                    "'{}' is a reserved terminal state and cannot name a processor",
                    state::VANISH
                )));
            }
            if !seen.insert(processor.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate processor name: {}",
                    processor.name
                )));
            }
        }

        if !seen.contains(state::ROOT) {
            return Err(crate::Error::Config(format!(
                "Pipeline must declare a '{}' processor",
                state::ROOT
            )));
        }

        if !seen.contains(state::ERROR) {
            tracing::warn!(
                "No '{}' processor configured; any processing fault will abort routing",
                state::ERROR
            );
        }

        Ok(())
    }

    pub fn processor(&self, name: &str) -> Option<&ProcessorConfig> {
        self.processors.iter().find(|p| p.name == name)
    }
}

/// One named processor: an ordered list of step declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Unique name, used as a mail state value
    pub name: String,

    /// Ordered step declarations
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One matcher/mailet pair declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Matcher identifier, resolved through the capability registry
    #[serde(default = "default_matcher")]
    pub matcher: String,

    /// Matcher condition expression (matcher-specific)
    pub condition: Option<String>,

    /// Mailet identifier, resolved through the capability registry
    pub mailet: String,

    /// Mailet-specific key/value configuration
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

fn default_matcher() -> String {
    "all".to_string()
}

impl StepConfig {
    /// Shorthand used by registry tests and programmatic assembly.
    pub fn new(matcher: impl Into<String>, mailet: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            condition: None,
            mailet: mailet.into(),
            config: HashMap::new(),
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// The matcher condition, or an error naming the matcher kind.
    pub fn require_condition(&self) -> crate::Result<&str> {
        self.condition.as_deref().ok_or_else(|| {
            crate::Error::Config(format!("Matcher '{}' requires a condition", self.matcher))
        })
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }

    /// A mandatory string parameter, or an error naming the mailet kind.
    pub fn require_str(&self, key: &str) -> crate::Result<&str> {
        self.config.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
            crate::Error::Config(format!(
                "Mailet '{}' requires a string parameter '{}'",
                self.mailet, key
            ))
        })
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn f64_param(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(|v| v.as_f64())
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./postroute.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/postroute/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
[server]
hostname = "mx.example.org"

[spool]
workers = 2
queue_size = 64

[[pipeline.processors]]
name = "root"

  [[pipeline.processors.steps]]
  matcher = "recipient-is"
  condition = "a@x.org b@x.org"
  mailet = "add-header"

    [pipeline.processors.steps.config]
    name = "X-Routed"
    value = "1"

[[pipeline.processors]]
name = "error"

  [[pipeline.processors.steps]]
  mailet = "discard"
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.hostname, "mx.example.org");
        assert_eq!(config.spool.workers, 2);
        assert_eq!(config.pipeline.processors.len(), 2);

        let root = config.pipeline.processor("root").unwrap();
        let step = &root.steps[0];
        assert_eq!(step.matcher, "recipient-is");
        assert_eq!(step.condition.as_deref(), Some("a@x.org b@x.org"));
        assert_eq!(step.require_str("name").unwrap(), "X-Routed");

        config.pipeline.validate().unwrap();
    }

    #[test]
    fn test_step_defaults_to_all_matcher() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let error = config.pipeline.processor("error").unwrap();
        assert_eq!(error.steps[0].matcher, "all");
        assert!(error.steps[0].condition.is_none());
    }

    #[test]
    fn test_validate_requires_root() {
        let pipeline = PipelineConfig {
            processors: vec![ProcessorConfig {
                name: "transport".to_string(),
                steps: vec![],
            }],
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let pipeline = PipelineConfig {
            processors: vec![
                ProcessorConfig {
                    name: "root".to_string(),
                    steps: vec![],
                },
                ProcessorConfig {
                    name: "root".to_string(),
                    steps: vec![],
                },
            ],
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_vanish() {
        let pipeline = PipelineConfig {
            processors: vec![
                ProcessorConfig {
                    name: "root".to_string(),
                    steps: vec![],
                },
                ProcessorConfig {
                    name: "vanish".to_string(),
                    steps: vec![],
                },
            ],
        };
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_default_spool_config() {
        let spool = SpoolConfig::default();
        assert_eq!(spool.workers, 4);
        assert_eq!(spool.queue_size, 512);
    }
}
