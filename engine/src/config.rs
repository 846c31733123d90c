//! Engine configuration
//!
//! The engine consumes the *parsed* form of the configuration document; the
//! YAML/JSON loader and schema validation in front of it are external. The
//! shapes here mirror the document:
//!
//! ```text
//! routes:
//!   - name: motion-alerts
//!     from: "rtsp://{{CAMERA_HOST}}/stream"
//!     processors:
//!       - type: filter
//!         condition: "{{confidence}} > 0.7"
//!       - type: external
//!         command: ["python3", "scripts/detect.py"]
//!     to: ["mqtt://broker/alerts", "log://"]
//! env_vars: [CAMERA_HOST]
//! settings:
//!   max_concurrent_routes: 10
//!   default_timeout: 30
//! ```
//!
//! An unrecognized processor `type` fails deserialization, which the engine
//! surfaces as a configuration error and refuses to start.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use virta_core::{Result, RouteError};

/// Process-wide configuration: routes plus global settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Route declarations, started in order
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    /// Environment variables that must be present at engine start
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Global knobs
    #[serde(default)]
    pub settings: Settings,
}

impl EngineConfig {
    /// Deserialize from a JSON value (the loader's parsed form)
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| RouteError::Config(e.to_string()))
    }

    /// Shape-level validation, collecting every problem rather than
    /// stopping at the first
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (i, route) in self.routes.iter().enumerate() {
            let label = if route.name.is_empty() {
                format!("route #{}", i + 1)
            } else {
                format!("route '{}'", route.name)
            };

            if route.name.is_empty() {
                errors.push(format!("{label}: missing 'name'"));
            }
            if route.from.is_empty() {
                errors.push(format!("{label}: missing 'from'"));
            }
            if route.to.is_empty() {
                errors.push(format!("{label}: needs at least one 'to' destination"));
            }

            for (j, proc) in route.processors.iter().enumerate() {
                let ctx = format!("{label}, processor #{}", j + 1);
                match proc {
                    ProcessorSpec::Filter { condition } if condition.is_empty() => {
                        errors.push(format!("{ctx}: filter needs a 'condition'"));
                    }
                    ProcessorSpec::Transform { template } if template.is_empty() => {
                        errors.push(format!("{ctx}: transform needs a 'template'"));
                    }
                    ProcessorSpec::Aggregate { max_size, .. } if *max_size == 0 => {
                        errors.push(format!("{ctx}: aggregate 'max_size' must be positive"));
                    }
                    ProcessorSpec::External { command, .. } if command.tokens().is_empty() => {
                        errors.push(format!("{ctx}: external needs a 'command'"));
                    }
                    _ => {}
                }
            }
        }

        let names: Vec<&str> = self.routes.iter().map(|r| r.name.as_str()).collect();
        for (i, name) in names.iter().enumerate() {
            if !name.is_empty() && names[..i].contains(name) {
                errors.push(format!("route '{name}': duplicate name"));
            }
        }

        errors
    }
}

/// One route: a source, ordered processors, one or more destinations
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    /// Route name, unique within the engine
    pub name: String,
    /// Source endpoint URI (may contain `{{VAR}}` placeholders)
    pub from: String,
    /// Processor chain, applied in declared order
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,
    /// Destination endpoint URIs; a single string is accepted for one
    #[serde(deserialize_with = "one_or_many")]
    pub to: Vec<String>,
}

/// Processor configuration, tagged by `type`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorSpec {
    /// Drop messages whose condition evaluates false
    Filter {
        /// Boolean predicate over the message
        condition: String,
    },
    /// Render a template into the message body
    Transform {
        /// `{{var}}` template producing the new `body`
        template: String,
    },
    /// Buffer messages into size- or time-bounded windows
    Aggregate {
        /// Windowing strategy
        #[serde(default)]
        strategy: AggregateStrategy,
        /// Emit the window this long after its first message
        #[serde(with = "humantime_serde", default = "default_aggregate_timeout")]
        timeout: Duration,
        /// Emit the window once it holds this many messages
        max_size: usize,
        /// Maintain an independent window per value of this field
        #[serde(default)]
        group_by: Option<String>,
    },
    /// Log the message verbatim and forward it unchanged
    Debug {
        /// Prefix attached to every logged message
        #[serde(default = "default_debug_prefix")]
        prefix: String,
    },
    /// Delegate the message to a subprocess
    External {
        /// Command to run; argv list, or one string split on whitespace
        command: CommandSpec,
        /// How the input message is written for the subprocess
        #[serde(default)]
        input_format: PayloadFormat,
        /// How the subprocess output is read back
        #[serde(default)]
        output_format: PayloadFormat,
        /// Free-form options, injected as `CONFIG_<UPPER_KEY>` env vars;
        /// `timeout` (seconds) overrides the 60 s default deadline
        #[serde(default)]
        config: Map<String, Value>,
    },
}

impl ProcessorSpec {
    /// The `type` tag of this processor
    pub fn type_name(&self) -> &'static str {
        match self {
            ProcessorSpec::Filter { .. } => "filter",
            ProcessorSpec::Transform { .. } => "transform",
            ProcessorSpec::Aggregate { .. } => "aggregate",
            ProcessorSpec::Debug { .. } => "debug",
            ProcessorSpec::External { .. } => "external",
        }
    }
}

/// Aggregation strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStrategy {
    /// Collect buffered messages into an `items` list
    #[default]
    Collect,
}

/// Wire format between the engine and an external processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// The whole message as one JSON document
    #[default]
    Json,
    /// Only the `body` field, as UTF-8 bytes
    Text,
}

/// External command: argv list, or a single string split on whitespace
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Explicit argv tokens (use this when arguments contain spaces)
    Argv(Vec<String>),
    /// A command line split on whitespace
    Line(String),
}

impl CommandSpec {
    /// The argv tokens this command resolves to
    pub fn tokens(&self) -> Vec<String> {
        match self {
            CommandSpec::Argv(tokens) => tokens.clone(),
            CommandSpec::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Global engine settings with the documented defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Routes allowed to run at once; the rest wait in a pending set
    #[serde(default = "default_max_concurrent_routes")]
    pub max_concurrent_routes: usize,
    /// Per-operation timeout in seconds (source start, sink delivery)
    #[serde(default = "default_timeout_secs")]
    pub default_timeout: u64,
    /// Log level for the tracing filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Capacity of each route's source queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds to wait for clean route shutdown before force-terminating
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Settings {
    /// `default_timeout` as a [`Duration`]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }

    /// `shutdown_grace` as a [`Duration`]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_routes: default_max_concurrent_routes(),
            default_timeout: default_timeout_secs(),
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

fn default_max_concurrent_routes() -> usize {
    10
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_aggregate_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_debug_prefix() -> String {
    "DEBUG".to_string()
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(uri) => vec![uri],
        OneOrMany::Many(uris) => uris,
    })
}
