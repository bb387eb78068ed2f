use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{FahrplanError, Result};

use super::deprecation::migrate_deprecated;
use super::types::Config;

/// Environment variable prefix for overrides (`FAHRPLAN_BROKER_URL`).
pub const ENV_PREFIX: &str = "FAHRPLAN_";

#[derive(Clone, Copy)]
enum EnvKind {
    Str,
    Int,
    Float,
    Bool,
    List,
}

/// Keys settable from the environment and how their values are parsed.
const ENV_KEYS: &[(&str, EnvKind)] = &[
    ("broker_url", EnvKind::Str),
    ("broker_pool_limit", EnvKind::Int),
    ("broker_connection_timeout", EnvKind::Float),
    ("broker_connection_max_retries", EnvKind::Int),
    ("broker_heartbeat", EnvKind::Float),
    ("task_serializer", EnvKind::Str),
    ("accept_content", EnvKind::List),
    ("message_compression", EnvKind::Str),
    ("task_publish_retry", EnvKind::Bool),
    ("task_send_sent_event", EnvKind::Bool),
    ("task_default_queue", EnvKind::Str),
    ("task_default_exchange", EnvKind::Str),
    ("task_default_exchange_type", EnvKind::Str),
    ("task_default_routing_key", EnvKind::Str),
    ("task_default_delivery_mode", EnvKind::Str),
    ("task_create_missing_queues", EnvKind::Bool),
    ("task_track_started", EnvKind::Bool),
    ("task_acks_late", EnvKind::Bool),
    ("task_ignore_result", EnvKind::Bool),
    ("task_time_limit", EnvKind::Float),
    ("task_soft_time_limit", EnvKind::Float),
    ("result_backend", EnvKind::Str),
    ("result_expires", EnvKind::Int),
    ("timezone", EnvKind::Str),
    ("enable_utc", EnvKind::Bool),
    ("beat_schedule_filename", EnvKind::Str),
    ("beat_sync_every", EnvKind::Int),
    ("beat_sync_interval", EnvKind::Float),
    ("beat_max_loop_interval", EnvKind::Float),
];

// ── Builder ─────────────────────────────────────────────────────────

/// Resolves a [`Config`] from layered sources.
///
/// Precedence, highest first: preconfiguration overrides, the explicit
/// source, `FAHRPLAN_*` environment variables, built-in defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    preconf: toml::Table,
    source: toml::Table,
    use_env: bool,
    env_vars: Option<Vec<(String, String)>>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            preconf: toml::Table::new(),
            source: toml::Table::new(),
            use_env: true,
            env_vars: None,
        }
    }

    /// Set a single key that wins over every other layer.
    pub fn preconf(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.preconf.insert(key.into(), value.into());
        self
    }

    /// Merge a TOML document into the explicit source layer.
    pub fn source_toml(mut self, toml_str: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(toml_str)?;
        self.source.extend(table);
        Ok(self)
    }

    pub fn source_table(mut self, table: toml::Table) -> Self {
        self.source.extend(table);
        self
    }

    pub fn source_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        self.source_toml(&content)
    }

    /// Skip the environment layer.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Read the environment layer from `vars` instead of the process
    /// environment.
    pub fn env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Merge all layers, deserialize and validate.
    pub fn build(self) -> Result<Config> {
        let mut merged = toml::Table::new();

        if self.use_env {
            let env = match self.env_vars {
                Some(vars) => env_table(vars.into_iter())?,
                None => env_table(std::env::vars())?,
            };
            debug!(keys = env.len(), "environment overrides collected");
            merged.extend(env);
        }

        let mut source = self.source;
        migrate_deprecated(&mut source);
        merged.extend(source);

        let mut preconf = self.preconf;
        migrate_deprecated(&mut preconf);
        merged.extend(preconf);

        let config: Config = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }
}

/// Collect `FAHRPLAN_<KEY>` variables into a typed table.
fn env_table(vars: impl Iterator<Item = (String, String)>) -> Result<toml::Table> {
    let mut table = toml::Table::new();
    for (name, raw) in vars {
        let Some(suffix) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key = suffix.to_ascii_lowercase();
        let Some((_, kind)) = ENV_KEYS.iter().find(|(k, _)| *k == key) else {
            continue;
        };
        let value = parse_env_value(&name, &raw, *kind)?;
        table.insert(key, value);
    }
    Ok(table)
}

fn parse_env_value(name: &str, raw: &str, kind: EnvKind) -> Result<toml::Value> {
    let bad = |what: &str| {
        FahrplanError::ImproperlyConfigured(format!("{name}={raw:?} is not a valid {what}"))
    };
    let raw = raw.trim();
    Ok(match kind {
        EnvKind::Str => toml::Value::String(raw.to_string()),
        EnvKind::Int => toml::Value::Integer(raw.parse().map_err(|_| bad("integer"))?),
        EnvKind::Float => toml::Value::Float(raw.parse().map_err(|_| bad("number"))?),
        EnvKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => toml::Value::Boolean(true),
            "0" | "false" | "no" | "off" => toml::Value::Boolean(false),
            _ => return Err(bad("boolean")),
        },
        EnvKind::List => toml::Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        ),
    })
}

// ── Convenience constructors ────────────────────────────────────────

impl Config {
    /// Parse config from a TOML string, with environment overrides below it.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        ConfigBuilder::new().source_toml(toml_str)?.build()
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        ConfigBuilder::new().source_file(path)?.build()
    }

    /// Defaults plus environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        ConfigBuilder::new().build()
    }

    /// Exchange used when neither the route nor the task names one.
    pub fn default_exchange(&self) -> &str {
        self.task_default_exchange
            .as_deref()
            .unwrap_or(&self.task_default_queue)
    }

    pub fn default_routing_key(&self) -> &str {
        self.task_default_routing_key
            .as_deref()
            .unwrap_or(&self.task_default_queue)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.broker_connection_timeout.max(0.0))
    }

    pub fn beat_sync_interval(&self) -> Duration {
        Duration::from_secs_f64(self.beat_sync_interval.max(0.0))
    }

    pub fn beat_max_loop_interval(&self) -> Duration {
        Duration::from_secs_f64(self.beat_max_loop_interval.max(0.0))
    }

    /// Broker URL with any password replaced by `***`.
    pub fn redacted_broker_url(&self) -> String {
        redact_url(&self.broker_url)
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        info!("Config loaded:");
        info!("  broker:     url={}, pool_limit={}", self.redacted_broker_url(), self.broker_pool_limit);
        info!("  serializer: {} (accept: {})", self.task_serializer, self.accept_content.join(","));
        info!("  routing:    queue={}, exchange={}", self.task_default_queue, self.default_exchange());
        info!("  results:    backend={}", self.result_backend.as_deref().unwrap_or("(disabled)"));
        info!("  time:       timezone={}, utc={}", self.timezone, self.enable_utc);
        info!("  beat:       entries={}, file={}", self.beat_schedule.len(), self.beat_schedule_filename);
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((userinfo, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}

#[cfg(test)]
pub(super) fn redact(url: &str) -> String {
    redact_url(url)
}
