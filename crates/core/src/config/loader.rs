use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::errors::{OmniqError, OmniqResult};

use super::models::AppConfig;

impl AppConfig {
    /// Loads configuration from a TOML file with `OMNIQ_*` environment
    /// overrides (e.g. `OMNIQ_QUEUE__BROKER_URL`). When no file is given or
    /// found, built-in defaults apply.
    pub fn load(config_path: Option<&str>) -> OmniqResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(OmniqError::config(format!(
                    "configuration file does not exist: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            for candidate in ["config/omniq.toml", "omniq.toml", "/etc/omniq/config.toml"] {
                if Path::new(candidate).exists() {
                    builder = builder.add_source(File::new(candidate, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("OMNIQ")
                .separator("__")
                .try_parsing(true),
        );

        let defaults = serde_json::to_value(AppConfig::default())
            .map_err(|e| OmniqError::config(format!("failed to encode defaults: {e}")))?;
        let builder = apply_defaults(builder, "", &defaults)?;

        let config = builder
            .build()
            .map_err(|e| OmniqError::config(format!("failed to build configuration: {e}")))?;

        let app: AppConfig = config
            .try_deserialize()
            .map_err(|e| OmniqError::config(format!("invalid configuration: {e}")))?;

        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> OmniqResult<()> {
        if self.worker.global_ceiling == 0 {
            return Err(OmniqError::config("worker.global_ceiling must be positive"));
        }
        if self.queue.max_payload_bytes == 0 || self.queue.max_total_bytes == 0 {
            return Err(OmniqError::config("queue quota limits must be positive"));
        }
        if self.queue.max_payload_bytes > self.queue.max_total_bytes {
            return Err(OmniqError::config(
                "queue.max_payload_bytes cannot exceed queue.max_total_bytes",
            ));
        }
        if let Some(url) = &self.queue.broker_url {
            if !url.is_empty() && !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(OmniqError::config(format!(
                    "queue.broker_url must start with redis:// or rediss://, got: {url}"
                )));
            }
        }
        if !matches!(
            self.orchestrator.strategy.as_str(),
            "cost" | "balanced" | "performance"
        ) {
            return Err(OmniqError::config(format!(
                "unknown orchestrator.strategy: {} (expected cost, balanced or performance)",
                self.orchestrator.strategy
            )));
        }
        if self.orchestrator.max_step_per_cycle == 0 {
            return Err(OmniqError::config(
                "orchestrator.max_step_per_cycle must be at least 1",
            ));
        }
        if self.orchestrator.tasks_per_worker_hour == 0 {
            return Err(OmniqError::config(
                "orchestrator.tasks_per_worker_hour must be positive",
            ));
        }
        for kind in &self.task_kinds {
            if kind.kind.is_empty() {
                return Err(OmniqError::config("task kind name cannot be empty"));
            }
            if kind.max_attempts == 0 {
                return Err(OmniqError::config(format!(
                    "task kind {} must allow at least one attempt",
                    kind.kind
                )));
            }
        }
        Ok(())
    }
}

/// Flattens the serialized default config into `set_default` calls so a
/// partial TOML file only needs to mention what it changes.
fn apply_defaults(
    mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    prefix: &str,
    value: &serde_json::Value,
) -> OmniqResult<config::ConfigBuilder<config::builder::DefaultState>> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                builder = apply_defaults(builder, &path, nested)?;
            }
            Ok(builder)
        }
        serde_json::Value::Null => Ok(builder),
        serde_json::Value::Bool(b) => builder
            .set_default(prefix, *b)
            .map_err(|e| OmniqError::config(e.to_string())),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                builder
                    .set_default(prefix, i)
                    .map_err(|e| OmniqError::config(e.to_string()))
            } else {
                builder
                    .set_default(prefix, n.as_f64().unwrap_or(0.0))
                    .map_err(|e| OmniqError::config(e.to_string()))
            }
        }
        serde_json::Value::String(s) => builder
            .set_default(prefix, s.as_str())
            .map_err(|e| OmniqError::config(e.to_string())),
        serde_json::Value::Array(_) => {
            // arrays (task_kinds) default to empty via serde
            Ok(builder)
        }
    }
}
