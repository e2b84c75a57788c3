use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{OmniqError, OmniqResult};

pub const PRIORITY_CLASSES: [&str; 4] = ["urgent", "high", "medium", "low"];

/// Per-tenant channel record, one YAML file per channel. Consumed once at
/// startup and on explicit reload; the queue, pool and orchestrator never
/// touch the files themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub tenant_id: String,
    pub channel_name: String,
    pub enabled_platforms: Vec<String>,
    pub min_workers: u32,
    pub max_workers: u32,
    /// Priority class the tenant's execution units are bound to.
    #[serde(default = "default_priority_class")]
    pub priority_class: String,
    /// Opaque rule set handed to the compliance collaborator.
    #[serde(default)]
    pub compliance_rules: serde_json::Value,
}

fn default_priority_class() -> String {
    "medium".to_string()
}

impl ChannelConfig {
    pub fn validate(&self) -> OmniqResult<()> {
        if self.tenant_id.is_empty() {
            return Err(OmniqError::config("channel tenant_id cannot be empty"));
        }
        if self.enabled_platforms.is_empty() {
            return Err(OmniqError::config(format!(
                "channel {} must enable at least one platform",
                self.tenant_id
            )));
        }
        if self.max_workers == 0 {
            return Err(OmniqError::config(format!(
                "channel {}: max_workers must be positive",
                self.tenant_id
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(OmniqError::config(format!(
                "channel {}: min_workers ({}) exceeds max_workers ({})",
                self.tenant_id, self.min_workers, self.max_workers
            )));
        }
        if !PRIORITY_CLASSES.contains(&self.priority_class.as_str()) {
            return Err(OmniqError::config(format!(
                "channel {}: unknown priority_class {:?} (expected one of {:?})",
                self.tenant_id, self.priority_class, PRIORITY_CLASSES
            )));
        }
        Ok(())
    }
}

/// Loads and revalidates channel YAML files from a directory.
#[derive(Debug)]
pub struct ChannelConfigStore {
    directory: PathBuf,
    channels: Vec<ChannelConfig>,
}

impl ChannelConfigStore {
    pub fn load(directory: impl AsRef<Path>) -> OmniqResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        let channels = load_channel_dir(&directory)?;
        Ok(Self {
            directory,
            channels,
        })
    }

    /// Explicit reload; replaces the in-memory set only when every file in
    /// the directory parses and validates.
    pub fn reload(&mut self) -> OmniqResult<usize> {
        let channels = load_channel_dir(&self.directory)?;
        let count = channels.len();
        self.channels = channels;
        Ok(count)
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn get(&self, tenant_id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.tenant_id == tenant_id)
    }
}

fn load_channel_dir(directory: &Path) -> OmniqResult<Vec<ChannelConfig>> {
    if !directory.is_dir() {
        return Err(OmniqError::config(format!(
            "channels directory does not exist: {}",
            directory.display()
        )));
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(directory)
        .map_err(|e| OmniqError::config(format!("failed to read channels directory: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    let mut channels = Vec::with_capacity(entries.len());
    for path in entries {
        let channel = load_channel_file(&path)?;
        if channels
            .iter()
            .any(|c: &ChannelConfig| c.tenant_id == channel.tenant_id)
        {
            return Err(OmniqError::config(format!(
                "duplicate tenant_id {:?} in {}",
                channel.tenant_id,
                path.display()
            )));
        }
        channels.push(channel);
    }
    Ok(channels)
}

fn load_channel_file(path: &Path) -> OmniqResult<ChannelConfig> {
    let source = path
        .to_str()
        .ok_or_else(|| OmniqError::config(format!("non-utf8 channel path: {}", path.display())))?;
    let channel: ChannelConfig = ConfigBuilder::builder()
        .add_source(File::new(source, FileFormat::Yaml))
        .build()
        .map_err(|e| OmniqError::config(format!("failed to read {}: {e}", path.display())))?
        .try_deserialize()
        .map_err(|e| OmniqError::config(format!("invalid channel config {}: {e}", path.display())))?;
    channel.validate()?;
    Ok(channel)
}
