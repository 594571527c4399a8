use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::CredentialPool;

/// The persisted configuration record shared by the settings surface and the
/// orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub credential_list: Vec<String>,
    pub credential_file_label: Option<String>,
    pub selected_model: Option<String>,
    pub last_used_index: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            credential_list: Vec::new(),
            credential_file_label: None,
            selected_model: None,
            last_used_index: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("no credentials have been imported")]
    NoCredentials,
    #[error("no generation model has been selected")]
    NoModel,
}

/// Settings validated for one generation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySettings {
    pub pool: CredentialPool,
    pub model: String,
    pub last_used_index: i64,
}

impl Settings {
    pub fn require(&self) -> Result<ReadySettings, SettingsError> {
        if self.credential_list.is_empty() {
            return Err(SettingsError::NoCredentials);
        }
        let model = self
            .selected_model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SettingsError::NoModel)?;
        Ok(ReadySettings {
            pool: CredentialPool::new(self.credential_list.clone()),
            model: model.to_string(),
            last_used_index: self.last_used_index,
        })
    }

    /// Replaces the credential list wholesale and restarts rotation.
    pub fn import_credentials(&mut self, label: &str, keys: Vec<String>, model: &str) {
        self.credential_list = keys;
        self.credential_file_label = Some(label.to_string());
        self.selected_model = Some(model.to_string());
        self.last_used_index = -1;
    }

    /// Changes only the model; a key list must already be present.
    pub fn select_model(&mut self, model: &str) -> Result<(), SettingsError> {
        if self.credential_list.is_empty() {
            return Err(SettingsError::NoCredentials);
        }
        self.selected_model = Some(model.to_string());
        Ok(())
    }
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Settings>;
    fn save(&self, settings: &Settings) -> anyhow::Result<()>;
    /// Rewrites only the rotation cursor.
    fn record_cursor(&self, index: i64) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> anyhow::Result<Settings> {
        read_settings(&self.path)
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("settings store lock poisoned"))?;
        write_settings(&self.path, settings)
    }

    fn record_cursor(&self, index: i64) -> anyhow::Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("settings store lock poisoned"))?;
        let mut on_disk = read_settings(&self.path)?;
        on_disk.last_used_index = index;
        write_settings(&self.path, &on_disk)
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> anyhow::Result<Settings> {
        self.settings
            .lock()
            .map(|settings| settings.clone())
            .map_err(|_| anyhow::anyhow!("settings store lock poisoned"))
    }

    fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("settings store lock poisoned"))?;
        *guard = settings.clone();
        Ok(())
    }

    fn record_cursor(&self, index: i64) -> anyhow::Result<()> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| anyhow::anyhow!("settings store lock poisoned"))?;
        guard.last_used_index = index;
        Ok(())
    }
}

fn read_settings(path: &Path) -> anyhow::Result<Settings> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_json::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
}

/// Writes through a sibling temp file and renames it into place, so a crash
/// leaves either the old record or the new one.
fn write_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)
        .with_context(|| format!("failed creating {}", tmp_path.display()))?;
    file.write_all(serde_json::to_string_pretty(settings)?.as_bytes())
        .with_context(|| format!("failed writing {}", tmp_path.display()))?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}
