use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use primary::{PowerSettings, SettingsError, SettingsStore};

/// Keeps [`PowerSettings`] in a TOML file next to the service config.
#[derive(Debug, Clone)]
pub struct TomlSettingsStore {
    path: PathBuf,
}

impl TomlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings saved by a previous run, or `None` when nothing was saved yet.
    pub fn load(&self) -> Result<Option<PowerSettings>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read settings file {}", self.path.display()))
            }
        };
        let settings = toml::from_str(&content)
            .with_context(|| format!("parse settings file {}", self.path.display()))?;
        Ok(Some(settings))
    }

    fn write_error(&self, source: io::Error) -> SettingsError {
        SettingsError::Write {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl SettingsStore for TomlSettingsStore {
    fn save(&self, settings: &PowerSettings) -> Result<(), SettingsError> {
        let content =
            toml::to_string(settings).map_err(|err| SettingsError::Encode(err.to_string()))?;

        // Write-then-rename keeps the previous file intact if the write fails.
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(|err| self.write_error(err))?;
        fs::rename(&tmp, &self.path).map_err(|err| self.write_error(err))?;

        debug!(path = %self.path.display(), "power settings saved");
        Ok(())
    }
}
