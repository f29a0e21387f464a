use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    script_location: Option<PathBuf>,
    database: Option<PathBuf>,
}

/// Where the scripts live and which database the engine drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub script_location: PathBuf,
    pub database: PathBuf,
}

impl Settings {
    /// Resolve settings from the YAML file at `config_path`, with command-line
    /// overrides taking precedence.
    ///
    /// The file is only read when an override is missing. Relative paths in
    /// the file resolve against the file's directory.
    ///
    /// # Errors
    /// Returns an error when the file is needed but cannot be read or parsed,
    /// or when a setting is provided by neither source.
    pub fn resolve(
        config_path: &Path,
        script_location: Option<PathBuf>,
        database: Option<PathBuf>,
    ) -> Result<Self> {
        let file = match (&script_location, &database) {
            (Some(_), Some(_)) => ConfigFile::default(),
            _ => load_file(config_path)?,
        };
        let base = config_path.parent().unwrap_or_else(|| Path::new(""));
        let from_file = |value: Option<PathBuf>| value.map(|path| base.join(path));

        let script_location = script_location
            .or_else(|| from_file(file.script_location))
            .ok_or_else(|| missing_setting("script_location", config_path))?;
        let database = database
            .or_else(|| from_file(file.database))
            .ok_or_else(|| missing_setting("database", config_path))?;

        tracing::debug!(
            "Resolved settings: script_location={}, database={}",
            script_location.display(),
            database.display()
        );
        Ok(Self { script_location, database })
    }
}

fn load_file(path: &Path) -> Result<ConfigFile> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    if body.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn missing_setting(key: &str, config_path: &Path) -> anyhow::Error {
    anyhow!(
        "`{key}` is not set in {} and was not given on the command line",
        config_path.display()
    )
}
