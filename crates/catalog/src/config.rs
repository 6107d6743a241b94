use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::CatalogPaths;

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_ROOT: &str = "consolidated_music";
const DEFAULT_METADATA_DIR: &str = "metadata";
const DEFAULT_SONGS_DIR: &str = "songs";
const DEFAULT_CHECKPOINT_INTERVAL: usize = 10;

fn default_media_extensions() -> Vec<String> {
    ["mp3", "m4a", "flac", "wav", "ogg"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub version: u32,
    /// Library root; relative values resolve against the config file's folder.
    pub root: String,
    pub metadata_dir: String,
    pub songs_dir: String,
    /// Descriptors (or downloads) between incremental saves.
    pub checkpoint_interval: usize,
    pub snapshot_on_destructive: bool,
    pub media_extensions: Vec<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            root: DEFAULT_ROOT.to_string(),
            metadata_dir: DEFAULT_METADATA_DIR.to_string(),
            songs_dir: DEFAULT_SONGS_DIR.to_string(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            snapshot_on_destructive: true,
            media_extensions: default_media_extensions(),
        }
    }
}

impl CatalogConfig {
    /// Store and media locations for a config loaded from `config_path`.
    pub fn paths(&self, config_path: &Path) -> CatalogPaths {
        let root = resolve_path(config_path, self.root.trim());
        CatalogPaths::new(
            join_under(&root, self.metadata_dir.trim()),
            join_under(&root, self.songs_dir.trim()),
        )
    }

    fn repair(&mut self) {
        if self.version < CONFIG_VERSION {
            self.version = CONFIG_VERSION;
        }
        if self.root.trim().is_empty() {
            self.root = DEFAULT_ROOT.to_string();
        }
        if self.metadata_dir.trim().is_empty() {
            self.metadata_dir = DEFAULT_METADATA_DIR.to_string();
        }
        if self.songs_dir.trim().is_empty() {
            self.songs_dir = DEFAULT_SONGS_DIR.to_string();
        }
        if self.checkpoint_interval == 0 {
            self.checkpoint_interval = DEFAULT_CHECKPOINT_INTERVAL;
        }
        self.media_extensions = self
            .media_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.media_extensions.is_empty() {
            self.media_extensions = default_media_extensions();
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file: {}", err),
            ConfigError::Yaml(err) => write!(f, "config is not valid yaml: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Yaml(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("PLAYLIST_CATALOG_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_dir() {
        Ok(dir) => dir.join("catalog.yaml"),
        Err(_) => PathBuf::from("catalog.yaml"),
    }
}

/// Reads the config at `path`, writing defaults there first when it is missing.
/// The flag is true when the file was created.
pub fn load_or_create_config(path: &Path) -> Result<(CatalogConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: CatalogConfig = if contents.trim().is_empty() {
            CatalogConfig::default()
        } else {
            serde_yaml::from_str(&contents)?
        };
        config.repair();
        return Ok((config, false));
    }

    let config = CatalogConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &CatalogConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

fn join_under(root: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        raw
    } else {
        root.join(raw)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn invalid_yaml_reports_its_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        fs::write(&path, "checkpoint_interval: [unclosed").unwrap();
        let err = load_or_create_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("config is not valid yaml"));
    }

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("catalog.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.media_extensions.len(), 5);

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again.root, "consolidated_music");
    }

    #[test]
    fn zero_and_blank_values_are_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        fs::write(
            &path,
            "version: 0\nroot: ''\ncheckpoint_interval: 0\nmedia_extensions: [' .MP3 ', '']\n",
        )
        .unwrap();
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.root, "consolidated_music");
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.media_extensions, vec!["mp3".to_string()]);
    }

    #[test]
    fn paths_resolve_against_config_folder() {
        let config = CatalogConfig {
            root: "library".into(),
            ..CatalogConfig::default()
        };
        let paths = config.paths(Path::new("/srv/catalog/catalog.yaml"));
        assert_eq!(
            paths.metadata_dir,
            PathBuf::from("/srv/catalog/library/metadata")
        );
        assert_eq!(paths.songs_dir, PathBuf::from("/srv/catalog/library/songs"));

        let absolute = CatalogConfig {
            songs_dir: "/mnt/media".into(),
            ..CatalogConfig::default()
        };
        let paths = absolute.paths(Path::new("catalog.yaml"));
        assert_eq!(paths.songs_dir, PathBuf::from("/mnt/media"));
        assert_eq!(
            paths.metadata_dir,
            PathBuf::from("./consolidated_music/metadata")
        );
    }
}
