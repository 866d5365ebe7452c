//! Local configuration: the flat key/value file the stream engine reads at
//! startup and reloads before each new receive (§4.4 step 3), plus the
//! separate, liberally-parsed storage-directory file the UI layer persists.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or saving [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read or write the config file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file content did not parse as `key = value` pairs, or carried an
    /// unrecognized key.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A recognized key held a value outside its valid range.
    #[error("value out of range for {key}: {value}")]
    OutOfRange {
        /// The offending key, as written in the file.
        key: &'static str,
        /// The offending value, stringified for the error message.
        value: String,
    },
}

/// The RDMA engine's local configuration record (§6).
///
/// Parsing is a pure function of file contents: loading a file produced by
/// [`Config::save_atomic`] reproduces the same record (§8 round-trip
/// invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Which GID table entry to use.
    #[serde(rename = "RdmaGidIndex")]
    pub rdma_gid_index: u32,
    /// Server bind port.
    #[serde(rename = "ListenPort")]
    pub listen_port: u16,
    /// Admission cap for concurrent clients.
    #[serde(rename = "MaxThreadNum")]
    pub max_thread_num: u16,
    /// Advisory send rate; informational only, never read by the core.
    #[serde(rename = "DefaultRate")]
    pub default_rate: f64,
    /// Slot size in KiB.
    #[serde(rename = "BlockSize")]
    pub block_size_kib: u32,
    /// Slots per connection.
    #[serde(rename = "BlockNum")]
    pub block_num: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rdma_gid_index: 0,
            listen_port: 18515,
            max_thread_num: 16,
            default_rate: 100.0,
            block_size_kib: 64,
            block_num: 16,
        }
    }
}

impl Config {
    /// Loads the configuration from `path`.
    ///
    /// If the file is missing, writes the current in-memory defaults to
    /// `path` atomically and returns them; any other failure to read,
    /// parse, or validate the file is returned as-is.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_atomic(path)?;
                return Ok(config);
            }
            Err(err) => return Err(err.into()),
        };
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its documented valid range (§6).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=65535).contains(&self.listen_port) {
            return Err(ConfigError::OutOfRange {
                key: "ListenPort",
                value: self.listen_port.to_string(),
            });
        }
        if !(1..=1024).contains(&self.max_thread_num) {
            return Err(ConfigError::OutOfRange {
                key: "MaxThreadNum",
                value: self.max_thread_num.to_string(),
            });
        }
        if !(self.default_rate > 0.0) {
            return Err(ConfigError::OutOfRange {
                key: "DefaultRate",
                value: self.default_rate.to_string(),
            });
        }
        if !(4..=1_048_576).contains(&self.block_size_kib) {
            return Err(ConfigError::OutOfRange {
                key: "BlockSize",
                value: self.block_size_kib.to_string(),
            });
        }
        if !(1..=65536).contains(&self.block_num) {
            return Err(ConfigError::OutOfRange {
                key: "BlockNum",
                value: self.block_num.to_string(),
            });
        }
        Ok(())
    }

    /// Slot size in bytes, derived from [`Config::block_size_kib`].
    #[must_use]
    pub fn block_size_bytes(&self) -> usize {
        self.block_size_kib as usize * 1024
    }

    /// Writes `self` to `path` as a temp file followed by a rename, so a
    /// reader never observes a partially-written config.
    pub fn save_atomic(&self, path: &Path) -> Result<(), ConfigError> {
        let body = toml::to_string_pretty(self).expect("Config always serializes");
        write_atomic(path, body.as_bytes())?;
        Ok(())
    }
}

/// Writes `bytes` to `path` via a sibling temp file and an atomic rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)
}

/// The persisted UI settings this crate reads: just the storage directory
/// (§6). Parsed liberally — anything that isn't a clean `storage_path=`
/// line is ignored rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    /// Destination directory for received files.
    pub storage_path: PathBuf,
}

impl StorageSettings {
    /// Loads the storage directory from `path`.
    ///
    /// Falls back to the host's default documents directory (writing it
    /// back to `path`) when the file is absent, unreadable, or carries no
    /// valid `storage_path=` line.
    pub fn load(path: &Path) -> Self {
        let parsed = fs::read_to_string(path).ok().and_then(|content| {
            content.lines().find_map(|line| {
                let line = line.trim();
                line.strip_prefix("storage_path=")
                    .map(|value| PathBuf::from(value.trim()))
            })
        });

        let storage_path = parsed.unwrap_or_else(default_storage_dir);
        let settings = Self { storage_path };
        let _ = settings.save(path);
        settings
    }

    fn save(&self, path: &Path) -> io::Result<()> {
        let body = format!("storage_path={}\n", self.storage_path.display());
        write_atomic(path, body.as_bytes())
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::document_dir().unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_valid_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config {
            rdma_gid_index: 3,
            listen_port: 9000,
            max_thread_num: 8,
            default_rate: 1.5,
            block_size_kib: 64,
            block_num: 16,
        };
        config.save_atomic(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn rejects_block_size_below_floor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "RdmaGidIndex = 0\nListenPort = 18515\nMaxThreadNum = 16\nDefaultRate = 1.0\nBlockSize = 2\nBlockNum = 16\n",
        )
        .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: "BlockSize", .. }));
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "NotAKey = 1\n").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn storage_settings_falls_back_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.txt");

        let settings = StorageSettings::load(&path);
        assert_eq!(settings.storage_path, default_storage_dir());
        assert!(path.exists());
    }

    #[test]
    fn storage_settings_parses_liberally() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.txt");
        fs::write(&path, "# comment\nstorage_path=/tmp/incoming\nextra garbage\n").unwrap();

        let settings = StorageSettings::load(&path);
        assert_eq!(settings.storage_path, PathBuf::from("/tmp/incoming"));
    }
}
