use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("settings.luks_device must name the encrypted volume")]
    MissingVolume,
    #[error("nothing to back up: configure archive directories or rsync directories")]
    NothingToBackUp,
    #[error("remote transfer requested but settings.remote is not configured")]
    MissingRemote,
}

/// Immutable run configuration, loaded once at startup and passed to every
/// component. Mirrors the on-disk JSON shape: a `settings` block and a
/// `dirs` block.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    pub settings: Settings,
    pub dirs: Dirs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Host identity, used in archive file names.
    pub computer: String,
    /// User that produced artifacts are handed over to.
    pub user: String,
    /// Staging area for archives before they are transferred.
    pub tmp_path: PathBuf,
    /// Backup directory name under the mounted volume.
    pub backup_dir_name: String,
    /// Block device holding the LUKS volume.
    pub luks_device: PathBuf,
    /// Name for the decrypted device mapping under /dev/mapper.
    pub mapper_name: String,
    /// Where the decrypted volume gets mounted.
    pub mount_point: PathBuf,
    #[serde(default)]
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    pub host: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dirs {
    /// Directories bundled into the main archive.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// System configuration directories bundled into a separate archive.
    #[serde(default)]
    pub root_directories: Vec<PathBuf>,
    /// Paths excluded from archiving (and from the size probe).
    #[serde(default)]
    pub directories_excl: Vec<PathBuf>,
    /// Directories mirrored onto the volume with delete-aware rsync.
    #[serde(default)]
    pub rsync_directories: Vec<PathBuf>,
}

impl BackupConfig {
    /// Load the JSON configuration file, merge `LUKSBAK_`-prefixed
    /// environment overrides, and validate the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: BackupConfig = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("LUKSBAK_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.luks_device.as_os_str().is_empty() {
            return Err(ConfigError::MissingVolume);
        }
        let nothing_to_archive =
            self.dirs.directories.is_empty() && self.dirs.root_directories.is_empty();
        if nothing_to_archive && self.dirs.rsync_directories.is_empty() {
            return Err(ConfigError::NothingToBackUp);
        }
        Ok(())
    }

    /// Remote endpoint, required only when a remote mode runs.
    pub fn remote(&self) -> Result<&RemoteSettings, ConfigError> {
        self.settings.remote.as_ref().ok_or(ConfigError::MissingRemote)
    }

    /// Backup directory under the mounted volume; destination for both the
    /// local archive copy and the mirrored directories.
    pub fn backup_dir(&self) -> PathBuf {
        self.settings.mount_point.join(&self.settings.backup_dir_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_config(value: serde_json::Value) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        std::fs::write(file.path(), value.to_string()).unwrap();
        file
    }

    fn base_config() -> serde_json::Value {
        json!({
            "settings": {
                "computer": "workstation",
                "user": "oscar",
                "tmp_path": "/tmp",
                "backup_dir_name": "backups",
                "luks_device": "/dev/sdb1",
                "mapper_name": "backup_vault",
                "mount_point": "/mnt/backup_vault"
            },
            "dirs": {
                "directories": ["/home/oscar"],
                "rsync_directories": ["/home/oscar/music"]
            }
        })
    }

    #[test]
    fn loads_minimal_config() {
        let file = write_config(base_config());
        let config = BackupConfig::load(file.path()).unwrap();
        assert_eq!(config.settings.computer, "workstation");
        assert_eq!(config.dirs.directories, vec![PathBuf::from("/home/oscar")]);
        assert!(config.dirs.root_directories.is_empty());
        assert!(config.settings.remote.is_none());
        assert_eq!(
            config.backup_dir(),
            PathBuf::from("/mnt/backup_vault/backups")
        );
    }

    #[test]
    fn loads_remote_settings() {
        let mut value = base_config();
        value["settings"]["remote"] =
            json!({"host": "user@backup.example.org", "path": "/srv/drop"});
        let file = write_config(value);
        let config = BackupConfig::load(file.path()).unwrap();
        let remote = config.remote().unwrap();
        assert_eq!(remote.host, "user@backup.example.org");
    }

    #[test]
    fn rejects_empty_volume_identifier() {
        let mut value = base_config();
        value["settings"]["luks_device"] = json!("");
        let file = write_config(value);
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVolume));
    }

    #[test]
    fn rejects_config_with_no_directories() {
        let mut value = base_config();
        value["dirs"] = json!({});
        let file = write_config(value);
        let err = BackupConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NothingToBackUp));
    }

    #[test]
    fn mirror_only_config_is_valid() {
        let mut value = base_config();
        value["dirs"] = json!({"rsync_directories": ["/home/oscar/music"]});
        let file = write_config(value);
        assert!(BackupConfig::load(file.path()).is_ok());
    }

    #[test]
    fn remote_is_required_lazily() {
        let file = write_config(base_config());
        let config = BackupConfig::load(file.path()).unwrap();
        assert!(matches!(
            config.remote().unwrap_err(),
            ConfigError::MissingRemote
        ));
    }
}
