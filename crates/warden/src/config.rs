//! Daemon configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields the stock daemon.

use crate::error::{Result, WardenError};
use crate::executor::ExecutorConfig;
use crate::registry::{Identity, ModuleId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the daemon looks for its configuration when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Per-module identity overrides
    #[serde(default)]
    pub identities: HashMap<ModuleId, IdentityOverride>,
    #[serde(default)]
    pub modules: ModulesConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeoutConfig {
    /// Time a worker has to send its message
    #[serde(default = "default_ipc_ms")]
    pub ipc_ms: u64,
    /// Extra time to observe the exit; also the SIGKILL reap budget
    #[serde(default = "default_exit_ms")]
    pub exit_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            ipc_ms: default_ipc_ms(),
            exit_ms: default_exit_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Fields left out keep the module's built-in value. An empty `label`
/// disables labelling for that module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IdentityOverride {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModulesConfig {
    #[serde(default)]
    pub imei: ImeiConfig,
    #[serde(default)]
    pub phone: PhoneConfig,
    #[serde(default)]
    pub mac: MacConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImeiConfig {
    /// `key=value` property files, searched in order
    #[serde(default = "default_property_files")]
    pub property_files: Vec<PathBuf>,
    #[serde(default = "default_imei_key")]
    pub key: String,
}

impl Default for ImeiConfig {
    fn default() -> Self {
        ImeiConfig {
            property_files: default_property_files(),
            key: default_imei_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhoneConfig {
    #[serde(default = "default_prefs_path")]
    pub prefs_path: PathBuf,
    #[serde(default = "default_phone_key")]
    pub key: String,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        PhoneConfig {
            prefs_path: default_prefs_path(),
            key: default_phone_key(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MacConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Root of the network class directory
    #[serde(default = "default_sysfs_net")]
    pub sysfs_net: PathBuf,
}

impl Default for MacConfig {
    fn default() -> Self {
        MacConfig {
            interface: default_interface(),
            sysfs_net: default_sysfs_net(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_log_url")]
    pub log_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            log_url: default_log_url(),
            upload_url: default_upload_url(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_db_table")]
    pub table: String,
    #[serde(default = "default_db_column")]
    pub column: String,
    /// Rows whose `column` equals this value are deleted
    #[serde(default = "default_db_value")]
    pub value: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
            table: default_db_table(),
            column: default_db_column(),
            value: default_db_value(),
        }
    }
}

fn default_ipc_ms() -> u64 {
    2000
}
fn default_exit_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_property_files() -> Vec<PathBuf> {
    ["/system/build.prop", "/vendor/build.prop", "/default.prop"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}
fn default_imei_key() -> String {
    "ro.id.imei".to_string()
}
fn default_prefs_path() -> PathBuf {
    PathBuf::from("/data/local/tmp/prefs.xml")
}
fn default_phone_key() -> String {
    "number".to_string()
}
fn default_interface() -> String {
    "wlan0".to_string()
}
fn default_sysfs_net() -> PathBuf {
    PathBuf::from("/sys/class/net")
}
fn default_log_url() -> String {
    "http://127.0.0.1:8080/log".to_string()
}
fn default_upload_url() -> String {
    "http://127.0.0.1:8080/upload".to_string()
}
fn default_http_timeout_ms() -> u64 {
    5000
}
fn default_db_path() -> PathBuf {
    PathBuf::from("/data/data/com.android.phone/databases/test.db")
}
fn default_db_table() -> String {
    "records".to_string()
}
fn default_db_column() -> String {
    "owner".to_string()
}
fn default_db_value() -> String {
    "warden".to_string()
}

impl WardenConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: WardenConfig =
            toml::from_str(text).map_err(|e| WardenError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, which must exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| WardenError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded configuration from {}", path.display());
        Self::from_toml(&text)
    }

    /// Load an explicitly requested file, or the default location when it
    /// exists, or built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::load(default)
                } else {
                    tracing::debug!("No configuration at {}, using defaults", DEFAULT_CONFIG_PATH);
                    Ok(Self::default())
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.ipc_ms == 0 || t.exit_ms == 0 {
            return Err(WardenError::ConfigInvalid(
                "timeouts.ipc_ms and timeouts.exit_ms must be positive".to_string(),
            ));
        }
        if t.poll_interval_ms == 0 || t.poll_interval_ms > u64::from(u16::MAX) {
            return Err(WardenError::ConfigInvalid(format!(
                "timeouts.poll_interval_ms must be between 1 and {}",
                u16::MAX
            )));
        }
        let db = &self.modules.database;
        for (field, name) in [("table", &db.table), ("column", &db.column)] {
            if !is_identifier(name) {
                return Err(WardenError::ConfigInvalid(format!(
                    "modules.database.{field} '{name}' is not a valid SQL identifier"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            ipc_timeout: Duration::from_millis(self.timeouts.ipc_ms),
            exit_timeout: Duration::from_millis(self.timeouts.exit_ms),
            poll_interval: Duration::from_millis(self.timeouts.poll_interval_ms),
        }
    }

    /// Built-in identity of `module` with any configured override applied.
    #[must_use]
    pub fn identity_for(&self, module: ModuleId) -> Identity {
        let mut identity = module.default_identity();
        if let Some(o) = self.identities.get(&module) {
            if let Some(uid) = o.uid {
                identity.uid = uid;
            }
            if let Some(gid) = o.gid {
                identity.gid = gid;
            }
            if let Some(label) = &o.label {
                identity.label = (!label.is_empty()).then(|| label.clone());
            }
        }
        identity
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config.executor_config(), ExecutorConfig::default());
        assert_eq!(config.modules.imei.key, "ro.id.imei");
        assert_eq!(config.modules.phone.key, "number");
        assert_eq!(
            config.identity_for(ModuleId::Imei),
            ModuleId::Imei.default_identity()
        );
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = WardenConfig::from_toml(
            r#"
            [timeouts]
            ipc_ms = 500

            [modules.mac]
            interface = "eth0"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeouts.ipc_ms, 500);
        assert_eq!(config.timeouts.exit_ms, 1000);
        assert_eq!(config.modules.mac.interface, "eth0");
        assert_eq!(config.modules.mac.sysfs_net, PathBuf::from("/sys/class/net"));
    }

    #[test]
    fn test_identity_override() {
        let config = WardenConfig::from_toml(
            r#"
            [identities.db_cleaner]
            uid = 2001
            label = ""

            [identities.phone]
            label = "u:r:custom:s0"
            "#,
        )
        .unwrap();

        let cleaner = config.identity_for(ModuleId::DbCleaner);
        assert_eq!(cleaner.uid, 2001);
        assert_eq!(cleaner.gid, 1001);
        assert_eq!(cleaner.label, None);

        let phone = config.identity_for(ModuleId::Phone);
        assert_eq!(phone.uid, 1002);
        assert_eq!(phone.label.as_deref(), Some("u:r:custom:s0"));
    }

    #[test]
    fn test_unknown_module_identity_rejected() {
        let result = WardenConfig::from_toml("[identities.bluetooth]\nuid = 1\n");
        assert!(matches!(result, Err(WardenError::ConfigParse(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let result = WardenConfig::from_toml("[timeouts]\npoll_interval_ms = 0\n");
        assert!(matches!(result, Err(WardenError::ConfigInvalid(_))));
    }

    #[test]
    fn test_sql_injection_in_table_rejected() {
        let result =
            WardenConfig::from_toml("[modules.database]\ntable = \"x; DROP TABLE y\"\n");
        assert!(matches!(result, Err(WardenError::ConfigInvalid(_))));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("records"));
        assert!(is_identifier("_tmp2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("a-b"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[modules.network]\ntimeout_ms = 750").unwrap();
        let config = WardenConfig::load(file.path()).unwrap();
        assert_eq!(config.modules.network.timeout_ms, 750);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            WardenConfig::resolve(Some(&missing)),
            Err(WardenError::ConfigRead { .. })
        ));
    }
}
