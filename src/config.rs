// Configuration for the vpf-730 daemon
//
// Configuration is resolved from one of three sources, checked in order:
// 1. CLI flags, when --serial-port is given (API key from the environment)
// 2. An .ini config file, when -c/--config is given
// 3. Environment variables (VPF730_*)

use crate::cli::Cli;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Section of the .ini file holding the daemon configuration
const INI_SECTION: &str = "vpf_730";

/// Fatal configuration problems, reported before anything starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {} has no [{}] section", .path.display(), INI_SECTION)]
    MissingSection { path: PathBuf },

    #[error("missing required key {key:?} in [{}] section of {}", INI_SECTION, .path.display())]
    MissingKey { key: &'static str, path: PathBuf },

    #[error("--endpoint is required when configuring from the command line")]
    MissingEndpoint,
}

/// Runtime configuration shared with every task handler
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to the local measurements database
    pub local_db: PathBuf,
    /// Path to the queue database
    pub queue_db: PathBuf,
    /// Serial port the sensor is connected to, e.g. /dev/ttyS0
    pub serial_port: String,
    /// HTTP endpoint measurements are posted to
    pub endpoint: String,
    /// API key sent in the Authorization header
    pub api_key: String,
}

// Manual Debug so the API key can never leak into logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("local_db", &self.local_db)
            .field("queue_db", &self.queue_db)
            .field("serial_port", &self.serial_port)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***")
            .finish()
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

/// Parse the key/value pairs of one `[section]` of an .ini file.
///
/// Returns `None` when the section is absent. Lines starting with `;` or `#`
/// are comments. This is the whole grammar the config file needs; no example
/// in the corpus carries an INI crate.
fn parse_ini_section(contents: &str, section: &str) -> Option<HashMap<String, String>> {
    let mut found = false;
    let mut in_section = false;
    let mut values = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_section = name.trim() == section;
            found |= in_section;
            continue;
        }
        if in_section {
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    found.then_some(values)
}

impl Config {
    /// Load all fields from the VPF730_* environment variables
    pub fn from_env() -> Result<Config, ConfigError> {
        Ok(Config {
            local_db: PathBuf::from(env_var("VPF730_LOCAL_DB")?),
            queue_db: PathBuf::from(env_var("VPF730_QUEUE_DB")?),
            serial_port: env_var("VPF730_PORT")?,
            endpoint: env_var("VPF730_ENDPOINT")?,
            api_key: env_var("VPF730_API_KEY")?,
        })
    }

    /// Load all fields from the `[vpf_730]` section of an .ini file
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let section = parse_ini_section(&contents, INI_SECTION).ok_or_else(|| {
            ConfigError::MissingSection {
                path: path.to_path_buf(),
            }
        })?;
        let get = |key: &'static str| {
            section.get(key).cloned().ok_or(ConfigError::MissingKey {
                key,
                path: path.to_path_buf(),
            })
        };
        Ok(Config {
            local_db: PathBuf::from(get("local_db")?),
            queue_db: PathBuf::from(get("queue_db")?),
            serial_port: get("serial_port")?,
            endpoint: get("endpoint")?,
            api_key: get("api_key")?,
        })
    }

    /// Build from CLI flags; the API key always comes from the environment.
    ///
    /// Database paths default to the user's home directory when not given.
    pub fn from_cli(cli: &Cli, serial_port: &str) -> Result<Config, ConfigError> {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Ok(Config {
            local_db: cli
                .local_db
                .clone()
                .unwrap_or_else(|| home.join("vpf_730_local.db")),
            queue_db: cli
                .queue_db
                .clone()
                .unwrap_or_else(|| home.join("vpf_730_queue.db")),
            serial_port: serial_port.to_string(),
            endpoint: cli.endpoint.clone().ok_or(ConfigError::MissingEndpoint)?,
            api_key: env_var("VPF730_API_KEY")?,
        })
    }

    /// Resolve the effective configuration: CLI > file > environment
    pub fn resolve(cli: &Cli) -> Result<Config, ConfigError> {
        if let Some(serial_port) = &cli.serial_port {
            Config::from_cli(cli, serial_port)
        } else if let Some(path) = &cli.config {
            Config::from_file(path)
        } else {
            Config::from_env()
        }
    }
}

/// Fixed configuration used as a fixture across the test suite
#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        local_db: PathBuf::from("local.db"),
        queue_db: PathBuf::from("queue.db"),
        serial_port: "/dev/ttyS0".to_string(),
        endpoint: "https://example.com".to_string(),
        api_key: "deadbeef".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // tests touching process environment variables must not interleave
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "VPF730_LOCAL_DB",
            "VPF730_QUEUE_DB",
            "VPF730_PORT",
            "VPF730_ENDPOINT",
            "VPF730_API_KEY",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("VPF730_LOCAL_DB", "local.db");
        std::env::set_var("VPF730_QUEUE_DB", "queue.db");
        std::env::set_var("VPF730_PORT", "/dev/ttyS0");
        std::env::set_var("VPF730_ENDPOINT", "https://example.com");
        std::env::set_var("VPF730_API_KEY", "deadbeef");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg, test_config());
        clear_env();
    }

    #[test]
    fn test_config_from_env_missing_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("VPF730_LOCAL_DB")));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(
            &path,
            "[vpf_730]\n\
             local_db=local.db\n\
             queue_db=queue.db\n\
             serial_port=/dev/ttyS0\n\
             endpoint=https://example.com\n\
             api_key=deadbeef\n",
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg, test_config());
    }

    #[test]
    fn test_config_from_file_ignores_other_sections_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(
            &path,
            "; a comment\n\
             [other]\n\
             local_db=wrong.db\n\
             [vpf_730]\n\
             # another comment\n\
             local_db=local.db\n\
             queue_db=queue.db\n\
             serial_port=/dev/ttyS0\n\
             endpoint=https://example.com\n\
             api_key=deadbeef\n",
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg, test_config());
    }

    #[test]
    fn test_config_from_file_missing_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[other]\nlocal_db=local.db\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection { .. }));
    }

    #[test]
    fn test_config_from_file_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[vpf_730]\nlocal_db=local.db\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "queue_db",
                ..
            }
        ));
    }

    #[test]
    fn test_config_from_cli() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("VPF730_API_KEY", "deadbeef");

        let cli = Cli {
            local_db: Some(PathBuf::from("local.db")),
            queue_db: Some(PathBuf::from("queue.db")),
            serial_port: Some("/dev/ttyS0".to_string()),
            endpoint: Some("https://example.com".to_string()),
            config: None,
        };
        let cfg = Config::resolve(&cli).unwrap();
        assert_eq!(cfg, test_config());
        clear_env();
    }

    #[test]
    fn test_config_from_cli_requires_endpoint() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("VPF730_API_KEY", "deadbeef");

        let cli = Cli {
            local_db: None,
            queue_db: None,
            serial_port: Some("/dev/ttyS0".to_string()),
            endpoint: None,
            config: None,
        };
        let err = Config::resolve(&cli).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoint));
        clear_env();
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let cfg = test_config();
        let rendered = format!("{cfg:?}");
        assert!(rendered.contains("api_key: \"***\""), "{rendered}");
        assert!(!rendered.contains("deadbeef"), "{rendered}");
    }
}
