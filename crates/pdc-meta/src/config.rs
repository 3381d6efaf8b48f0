//! Server configuration: defaults, JSON file loading and environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::StoreConfig;
use crate::types::MetaError;

/// Environment variable overriding the worker thread count.
pub const NTHREAD_ENV: &str = "PDC_SERVER_NTHREAD";

/// Smallest worker pool the server runs with.
pub const MIN_WORKER_THREADS: usize = 2;

/// Metadata server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Rank of this server within the group
    pub server_id: u32,
    /// Number of servers in the group
    pub num_servers: u32,
    /// Address clients use to reach this server
    pub listen_addr: String,
    /// Directory receiving the address file
    pub tmp_dir: PathBuf,
    /// Name of the address file inside `tmp_dir`
    pub addr_file_name: String,
    /// Number of metadata buckets
    pub table_size: usize,
    /// Keys each bucket's duplicate filter is sized for
    pub filter_capacity: usize,
    /// Target false-positive rate of the duplicate filters
    pub filter_error_rate: f64,
    /// Worker pool size
    pub worker_threads: usize,
    /// Run handlers on the worker pool instead of the progress loop
    pub offload: bool,
    /// Largest partial-query result returned inline
    pub inline_query_limit: usize,
    /// Progress loop wake-up interval
    pub progress_interval_ms: u64,
    /// Width of each server's object id range
    pub id_interval: u64,
    /// Depth of the request queue in front of the progress loop
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            num_servers: 1,
            listen_addr: String::from("local://pdc-server-0"),
            tmp_dir: PathBuf::from("./pdc_tmp"),
            addr_file_name: String::from("server.cfg"),
            table_size: 1024,
            filter_capacity: 4096,
            filter_error_rate: 0.05,
            worker_threads: MIN_WORKER_THREADS,
            offload: true,
            inline_query_limit: 80,
            progress_interval_ms: 100,
            id_interval: 1_000_000_000_000,
            queue_depth: 1024,
        }
    }
}

impl ServerConfig {
    /// Loads a JSON configuration file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "json" => {
                let config: ServerConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Applies `PDC_SERVER_NTHREAD` when it is set.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(NTHREAD_ENV) {
            self.apply_nthreads(&value);
        }
    }

    /// Sets the worker count from its string form. Values below the minimum are raised to it.
    pub fn apply_nthreads(&mut self, value: &str) {
        match value.trim().parse::<i64>() {
            Ok(n) if n > 1 => self.worker_threads = n as usize,
            Ok(_) => self.worker_threads = MIN_WORKER_THREADS,
            Err(_) => tracing::warn!(value, "ignoring unparsable {}", NTHREAD_ENV),
        }
    }

    /// Full path of the address file.
    pub fn addr_file_path(&self) -> PathBuf {
        self.tmp_dir.join(&self.addr_file_name)
    }

    /// Checks the settings are usable.
    pub fn validate(&self) -> Result<(), MetaError> {
        let invalid = |msg: String| Err(MetaError::InvalidRequest(msg));
        if self.table_size == 0 {
            return invalid("table_size must be positive".into());
        }
        if self.worker_threads == 0 {
            return invalid("worker_threads must be positive".into());
        }
        if !(self.filter_error_rate > 0.0 && self.filter_error_rate < 1.0) {
            return invalid(format!(
                "filter_error_rate {} outside (0, 1)",
                self.filter_error_rate
            ));
        }
        if self.num_servers == 0 || self.server_id >= self.num_servers {
            return invalid(format!(
                "server_id {} not below num_servers {}",
                self.server_id, self.num_servers
            ));
        }
        if self.id_interval == 0 {
            return invalid("id_interval must be positive".into());
        }
        Ok(())
    }

    /// Settings for the metadata table.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            table_size: self.table_size,
            filter_capacity: self.filter_capacity,
            filter_error_rate: self.filter_error_rate,
            server_id: self.server_id,
            id_interval: self.id_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.addr_file_name, "server.cfg");
        assert_eq!(config.table_size, 1024);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.inline_query_limit, 80);
        assert_eq!(config.progress_interval_ms, 100);
        assert!(config.offload);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_json_partial() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "server_id": 1,
                "num_servers": 4,
                "table_size": 64,
                "offload": false
            }}"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_id, 1);
        assert_eq!(config.num_servers, 4);
        assert_eq!(config.table_size, 64);
        assert!(!config.offload);
        assert_eq!(config.filter_capacity, 4096);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_nthreads_minimum() {
        let mut config = ServerConfig::default();
        config.apply_nthreads("8");
        assert_eq!(config.worker_threads, 8);
        config.apply_nthreads("1");
        assert_eq!(config.worker_threads, 2);
        config.apply_nthreads("-3");
        assert_eq!(config.worker_threads, 2);
        config.worker_threads = 6;
        config.apply_nthreads("many");
        assert_eq!(config.worker_threads, 6);
    }

    #[test]
    fn test_apply_env() {
        let mut config = ServerConfig::default();
        std::env::set_var(NTHREAD_ENV, "5");
        config.apply_env();
        std::env::remove_var(NTHREAD_ENV);
        assert_eq!(config.worker_threads, 5);

        config.apply_env();
        assert_eq!(config.worker_threads, 5);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = ServerConfig::default();
        config.table_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.filter_error_rate = 1.0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.server_id = 3;
        config.num_servers = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_config() {
        let config = ServerConfig {
            server_id: 2,
            table_size: 7,
            ..Default::default()
        };
        let store = config.store_config();
        assert_eq!(store.server_id, 2);
        assert_eq!(store.table_size, 7);
    }

    #[test]
    fn test_addr_file_path() {
        let config = ServerConfig {
            tmp_dir: PathBuf::from("/tmp/pdc"),
            ..Default::default()
        };
        assert_eq!(config.addr_file_path(), PathBuf::from("/tmp/pdc/server.cfg"));
    }
}
