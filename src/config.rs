//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{EvaluationMode, FailurePolicy, ProcessorOptions, DEFAULT_MAX_CAS_RETRIES};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Processor behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Counter storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rule file location and reloading
    #[serde(default)]
    pub rules: RulesConfig,
}

/// Processor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub evaluation: EvaluationMode,

    /// Deadline for a whole check in milliseconds
    #[serde(default)]
    pub check_timeout_ms: Option<u64>,

    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            evaluation: EvaluationMode::default(),
            check_timeout_ms: None,
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

fn default_max_cas_retries() -> u32 {
    DEFAULT_MAX_CAS_RETRIES
}

/// Which counter store backs the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Mesh,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// How often the memory store sweeps expired counters
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Bound on each mesh store operation in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    #[serde(default)]
    pub mesh: MeshConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sweep_interval_secs: default_sweep_interval(),
            operation_timeout_ms: default_operation_timeout(),
            mesh: MeshConfig::default(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    250
}

/// Gossip cluster settings for the mesh store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Generated when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tollgate".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

/// Rule file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the YAML rule file
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Rule file reload interval in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_reload_interval() -> u64 {
    60
}

impl TollgateConfig {
    /// Load configuration from an optional file, then `TOLLGATE__*`
    /// environment variables, e.g. `TOLLGATE__STORAGE__BACKEND=mesh`.
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<TollgateConfig>())
            .map_err(|e| TollgateError::Configuration(e.to_string()))
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            })
    }

    /// Reject values the service cannot run with. Intervals and timeouts
    /// drive tokio timers, which require a non-zero period.
    pub fn validate(&self) -> Result<()> {
        fn non_zero(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(TollgateError::Configuration(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
            Ok(())
        }

        non_zero("storage.sweep_interval_secs", self.storage.sweep_interval_secs)?;
        non_zero("storage.operation_timeout_ms", self.storage.operation_timeout_ms)?;
        non_zero("storage.mesh.gossip_interval_ms", self.storage.mesh.gossip_interval_ms)?;
        non_zero("rules.reload_interval_secs", self.rules.reload_interval_secs)?;
        non_zero("engine.max_cas_retries", u64::from(self.engine.max_cas_retries))?;
        if let Some(timeout) = self.engine.check_timeout_ms {
            non_zero("engine.check_timeout_ms", timeout)?;
        }
        Ok(())
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            failure_policy: self.engine.failure_policy,
            evaluation: self.engine.evaluation,
            check_timeout: self.engine.check_timeout_ms.map(Duration::from_millis),
            max_cas_retries: self.engine.max_cas_retries,
        }
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        let mesh = &self.storage.mesh;
        let defaults = ClusterConfig::default();

        ClusterConfig {
            node_id: mesh.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: mesh.listen_addr,
            advertise_addr: mesh.advertise_addr.unwrap_or(mesh.listen_addr),
            seed_nodes: mesh.seed_nodes.clone(),
            cluster_id: mesh.cluster_id.clone(),
            gossip_interval: Duration::from_millis(mesh.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.rules.reload_interval_secs, 60);
        assert_eq!(config.processor_options(), ProcessorOptions::default());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
engine:
  failure_policy: fail_open
  evaluation: all_matching
  check_timeout_ms: 50
storage:
  backend: mesh
  mesh:
    listen_addr: 127.0.0.1:7000
    seed_nodes: ["10.0.0.2:7000"]
rules:
  path: /etc/tollgate/rules.yaml
"#;
        let config: TollgateConfig = serde_yaml::from_str(yaml).unwrap();

        let options = config.processor_options();
        assert_eq!(options.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(options.evaluation, EvaluationMode::AllMatching);
        assert_eq!(options.check_timeout, Some(Duration::from_millis(50)));
        assert_eq!(options.max_cas_retries, DEFAULT_MAX_CAS_RETRIES);

        let cluster = config.cluster_config();
        assert_eq!(cluster.listen_addr, SocketAddr::from(([127, 0, 0, 1], 7000)));
        assert_eq!(cluster.advertise_addr, cluster.listen_addr);
        assert_eq!(cluster.seed_nodes, vec!["10.0.0.2:7000".to_string()]);
        assert_eq!(cluster.cluster_id, "tollgate");
        assert_eq!(config.rules.path, Some(PathBuf::from("/etc/tollgate/rules.yaml")));
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "storage:\n  sweep_interval_secs: 5\n").unwrap();
        std::env::set_var("TOLLGATE__ENGINE__MAX_CAS_RETRIES", "7");

        let config = TollgateConfig::load(Some(&path)).unwrap();
        std::env::remove_var("TOLLGATE__ENGINE__MAX_CAS_RETRIES");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.storage.sweep_interval_secs, 5);
        assert_eq!(config.engine.max_cas_retries, 7);
    }

    fn load_yaml(yaml: &str) -> Result<TollgateConfig> {
        let path = std::env::temp_dir().join(format!("tollgate-config-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, yaml).unwrap();
        let result = TollgateConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        result
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = load_yaml("storage:\n  backend: floppy\n").unwrap_err();
        assert!(matches!(err, TollgateError::Configuration(_)));
    }

    #[test]
    fn test_zero_intervals_rejected_at_load() {
        let cases = [
            "storage:\n  sweep_interval_secs: 0\n",
            "rules:\n  reload_interval_secs: 0\n",
            "storage:\n  mesh:\n    gossip_interval_ms: 0\n",
            "storage:\n  operation_timeout_ms: 0\n",
            "engine:\n  check_timeout_ms: 0\n",
        ];

        for yaml in cases {
            match load_yaml(yaml) {
                Err(TollgateError::Configuration(message)) => {
                    assert!(message.contains("must be greater than 0"), "{}", message)
                }
                other => panic!("{:?} should be rejected, got {:?}", yaml, other),
            }
        }

        assert!(load_yaml("storage:\n  sweep_interval_secs: 1\n").is_ok());
    }
}
