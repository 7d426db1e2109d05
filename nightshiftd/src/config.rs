use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use machine::{AgentDescriptor, ResourceProfile};
use serde::Deserialize;

pub(crate) const DEFAULT_VCPUS: u32 = 2;
pub(crate) const DEFAULT_MEMORY_MIB: u32 = 2048;
pub(crate) const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 60;
pub(crate) const DEFAULT_EVENT_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {detail}")]
    Read { path: String, detail: String },

    #[error("parse {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    pub firecracker: FirecrackerSection,
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

#[derive(Debug, Deserialize)]
pub struct FirecrackerSection {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub idle_timeout_secs: u64,
    pub default_max_vms: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            default_max_vms: 4,
        }
    }
}

impl PoolSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// One deployed agent, declared in the config file.
#[derive(Debug, Deserialize)]
pub struct AgentSection {
    pub id: String,
    /// Unpacked agent package directory on the host.
    pub module: PathBuf,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_event_port")]
    pub event_port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
    #[serde(default)]
    pub max_concurrent_vms: usize,
    #[serde(default)]
    pub stateful: bool,
}

impl AgentSection {
    pub fn to_descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: self.id.clone(),
            module_location: self.module.clone(),
            resource_profile: ResourceProfile {
                vcpus: self.vcpus,
                memory_mib: self.memory_mib,
                health_timeout: Duration::from_secs(self.health_timeout_secs),
                event_port: self.event_port,
            },
            workspace_source: self.workspace.clone(),
            static_env: self.env.clone(),
            forward_env_names: self.forward_env.clone(),
            max_concurrent_vms: self.max_concurrent_vms,
            stateful: self.stateful,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/nightshift")
}

fn default_vcpus() -> u32 {
    DEFAULT_VCPUS
}

fn default_memory_mib() -> u32 {
    DEFAULT_MEMORY_MIB
}

fn default_health_timeout_secs() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}

fn default_event_port() -> u16 {
    DEFAULT_EVENT_PORT
}

/// Parse a config document.
pub fn parse(path_label: &str, content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml_ng::from_str(content).map_err(|e| ConfigError::Parse {
        path: path_label.to_string(),
        detail: e.to_string(),
    })?;
    validate(&config)?;
    Ok(config)
}

/// Load and validate a config file.
///
/// Relative paths resolve against the config file's parent directory, so a
/// config can travel with its artifacts.
pub async fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
    let mut config = parse(&path.display().to_string(), &content)?;
    if let Some(config_dir) = path.parent() {
        resolve_relative_paths(&mut config, config_dir);
    }
    validate_paths(&config).await?;
    Ok(config)
}

fn resolve_relative_paths(config: &mut Config, config_dir: &Path) {
    let resolve = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = config_dir.join(&*p);
        }
    };
    resolve(&mut config.firecracker.binary);
    resolve(&mut config.firecracker.kernel);
    resolve(&mut config.firecracker.rootfs);
    resolve(&mut config.base_dir);
    for agent in &mut config.agents {
        resolve(&mut agent.module);
        if let Some(workspace) = &mut agent.workspace {
            resolve(workspace);
        }
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for agent in &config.agents {
        if agent.id.is_empty() {
            return Err(ConfigError::Invalid("agent with empty id".to_string()));
        }
        if !seen.insert(&agent.id) {
            return Err(ConfigError::Invalid(format!(
                "duplicate agent id: {}",
                agent.id
            )));
        }
        // A stateful agent has no writeback target without a workspace.
        if agent.stateful && agent.workspace.is_none() {
            return Err(ConfigError::Invalid(format!(
                "agent {} is stateful but has no workspace",
                agent.id
            )));
        }
    }
    Ok(())
}

async fn validate_paths(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();
    for (label, path) in [
        ("firecracker.binary", &config.firecracker.binary),
        ("firecracker.kernel", &config.firecracker.kernel),
        ("firecracker.rootfs", &config.firecracker.rootfs),
    ] {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            missing.push(format!("{label}: {}", path.display()));
        }
    }
    for agent in &config.agents {
        if !tokio::fs::try_exists(&agent.module).await.unwrap_or(false) {
            missing.push(format!("agents.{}.module: {}", agent.id, agent.module.display()));
        }
        if let Some(workspace) = &agent.workspace
            && !tokio::fs::try_exists(workspace).await.unwrap_or(false)
        {
            missing.push(format!(
                "agents.{}.workspace: {}",
                agent.id,
                workspace.display()
            ));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "missing paths: {}",
            missing.join(", ")
        )))
    }
}
