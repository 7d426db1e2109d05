use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Hardware and readiness profile for one agent's VMs.
#[derive(Debug, Clone)]
pub struct ResourceProfile {
    pub vcpus: u32,
    pub memory_mib: u32,
    /// Maximum time to wait for the guest agent's `/health` endpoint after boot.
    pub health_timeout: Duration,
    /// Port the guest agent listens on inside the VM.
    pub event_port: u16,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_mib: 2048,
            health_timeout: Duration::from_secs(60),
            event_port: 8080,
        }
    }
}

/// A deployed agent as the registry hands it to the core.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub agent_id: String,
    /// Packaged agent directory on the host, injected at
    /// `/opt/nightshift/agent_pkg` inside the VM.
    pub module_location: PathBuf,
    pub resource_profile: ResourceProfile,
    /// Host directory mounted into the VM as `/workspace`. `None` provisions
    /// a fresh empty workspace per VM.
    pub workspace_source: Option<PathBuf>,
    /// Environment baked into the VM image at boot.
    pub static_env: BTreeMap<String, String>,
    /// Host environment variables whose current values are also baked in.
    pub forward_env_names: Vec<String>,
    /// 0 means the platform default. Ignored for stateful agents.
    pub max_concurrent_vms: usize,
    /// Stateful agents run at most one VM and have `/workspace` synced back
    /// to `workspace_source` on teardown.
    pub stateful: bool,
}

impl AgentDescriptor {
    /// Concurrency ceiling after resolving `stateful` and `max_concurrent_vms`.
    ///
    /// Stateful agents are pinned to one VM. A resolved cap of zero is
    /// treated as one so a misconfigured default can never deadlock checkout.
    pub fn effective_cap(&self, default_cap: usize) -> usize {
        if self.stateful {
            1
        } else if self.max_concurrent_vms > 0 {
            self.max_concurrent_vms
        } else {
            default_cap.max(1)
        }
    }
}

/// One run request as received from the caller.
///
/// `runtime_env` carries per-run secrets; it is sent to the guest with the
/// run and never baked into a warm VM's static environment.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub agent_id: String,
    pub prompt: String,
    pub runtime_env: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(stateful: bool, max_concurrent_vms: usize) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: "agent-1".to_string(),
            module_location: PathBuf::from("/opt/nightshift/agents/agent-1"),
            resource_profile: ResourceProfile::default(),
            workspace_source: None,
            static_env: BTreeMap::new(),
            forward_env_names: Vec::new(),
            max_concurrent_vms,
            stateful,
        }
    }

    #[test]
    fn effective_cap_uses_default_when_unset() {
        assert_eq!(descriptor(false, 0).effective_cap(4), 4);
    }

    #[test]
    fn effective_cap_prefers_explicit_limit() {
        assert_eq!(descriptor(false, 7).effective_cap(4), 7);
    }

    #[test]
    fn effective_cap_stateful_is_one() {
        // An explicit limit is ignored once the agent is stateful.
        assert_eq!(descriptor(true, 7).effective_cap(4), 1);
    }

    #[test]
    fn effective_cap_zero_default_is_one() {
        assert_eq!(descriptor(false, 0).effective_cap(0), 1);
    }
}
