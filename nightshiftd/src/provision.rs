//! Cold-start provisioning: stage the workspace, assemble the static
//! environment, and boot a Firecracker VM for an agent.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use machine::{AgentDescriptor, Result, VmError, VmHandle, VmLaunchSpec, VmLauncher};
use machine_fc::{FirecrackerVm, HostConfig, NetworkAllocator, VmPaths};
use tracing::info;

pub struct FirecrackerLauncher {
    host: HostConfig,
    allocator: Arc<NetworkAllocator>,
}

impl FirecrackerLauncher {
    pub fn new(host: HostConfig, allocator: Arc<NetworkAllocator>) -> Self {
        Self { host, allocator }
    }
}

#[async_trait]
impl VmLauncher for FirecrackerLauncher {
    async fn launch(&self, descriptor: &AgentDescriptor, vm_id: &str) -> Result<Box<dyn VmHandle>> {
        let paths = VmPaths::new(&self.host.base_dir, vm_id);

        // Stage the workspace under the VM's own scratch directory so a
        // failed launch cleans it up along with everything else. An agent
        // without a workspace gets a fresh empty one rather than the
        // daemon's working directory.
        let staging = paths.staging_workspace();
        if let Err(e) = stage_workspace(descriptor, &staging).await {
            let _ = tokio::fs::remove_dir_all(paths.dir()).await;
            return Err(e);
        }

        let spec = VmLaunchSpec {
            kernel_path: self.host.kernel_path.clone(),
            base_image_path: self.host.base_image_path.clone(),
            workspace_dir: staging,
            package_dir: Some(descriptor.module_location.clone()),
            env: static_env(descriptor),
            resources: descriptor.resource_profile.clone(),
        };

        let mut vm = match FirecrackerVm::new(
            vm_id.to_string(),
            spec,
            self.host.firecracker_bin.clone(),
            &self.host.base_dir,
            Arc::clone(&self.allocator),
        ) {
            Ok(vm) => vm,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(paths.dir()).await;
                return Err(e);
            }
        };
        // A failed start tears its own resources down, scratch dir included.
        vm.start().await?;

        info!(agent = %descriptor.agent_id, id = vm_id, "cold-started VM");
        Ok(Box::new(vm))
    }
}

async fn stage_workspace(descriptor: &AgentDescriptor, staging: &Path) -> Result<()> {
    tokio::fs::create_dir_all(staging).await?;
    if let Some(source) = &descriptor.workspace_source {
        copy_tree(source, staging).await?;
    }
    Ok(())
}

/// Copy a directory's contents (dotfiles included) into an existing target.
async fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    let source_contents = format!("{}/.", source.display());
    let output = tokio::process::Command::new("cp")
        .arg("-a")
        .arg(&source_contents)
        .arg(dest)
        .output()
        .await?;
    if !output.status.success() {
        return Err(VmError::Provision(format!(
            "stage workspace from {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Environment baked into the VM image at boot: forwarded host variables,
/// the agent's declared environment, and the platform's own paths. Per-run
/// secrets are not here; they travel with each run request.
fn static_env(descriptor: &AgentDescriptor) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for name in &descriptor.forward_env_names {
        if let Ok(value) = std::env::var(name)
            && !value.is_empty()
        {
            env.insert(name.clone(), value);
        }
    }
    env.extend(
        descriptor
            .static_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env.insert(
        "NIGHTSHIFT_WORKSPACE".to_string(),
        "/workspace".to_string(),
    );
    env.insert(
        "NIGHTSHIFT_AGENT_DIR".to_string(),
        machine_fc::GUEST_AGENT_PKG_DIR.to_string(),
    );
    env
}
