use std::path::{Path, PathBuf};

/// Per-VM scratch directory layout: `<base>/vms/<vm_id>/`.
///
/// Everything ephemeral a VM owns lives under one directory — the API
/// socket, the overlay image, the staged workspace, and the temporary mount
/// points — so teardown is a single recursive removal.
pub struct VmPaths {
    dir: PathBuf,
}

impl VmPaths {
    pub fn new(base_dir: &Path, vm_id: &str) -> Self {
        Self {
            dir: base_dir.join("vms").join(vm_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn api_sock(&self) -> PathBuf {
        self.dir.join("firecracker.sock")
    }

    /// Staging copy of the agent's workspace, injected into the overlay.
    pub fn staging_workspace(&self) -> PathBuf {
        self.dir.join("workspace")
    }
}
