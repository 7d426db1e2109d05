use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::agent::ResourceProfile;

/// Everything a backend needs to boot one VM.
///
/// The workspace and package directories are copied into the overlay image
/// before boot; the originals are never handed to the guest.
#[derive(Debug, Clone)]
pub struct VmLaunchSpec {
    /// Uncompressed kernel image (vmlinux) loaded by the hypervisor.
    pub kernel_path: PathBuf,
    /// Base ext4 root filesystem. Never mutated; every VM gets a writable
    /// overlay copy.
    pub base_image_path: PathBuf,
    /// Host directory injected as `/workspace`.
    pub workspace_dir: PathBuf,
    /// Host directory injected as `/opt/nightshift/agent_pkg`, when present.
    pub package_dir: Option<PathBuf>,
    /// Environment written to `/etc/nightshift/env` in the image.
    pub env: BTreeMap<String, String>,
    pub resources: ResourceProfile,
}
