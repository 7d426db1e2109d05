use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use machine::VmError;

use crate::command::{Privilege, exec};

/// Host-level inputs shared by every VM this process boots.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub firecracker_bin: PathBuf,
    pub kernel_path: PathBuf,
    pub base_image_path: PathBuf,
    /// Root of the per-VM scratch directories.
    pub base_dir: PathBuf,
}

/// Commands the backend shells out to over a VM's lifetime.
const REQUIRED_COMMANDS: &[&str] = &[
    "ip",
    "iptables",
    "iptables-save",
    "sysctl",
    "mount",
    "umount",
    "cp",
    "rsync",
];

/// Verify the host before any VM is provisioned.
///
/// Collects every failure into one error so an operator fixes the machine in
/// a single pass rather than one restart per missing piece.
pub async fn check_host(config: &HostConfig) -> Result<(), VmError> {
    let mut problems = Vec::new();

    check_file(&config.firecracker_bin, "firecracker binary", &mut problems);
    check_executable(&config.firecracker_bin, "firecracker binary", &mut problems);
    check_file(&config.kernel_path, "kernel image", &mut problems);
    check_file(&config.base_image_path, "base rootfs image", &mut problems);
    check_kvm(&mut problems);

    for command in REQUIRED_COMMANDS {
        if which::which(command).is_err() {
            problems.push(format!("required command not found: {command}"));
        }
    }

    check_privileges(&mut problems).await;

    if let Err(e) = tokio::fs::create_dir_all(&config.base_dir).await {
        problems.push(format!(
            "cannot create base directory {}: {e}",
            config.base_dir.display()
        ));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(VmError::HostNotReady(problems.join("; ")))
    }
}

fn check_file(path: &Path, label: &str, problems: &mut Vec<String>) {
    if !path.exists() {
        problems.push(format!("{label} not found: {}", path.display()));
    }
}

fn check_executable(path: &Path, label: &str, problems: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        problems.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(problems: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        problems.push("/dev/kvm not found (KVM unavailable)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        problems.push(format!("/dev/kvm not accessible: {e}"));
    }
}

/// Network and mount configuration needs root; accept either running as
/// root outright or passwordless sudo.
async fn check_privileges(problems: &mut Vec<String>) {
    if nix::unistd::geteuid().is_root() {
        return;
    }
    if exec("sudo", &["-n", "true"], Privilege::User).await.is_err() {
        problems.push(
            "root or passwordless sudo required for TAP, NAT, and mount operations".to_string(),
        );
    }
}
