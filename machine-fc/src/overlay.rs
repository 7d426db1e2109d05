//! Writable rootfs overlays.
//!
//! Every VM boots from a private copy of the shared base image; the base is
//! never mutated. Before boot the copy is loop-mounted and seeded with the
//! agent's workspace, code, environment file, and a usable `resolv.conf`.
//! For stateful agents the guest's `/workspace` is mirrored back out after a
//! graceful shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::command::{Privilege, exec, exec_ignore_errors};

/// Guest path the agent package is injected at.
pub const GUEST_AGENT_PKG_DIR: &str = "/opt/nightshift/agent_pkg";

/// Public resolvers written over the image's `resolv.conf`; base images often
/// ship a systemd-resolved stub symlink that has no upstream inside a VM.
const RESOLV_CONF: &str = "nameserver 8.8.8.8\nnameserver 1.1.1.1\n";

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("failed to copy base image: {0}")]
    Copy(String),

    #[error("failed to mount overlay: {0}")]
    Mount(String),

    #[error("failed to seed overlay: {0}")]
    Seed(String),

    #[error("failed to extract workspace: {0}")]
    Extract(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

fn overlay_file_name(vm_id: &str) -> String {
    format!("{vm_id}.ext4")
}

/// `KEY=VALUE` lines for `/etc/nightshift/env`, in stable key order.
fn render_env_file(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

/// Build a writable overlay of `base_image` under `scratch_dir`.
///
/// The copy is sparse when the host `cp` supports it, dense otherwise. The
/// image is mounted exactly once, seeded, and unmounted before returning;
/// a failed seed removes the half-built image.
pub async fn build(
    base_image: &Path,
    vm_id: &str,
    workspace_dir: &Path,
    package_dir: Option<&Path>,
    env: &BTreeMap<String, String>,
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let overlay_path = scratch_dir.join(overlay_file_name(vm_id));

    let base = base_image.display().to_string();
    let overlay = overlay_path.display().to_string();
    if let Err(e) = exec(
        "cp",
        &["--sparse=always", base.as_str(), overlay.as_str()],
        Privilege::User,
    )
    .await
    {
        // Dense fallback for hosts whose cp lacks sparse support.
        debug!(error = %e, "sparse copy unavailable, copying dense");
        tokio::fs::copy(base_image, &overlay_path)
            .await
            .map_err(|e| OverlayError::Copy(e.to_string()))?;
    }

    let mount_point = scratch_dir.join(format!("mnt-{vm_id}"));
    tokio::fs::create_dir_all(&mount_point).await?;

    let mnt = mount_point.display().to_string();
    exec(
        "mount",
        &["-o", "loop", overlay.as_str(), mnt.as_str()],
        Privilege::Sudo,
    )
    .await
    .map_err(|e| OverlayError::Mount(e.detail))?;

    let seeded = seed(&mount_point, workspace_dir, package_dir, env, scratch_dir).await;

    exec_ignore_errors("umount", &[mnt.as_str()], Privilege::Sudo).await;
    if let Err(e) = tokio::fs::remove_dir(&mount_point).await {
        warn!(path = %mount_point.display(), error = %e, "could not remove mount point");
    }

    if let Err(e) = seeded {
        let _ = tokio::fs::remove_file(&overlay_path).await;
        return Err(e);
    }

    Ok(overlay_path)
}

/// Inject workspace, agent package, environment, and DNS into the mounted
/// image. Each target is removed before its replacement is copied, so the
/// guest never sees a merge of old and new trees.
async fn seed(
    mount_point: &Path,
    workspace_dir: &Path,
    package_dir: Option<&Path>,
    env: &BTreeMap<String, String>,
    scratch_dir: &Path,
) -> Result<()> {
    let mnt = mount_point.display().to_string();

    replace_tree(workspace_dir, &format!("{mnt}/workspace")).await?;

    if let Some(package_dir) = package_dir {
        let opt_dir = format!("{mnt}/opt/nightshift");
        sudo_seed(&["mkdir", "-p", opt_dir.as_str()]).await?;
        replace_tree(package_dir, &format!("{mnt}{GUEST_AGENT_PKG_DIR}")).await?;
    }

    let env_dir = format!("{mnt}/etc/nightshift");
    sudo_seed(&["mkdir", "-p", env_dir.as_str()]).await?;
    install_file(
        scratch_dir,
        "env",
        &render_env_file(env),
        &format!("{mnt}/etc/nightshift/env"),
    )
    .await?;

    // rm -f first: the target is frequently a symlink into systemd-resolved.
    let resolv = format!("{mnt}/etc/resolv.conf");
    sudo_seed(&["rm", "-f", resolv.as_str()]).await?;
    install_file(scratch_dir, "resolv.conf", RESOLV_CONF, &resolv).await?;

    Ok(())
}

/// Replace `dest` (inside the mounted image) with a copy of host directory `src`.
async fn replace_tree(src: &Path, dest: &str) -> Result<()> {
    sudo_seed(&["rm", "-rf", dest]).await?;
    let src = src.display().to_string();
    sudo_seed(&["cp", "-a", src.as_str(), dest]).await
}

/// Write `contents` to a scratch file, then copy it into the image with
/// root privileges.
async fn install_file(scratch_dir: &Path, name: &str, contents: &str, dest: &str) -> Result<()> {
    let staged = scratch_dir.join(name);
    tokio::fs::write(&staged, contents).await?;
    let staged_str = staged.display().to_string();
    let result = sudo_seed(&["cp", staged_str.as_str(), dest]).await;
    let _ = tokio::fs::remove_file(&staged).await;
    result
}

async fn sudo_seed(args: &[&str]) -> Result<()> {
    let (program, rest) = args.split_first().ok_or_else(|| {
        OverlayError::Seed("empty seed command".to_string())
    })?;
    exec(program, rest, Privilege::Sudo)
        .await
        .map(|_| ())
        .map_err(|e| OverlayError::Seed(format!("{}: {}", e.command, e.detail)))
}

/// Remove an overlay image and its leftovers. Idempotent.
///
/// Any `mnt-*` sibling directories are unmounted and removed first in case a
/// crash left the image mounted; the parent scratch directory is removed
/// when the overlay was the last thing in it.
pub async fn destroy(overlay_path: &Path) {
    let parent = overlay_path.parent().unwrap_or(Path::new("/"));

    if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("mnt-") {
                let mnt = entry.path().display().to_string();
                exec_ignore_errors("umount", &[mnt.as_str()], Privilege::Sudo).await;
                let _ = tokio::fs::remove_dir(entry.path()).await;
            }
        }
    }

    match tokio::fs::remove_file(overlay_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %overlay_path.display(), error = %e, "could not remove overlay"),
    }

    // Remove the scratch directory when empty; other owners may still be using it.
    let _ = tokio::fs::remove_dir(parent).await;
}

/// Mirror the image's `/workspace/` into `dest` (additions and deletions).
///
/// The image is mounted read-only; callers shut the VM down first so the
/// filesystem is consistent.
pub async fn extract_workspace(overlay_path: &Path, dest: &Path) -> Result<()> {
    let parent = overlay_path.parent().unwrap_or(Path::new("/"));
    let mount_point = parent.join("mnt-out");
    tokio::fs::create_dir_all(&mount_point).await?;
    tokio::fs::create_dir_all(dest).await?;

    let overlay = overlay_path.display().to_string();
    let mnt = mount_point.display().to_string();
    exec(
        "mount",
        &["-o", "loop,ro", overlay.as_str(), mnt.as_str()],
        Privilege::Sudo,
    )
    .await
    .map_err(|e| OverlayError::Mount(e.detail))?;

    let result = sync_workspace(&mount_point, dest).await;

    exec_ignore_errors("umount", &[mnt.as_str()], Privilege::Sudo).await;
    let _ = tokio::fs::remove_dir(&mount_point).await;

    result
}

async fn sync_workspace(mount_point: &Path, dest: &Path) -> Result<()> {
    let workspace = mount_point.join("workspace");
    if !tokio::fs::try_exists(&workspace).await.unwrap_or(false) {
        debug!(image = %mount_point.display(), "image has no /workspace, nothing to extract");
        return Ok(());
    }

    let src = format!("{}/", workspace.display());
    let dst = format!("{}/", dest.display());
    exec(
        "rsync",
        &["-a", "--delete", src.as_str(), dst.as_str()],
        Privilege::Sudo,
    )
    .await
    .map(|_| ())
    .map_err(|e| OverlayError::Extract(e.detail))
}
