use tokio::process::Command;
use tracing::trace;

/// Error from a failed host command, carrying the command line and stderr.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}: {detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a host command should be executed.
#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    /// Prefix with `sudo` (network, mount, and in-image file operations).
    Sudo,
    /// Run as the daemon's own user.
    User,
}

fn render(program: &str, args: &[&str], privilege: Privilege) -> String {
    let sudo = matches!(privilege, Privilege::Sudo)
        .then_some("sudo ")
        .unwrap_or_default();
    format!("{sudo}{program} {}", args.join(" "))
}

async fn run(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> std::io::Result<std::process::Output> {
    match privilege {
        Privilege::Sudo => {
            Command::new("sudo")
                .arg(program)
                .args(args)
                .output()
                .await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    }
}

/// Execute a host command, returning trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let command_line = render(program, args, privilege);
    trace!(command = %command_line, "exec");

    let output = run(program, args, privilege)
        .await
        .map_err(|e| CommandError {
            command: command_line.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: command_line,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Execute a host command, discarding any failure. Used on teardown paths
/// where the resource may already be gone.
pub async fn exec_ignore_errors(program: &str, args: &[&str], privilege: Privilege) {
    if let Err(e) = exec(program, args, privilege).await {
        trace!(error = %e, "command failed (ignored)");
    }
}

/// Execute a command line through `sh -c`.
///
/// Needed when replaying `iptables-save` output, whose quoting only a shell
/// interprets correctly. Failures are discarded.
pub async fn exec_shell_ignore_errors(command_line: &str, privilege: Privilege) {
    exec_ignore_errors("sh", &["-c", command_line], privilege).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_plain() {
        assert_eq!(
            render("ip", &["link", "del", "tap-1234"], Privilege::User),
            "ip link del tap-1234"
        );
    }

    #[test]
    fn render_sudo_prefixed() {
        assert_eq!(
            render("mount", &["-o", "loop", "a.ext4", "/mnt"], Privilege::Sudo),
            "sudo mount -o loop a.ext4 /mnt"
        );
    }

    #[tokio::test]
    async fn exec_captures_stdout() {
        let out = exec("echo", &["-n", "ready"], Privilege::User).await.unwrap();
        assert_eq!(out, "ready");
    }

    #[tokio::test]
    async fn exec_surfaces_stderr_on_failure() {
        let err = exec("sh", &["-c", "echo nope >&2; exit 3"], Privilege::User)
            .await
            .unwrap_err();
        assert!(err.detail.contains("nope"), "detail: {}", err.detail);
        assert!(err.command.starts_with("sh "));
    }

    #[tokio::test]
    async fn exec_ignore_errors_swallows_failure() {
        exec_ignore_errors("false", &[], Privilege::User).await;
    }

    #[tokio::test]
    async fn exec_shell_runs_through_sh() {
        // Quoting that only a shell resolves; must not error.
        exec_shell_ignore_errors("true \"quoted arg\"", Privilege::User).await;
    }
}
