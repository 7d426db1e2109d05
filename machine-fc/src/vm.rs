//! One Firecracker microVM, from provisioning through destruction.
//!
//! The startup sequence is the classic Firecracker dance: build the overlay,
//! lease a TAP device, spawn the process, configure it over the API socket,
//! start the instance, then gate on the guest agent's `/health` endpoint.
//! A failure at any step tears down everything built so far.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use machine::{EventSink, Result, VmError, VmHandle, VmLaunchSpec};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::api::{BootSource, Drive, FirecrackerApi, MachineConfig, NetworkInterface};
use crate::network::{self, NetworkAllocator, NetworkLease};
use crate::overlay;
use crate::paths::VmPaths;
use crate::sse::SseParser;

/// How long the API socket may take to appear after the process spawns.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between guest `/health` polls during boot.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for a single `/health` probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for `POST /run` (the guest answers immediately or not at all).
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SendCtrlAltDel and a hard kill.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmState {
    Creating = 0,
    Booting = 1,
    Healthy = 2,
    Draining = 3,
    Destroying = 4,
    Destroyed = 5,
}

impl VmState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Creating,
            1 => Self::Booting,
            2 => Self::Healthy,
            3 => Self::Draining,
            4 => Self::Destroying,
            _ => Self::Destroyed,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Booting => "booting",
            Self::Healthy => "healthy",
            Self::Draining => "draining",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }
}

pub struct FirecrackerVm {
    vm_id: String,
    spec: VmLaunchSpec,
    firecracker_bin: PathBuf,
    paths: VmPaths,
    allocator: Arc<NetworkAllocator>,
    http: reqwest::Client,
    state: AtomicU8,
    child: Option<tokio::process::Child>,
    lease: Option<NetworkLease>,
    overlay_path: Option<PathBuf>,
}

impl FirecrackerVm {
    pub fn new(
        vm_id: String,
        spec: VmLaunchSpec,
        firecracker_bin: PathBuf,
        base_dir: &Path,
        allocator: Arc<NetworkAllocator>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| VmError::Provision(format!("http client: {e}")))?;
        let paths = VmPaths::new(base_dir, &vm_id);
        Ok(Self {
            vm_id,
            spec,
            firecracker_bin,
            paths,
            allocator,
            http,
            state: AtomicU8::new(VmState::Creating as u8),
            child: None,
            lease: None,
            overlay_path: None,
        })
    }

    pub fn paths(&self) -> &VmPaths {
        &self.paths
    }

    fn current_state(&self) -> VmState {
        VmState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions are monotone; a CAS keeps races (e.g. a concurrent
    /// destroy) from re-entering an earlier state.
    fn transition(&self, from: VmState, to: VmState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn require_healthy(&self) -> Result<()> {
        let state = self.current_state();
        if state == VmState::Healthy {
            Ok(())
        } else {
            Err(VmError::State {
                actual: state.name(),
                expected: VmState::Healthy.name(),
            })
        }
    }

    fn guest_url(&self) -> Result<String> {
        let lease = self.lease.as_ref().ok_or(VmError::State {
            actual: "unprovisioned",
            expected: "healthy",
        })?;
        Ok(format!(
            "http://{}:{}",
            lease.guest_ip, self.spec.resources.event_port
        ))
    }

    async fn provision_and_boot(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(self.paths.dir()).await?;

        let overlay_path = overlay::build(
            &self.spec.base_image_path,
            &self.vm_id,
            &self.spec.workspace_dir,
            self.spec.package_dir.as_deref(),
            &self.spec.env,
            self.paths.dir(),
        )
        .await
        .map_err(|e| VmError::Provision(e.to_string()))?;
        self.overlay_path = Some(overlay_path.clone());

        let lease = self
            .allocator
            .allocate()
            .await
            .map_err(|e| VmError::Provision(e.to_string()))?;
        self.lease = Some(lease.clone());

        let mut child = tokio::process::Command::new(&self.firecracker_bin)
            .arg("--api-sock")
            .arg(self.paths.api_sock())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        forward_console(&self.vm_id, &mut child);
        self.child = Some(child);

        let api = FirecrackerApi::new(self.paths.api_sock());
        api.wait_for_socket(SOCKET_TIMEOUT)
            .await
            .map_err(|e| VmError::Provision(e.to_string()))?;

        self.configure(&api, &lease, &overlay_path).await?;

        api.start_instance()
            .await
            .map_err(|e| VmError::Provision(e.to_string()))?;
        self.state.store(VmState::Booting as u8, Ordering::Release);

        self.wait_for_health().await?;
        if !self.transition(VmState::Booting, VmState::Healthy) {
            return Err(VmError::State {
                actual: self.current_state().name(),
                expected: VmState::Booting.name(),
            });
        }

        info!(id = %self.vm_id, guest = %lease.guest_ip, "vm healthy");
        Ok(())
    }

    async fn configure(
        &self,
        api: &FirecrackerApi,
        lease: &NetworkLease,
        overlay_path: &Path,
    ) -> Result<()> {
        let provision = |e: crate::api::ApiError| VmError::Provision(e.to_string());

        api.set_boot_source(&BootSource {
            kernel_image_path: self.spec.kernel_path.display().to_string(),
            boot_args: network::boot_args(lease),
        })
        .await
        .map_err(provision)?;

        api.attach_drive(&Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: overlay_path.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        })
        .await
        .map_err(provision)?;

        api.attach_network_interface(&NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: network::derive_guest_mac(&self.vm_id),
            host_dev_name: lease.tap_name.clone(),
        })
        .await
        .map_err(provision)?;

        api.set_machine_config(&MachineConfig {
            vcpu_count: self.spec.resources.vcpus,
            mem_size_mib: self.spec.resources.memory_mib,
        })
        .await
        .map_err(provision)?;

        Ok(())
    }

    /// Poll the guest agent until it answers 200, confirming the kernel
    /// booted, init ran, and the agent is accepting work. Refused
    /// connections and probe timeouts just mean "not yet".
    async fn wait_for_health(&self) -> Result<()> {
        let url = format!("{}/health", self.guest_url()?);
        let deadline = tokio::time::Instant::now() + self.spec.resources.health_timeout;

        loop {
            let probe = self
                .http
                .get(&url)
                .timeout(HEALTH_PROBE_TIMEOUT)
                .send()
                .await;
            if let Ok(response) = probe
                && response.status() == reqwest::StatusCode::OK
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmError::HealthTimeout(self.spec.resources.health_timeout));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

/// Forward the firecracker process's console output into the host log.
fn forward_console(id: &str, child: &mut tokio::process::Child) {
    if let Some(stdout) = child.stdout.take() {
        let id = id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    debug!(id = %id, "{line}");
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = id.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    warn!(id = %id, "stderr: {line}");
                }
            }
        });
    }
}

#[async_trait]
impl VmHandle for FirecrackerVm {
    fn id(&self) -> &str {
        &self.vm_id
    }

    async fn start(&mut self) -> Result<()> {
        let state = self.current_state();
        if state != VmState::Creating {
            return Err(VmError::State {
                actual: state.name(),
                expected: VmState::Creating.name(),
            });
        }

        match self.provision_and_boot().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(id = %self.vm_id, error = %e, "vm startup failed, tearing down");
                self.destroy().await;
                Err(e)
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        if self.current_state() != VmState::Healthy {
            return false;
        }
        let Ok(url) = self.guest_url() else {
            return false;
        };
        self.http
            .get(format!("{url}/health"))
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
            .map(|r| r.status() == reqwest::StatusCode::OK)
            .unwrap_or(false)
    }

    async fn submit_run(
        &self,
        prompt: &str,
        run_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.require_healthy()?;
        let url = format!("{}/run", self.guest_url()?);
        let body = serde_json::json!({
            "prompt": prompt,
            "run_id": run_id,
            "env": env,
        });

        let response = self
            .http
            .post(&url)
            .timeout(SUBMIT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| VmError::GuestProtocol(format!("submit run: {e}")))?;

        match response.status().as_u16() {
            202 => Ok(()),
            // Pool discipline reserves a VM for one run at a time; a 409
            // means that discipline was violated somewhere upstream.
            409 => Err(VmError::GuestRejected("guest already has a run".to_string())),
            400 => Err(VmError::GuestRejected("guest rejected run request".to_string())),
            status => Err(VmError::GuestProtocol(format!(
                "unexpected status {status} from /run"
            ))),
        }
    }

    async fn wait_for_completion(&self, run_id: &str, sink: &dyn EventSink) -> Result<()> {
        self.require_healthy()?;
        let url = format!("{}/events", self.guest_url()?);

        // No client-side timeout: the stream stays open for the whole run.
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| VmError::GuestProtocol(format!("open event stream: {e}")))?;
        if !response.status().is_success() {
            return Err(VmError::GuestProtocol(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        let mut chunks = response.bytes_stream();
        let mut parser = SseParser::default();

        while let Some(chunk) = chunks.next().await {
            let chunk =
                chunk.map_err(|e| VmError::GuestProtocol(format!("event stream read: {e}")))?;
            for frame in parser.push(&chunk) {
                if frame.data.is_empty() {
                    continue;
                }
                let Ok(mut payload) = serde_json::from_str::<serde_json::Value>(&frame.data)
                else {
                    debug!(id = %self.vm_id, "skipping malformed event frame");
                    continue;
                };

                // Prefer the payload's own type; SSE event names can be as
                // generic as "message".
                let event_type = payload
                    .get("type")
                    .and_then(|t| t.as_str())
                    .map(str::to_owned)
                    .or_else(|| frame.event.clone())
                    .unwrap_or_else(|| "message".to_string());
                if let Some(object) = payload.as_object_mut() {
                    object.remove("type");
                }

                sink.publish(run_id, &event_type, payload).await;

                if machine::is_terminal(&event_type) {
                    return Ok(());
                }
            }
        }

        // The guest hung up without finishing the run.
        Err(VmError::StreamClosed)
    }

    async fn drain(&mut self) -> Result<()> {
        if !self.transition(VmState::Healthy, VmState::Draining) {
            return Ok(());
        }

        let api = FirecrackerApi::new(self.paths.api_sock());
        if let Err(e) = api.send_ctrl_alt_del().await {
            warn!(id = %self.vm_id, error = %e, "graceful shutdown request failed");
        }

        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(DRAIN_TIMEOUT, child.wait()).await {
                Ok(_) => debug!(id = %self.vm_id, "guest shut down cleanly"),
                Err(_) => {
                    warn!(id = %self.vm_id, "guest ignored shutdown, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        self.child = None;
        Ok(())
    }

    async fn extract_workspace(&self, dest: &Path) -> Result<()> {
        let overlay_path = self.overlay_path.as_ref().ok_or(VmError::State {
            actual: "unprovisioned",
            expected: "draining",
        })?;
        overlay::extract_workspace(overlay_path, dest)
            .await
            .map_err(|e| VmError::Provision(e.to_string()))
    }

    async fn destroy(&mut self) {
        if self.current_state() == VmState::Destroyed {
            return;
        }
        self.state.store(VmState::Destroying as u8, Ordering::Release);

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if let Some(lease) = self.lease.take() {
            self.allocator.release(&lease).await;
        }

        if let Some(overlay_path) = self.overlay_path.take() {
            overlay::destroy(&overlay_path).await;
        }

        match tokio::fs::remove_dir_all(self.paths.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(id = %self.vm_id, error = %e, "could not remove scratch dir"),
        }

        self.state.store(VmState::Destroyed as u8, Ordering::Release);
        info!(id = %self.vm_id, "vm destroyed");
    }
}
