//! Client for Firecracker's management API over its Unix domain socket.
//!
//! The whole pre-boot configuration is a short sequence of PUTs; any non-2xx
//! answer is fatal to the VM being configured.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, header};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixConnector, Uri};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API socket did not appear within {0:?}")]
    SocketTimeout(Duration),

    #[error("request to {path} failed: {detail}")]
    Transport { path: String, detail: String },

    #[error("firecracker rejected {path}: {status} {body}")]
    Rejected {
        path: String,
        status: u16,
        body: String,
    },
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Serialize)]
struct Action {
    action_type: &'static str,
}

pub struct FirecrackerApi {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl FirecrackerApi {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::builder(TokioExecutor::new()).build(UnixConnector),
        }
    }

    /// The socket file is created asynchronously by the firecracker process;
    /// poll for it at 100 ms until `timeout` elapses.
    pub async fn wait_for_socket(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(ApiError::SocketTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    pub async fn set_boot_source(&self, boot: &BootSource) -> Result<()> {
        self.put("/boot-source", boot).await
    }

    pub async fn attach_drive(&self, drive: &Drive) -> Result<()> {
        let path = format!("/drives/{}", drive.drive_id);
        self.put(&path, drive).await
    }

    pub async fn attach_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        let path = format!("/network-interfaces/{}", iface.iface_id);
        self.put(&path, iface).await
    }

    pub async fn set_machine_config(&self, machine: &MachineConfig) -> Result<()> {
        self.put("/machine-config", machine).await
    }

    /// Boot the configured guest.
    pub async fn start_instance(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart",
            },
        )
        .await
    }

    /// Ask the guest kernel for a clean shutdown (keyboard reset event).
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel",
            },
        )
        .await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let bytes = serde_json::to_vec(body).map_err(|e| ApiError::Transport {
            path: path.to_string(),
            detail: format!("serialize body: {e}"),
        })?;

        debug!(path, "PUT to firecracker API");

        let request = Request::builder()
            .method(Method::PUT)
            .uri(Uri::new(&self.socket_path, path))
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .map_err(|e| ApiError::Transport {
                path: path.to_string(),
                detail: e.to_string(),
            })?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ApiError::Transport {
                path: path.to_string(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = match response.into_body().collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(_) => String::new(),
        };
        Err(ApiError::Rejected {
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
