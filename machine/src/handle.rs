use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::agent::AgentDescriptor;
use crate::error::Result;

/// Destination for events forwarded off a guest's SSE stream.
///
/// The daemon's event buffer is the production implementation; tests use
/// recording sinks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, run_id: &str, event_type: &str, payload: serde_json::Value);
}

/// One microVM, driven through its whole lifecycle.
///
/// Implementations move through `Creating → Booting → Healthy → {Draining,
/// Destroying} → Destroyed`; only a `Healthy` VM accepts run submission and
/// event streaming, and a destroyed handle must never be reused.
#[async_trait]
pub trait VmHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Provision all resources and boot until the guest reports healthy.
    /// Failure at any step leaves nothing allocated.
    async fn start(&mut self) -> Result<()>;

    /// Probe the guest's `/health` endpoint with a short timeout.
    async fn is_healthy(&self) -> bool;

    /// Hand a prompt to the guest agent. The per-run environment rides along
    /// with the request and is never persisted into the VM image.
    async fn submit_run(
        &self,
        prompt: &str,
        run_id: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Consume the guest's SSE stream, forwarding every event into `sink`,
    /// until a terminal event arrives. A stream that closes earlier is an
    /// error.
    async fn wait_for_completion(&self, run_id: &str, sink: &dyn EventSink) -> Result<()>;

    /// Ask the guest to shut down cleanly; force-kill when it dawdles.
    async fn drain(&mut self) -> Result<()>;

    /// Mirror the VM's `/workspace` into `dest` (additions and deletions).
    /// Callers drain first so guest file buffers are flushed.
    async fn extract_workspace(&self, dest: &Path) -> Result<()>;

    /// Release every owned resource. Idempotent; teardown failures are
    /// logged, never returned.
    async fn destroy(&mut self);
}

/// Cold-start seam between the pool and a VM backend.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Provision and boot a new VM for `descriptor`, returning it healthy.
    async fn launch(&self, descriptor: &AgentDescriptor, vm_id: &str) -> Result<Box<dyn VmHandle>>;
}
