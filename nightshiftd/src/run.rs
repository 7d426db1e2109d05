//! Run orchestration: checkout → submit → forward events → checkin.
//!
//! Warm VMs fail in transient ways (crashed guest, half-closed socket), so a
//! run gets exactly one retry on a fresh VM before the failure reaches the
//! caller. More retries would mask real bugs and amplify bad requests.
//!
//! The guest's terminal event is authoritative: the orchestrator only emits
//! its own `nightshift.error` when a run ends without one, and `mark_done`
//! fires exactly once per run on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use machine::{AgentDescriptor, ControlEvent, RunRequest, VmLauncher};
use tracing::{info, warn};

use crate::events::EventBuffer;
use crate::pool::{PoolError, VmLease, VmPool};

/// Callback into the registry once a run has finished. `error` is `None`
/// when the guest reached a terminal event on its own.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn run_complete(&self, run_id: &str, error: Option<&str>);
}

/// Stand-in hook when no registry is attached.
pub struct LogCompletion;

#[async_trait]
impl CompletionHook for LogCompletion {
    async fn run_complete(&self, run_id: &str, error: Option<&str>) {
        match error {
            None => info!(run_id, "run complete"),
            Some(error) => warn!(run_id, error, "run failed"),
        }
    }
}

/// Execute a run on the warm pool. Returns the failure message when the run
/// ended without a guest terminal event.
pub async fn execute(
    pool: &Arc<VmPool>,
    buffer: &Arc<EventBuffer>,
    descriptor: &AgentDescriptor,
    request: &RunRequest,
) -> Option<String> {
    let error = execute_pooled(pool, buffer, descriptor, request).await;
    finish(buffer, &request.run_id, error)
}

async fn execute_pooled(
    pool: &Arc<VmPool>,
    buffer: &Arc<EventBuffer>,
    descriptor: &AgentDescriptor,
    request: &RunRequest,
) -> Option<String> {
    for attempt in 1..=2u32 {
        let lease = match pool.checkout(descriptor).await {
            Ok(lease) => lease,
            Err(PoolError::WarmUnhealthy { .. }) if attempt == 1 => {
                // The stale entry is gone; the next checkout cold-starts.
                warn!(run_id = %request.run_id, "warm VM was unhealthy, retrying");
                continue;
            }
            Err(e) => return Some(e.to_string()),
        };

        let vm_id = lease.vm.id().to_string();
        match drive(&lease, buffer, request).await {
            Ok(()) => {
                pool.checkin(&descriptor.agent_id, lease).await;
                return None;
            }
            Err(e) => {
                warn!(
                    run_id = %request.run_id,
                    vm = %vm_id,
                    attempt,
                    error = %e,
                    "run failed on VM, invalidating"
                );
                pool.invalidate_vm(&descriptor.agent_id, lease).await;
                if attempt == 2 {
                    return Some(e.to_string());
                }
            }
        }
    }
    Some("run attempts exhausted".to_string())
}

/// Legacy one-shot path for when the pool is disabled: a private VM per run,
/// destroyed unconditionally afterwards.
#[allow(dead_code)]
pub async fn execute_unpooled(
    launcher: &Arc<dyn VmLauncher>,
    buffer: &Arc<EventBuffer>,
    descriptor: &AgentDescriptor,
    request: &RunRequest,
) -> Option<String> {
    let error = match launcher.launch(descriptor, &request.run_id).await {
        Err(e) => Some(e.to_string()),
        Ok(mut vm) => {
            let result = async {
                vm.submit_run(&request.prompt, &request.run_id, &request.runtime_env)
                    .await?;
                vm.wait_for_completion(&request.run_id, buffer.as_ref())
                    .await
            }
            .await;
            vm.destroy().await;
            result.err().map(|e| e.to_string())
        }
    };
    finish(buffer, &request.run_id, error)
}

async fn drive(
    lease: &VmLease,
    buffer: &Arc<EventBuffer>,
    request: &RunRequest,
) -> machine::Result<()> {
    lease
        .vm
        .submit_run(&request.prompt, &request.run_id, &request.runtime_env)
        .await?;
    lease
        .vm
        .wait_for_completion(&request.run_id, buffer.as_ref())
        .await
}

/// Common exit path: a synthetic terminal error when the guest never emitted
/// one, then exactly one `mark_done`.
fn finish(buffer: &Arc<EventBuffer>, run_id: &str, error: Option<String>) -> Option<String> {
    if let Some(message) = &error {
        buffer.publish_typed(run_id, ControlEvent::Error {
            error: message.clone(),
        });
    }
    buffer.mark_done(run_id);
    error
}
