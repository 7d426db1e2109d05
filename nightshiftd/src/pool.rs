//! Per-agent warm VM pool.
//!
//! Each agent owns a list of entries bounded by its effective concurrency
//! cap. Checkout hands out an idle warm VM after a health probe, cold-starts
//! under the cap, or parks until a checkin frees something. While a VM is
//! out, its entry stays in the list (holding the cap slot) with the handle
//! removed; the lease carries the handle and must come back through
//! [`VmPool::checkin`] or [`VmPool::invalidate_vm`].
//!
//! Idle entries carry an eviction timer. Stateful teardown drains the guest
//! and mirrors `/workspace` back to the agent's workspace before destroying.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use machine::{AgentDescriptor, VmError, VmHandle, VmLauncher};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("warm VM for agent {agent_id} failed its health probe")]
    WarmUnhealthy { agent_id: String },

    #[error(transparent)]
    Provision(#[from] VmError),
}

/// A checked-out VM. Return it via checkin (healthy) or invalidate_vm
/// (anything went wrong).
pub struct VmLease {
    entry_id: u64,
    pub vm: Box<dyn VmHandle>,
}

impl std::fmt::Debug for VmLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLease")
            .field("entry_id", &self.entry_id)
            .field("vm_id", &self.vm.id())
            .finish()
    }
}

struct PoolEntry {
    id: u64,
    /// `None` while the VM is checked out (or still cold-starting).
    vm: Option<Box<dyn VmHandle>>,
    busy: bool,
    stateful: bool,
    /// Host directory `/workspace` is mirrored back to on stateful teardown.
    writeback: Option<PathBuf>,
    idle_timer: Option<AbortHandle>,
}

#[derive(Default)]
struct PoolState {
    agents: HashMap<String, Vec<PoolEntry>>,
    next_entry_id: u64,
}

enum Claim {
    Warm(u64, Box<dyn VmHandle>),
    Cold(u64),
    Wait,
}

pub struct VmPool {
    launcher: Arc<dyn VmLauncher>,
    idle_timeout: Duration,
    default_cap: usize,
    state: Mutex<PoolState>,
    notify: Notify,
    weak: Weak<VmPool>,
}

impl VmPool {
    pub fn new(
        launcher: Arc<dyn VmLauncher>,
        idle_timeout: Duration,
        default_cap: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            launcher,
            idle_timeout,
            default_cap,
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            weak: weak.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a warm VM or cold-start one, parking while the agent is at its
    /// cap. The returned VM is health-probed and ready for a run.
    pub async fn checkout(&self, descriptor: &AgentDescriptor) -> Result<VmLease, PoolError> {
        let cap = descriptor.effective_cap(self.default_cap);
        let agent_id = descriptor.agent_id.as_str();

        let claim = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a checkin landing between
            // the inspection and the await still wakes us.
            notified.as_mut().enable();

            let claim = {
                let mut state = self.lock();
                let next_id = state.next_entry_id;
                let entries = state.agents.entry(agent_id.to_string()).or_default();

                if let Some(entry) = entries.iter_mut().find(|e| !e.busy && e.vm.is_some()) {
                    entry.busy = true;
                    if let Some(timer) = entry.idle_timer.take() {
                        timer.abort();
                    }
                    match entry.vm.take() {
                        Some(vm) => Claim::Warm(entry.id, vm),
                        None => Claim::Wait,
                    }
                } else if entries.len() < cap {
                    entries.push(PoolEntry {
                        id: next_id,
                        vm: None,
                        busy: true,
                        stateful: descriptor.stateful,
                        writeback: descriptor.workspace_source.clone(),
                        idle_timer: None,
                    });
                    state.next_entry_id += 1;
                    Claim::Cold(next_id)
                } else {
                    Claim::Wait
                }
            };

            match claim {
                Claim::Wait => notified.await,
                claim => break claim,
            }
        };

        match claim {
            Claim::Warm(entry_id, mut vm) => {
                if vm.is_healthy().await {
                    return Ok(VmLease { entry_id, vm });
                }
                warn!(agent = agent_id, id = vm.id(), "warm VM unhealthy, discarding");
                let _ = self.detach_entry(agent_id, entry_id);
                self.notify.notify_waiters();
                vm.destroy().await;
                Err(PoolError::WarmUnhealthy {
                    agent_id: agent_id.to_string(),
                })
            }
            Claim::Cold(entry_id) => {
                let vm_id = uuid::Uuid::new_v4().to_string();
                match self.launcher.launch(descriptor, &vm_id).await {
                    Ok(vm) => Ok(VmLease { entry_id, vm }),
                    Err(e) => {
                        // Free the placeholder so waiters can try again.
                        let _ = self.detach_entry(agent_id, entry_id);
                        self.notify.notify_waiters();
                        Err(PoolError::Provision(e))
                    }
                }
            }
            Claim::Wait => Err(PoolError::Provision(VmError::Provision(
                "pool wait resolved without a claim".to_string(),
            ))),
        }
    }

    /// Return a VM after a successful run and arm its idle timer.
    pub async fn checkin(&self, agent_id: &str, lease: VmLease) {
        let VmLease { entry_id, vm } = lease;

        let leftover = {
            let mut state = self.lock();
            match state
                .agents
                .get_mut(agent_id)
                .and_then(|entries| entries.iter_mut().find(|e| e.id == entry_id))
            {
                Some(entry) => {
                    entry.busy = false;
                    entry.vm = Some(vm);
                    entry.idle_timer = Some(self.arm_idle_timer(agent_id.to_string(), entry_id));
                    None
                }
                None => Some(vm),
            }
        };

        match leftover {
            None => info!(agent = agent_id, "VM checked in, idle timer armed"),
            Some(mut vm) => {
                // The agent was invalidated while this run was in flight;
                // the entry is gone and the handle is ours to dispose of.
                warn!(agent = agent_id, "checkin for unknown entry, destroying VM");
                vm.destroy().await;
            }
        }
        self.notify.notify_waiters();
    }

    /// Destroy one checked-out VM (run failure path). No workspace
    /// extraction happens here; a VM that broke mid-run has nothing
    /// trustworthy to extract.
    pub async fn invalidate_vm(&self, agent_id: &str, lease: VmLease) {
        let VmLease { entry_id, mut vm } = lease;
        if let Some(mut entry) = self.detach_entry(agent_id, entry_id)
            && let Some(timer) = entry.idle_timer.take()
        {
            timer.abort();
        }
        self.notify.notify_waiters();
        info!(agent = agent_id, id = vm.id(), "invalidating VM");
        vm.destroy().await;
    }

    /// Tear down every VM for an agent (redeploy or delete).
    ///
    /// Entries are detached from the map before any teardown starts, so a
    /// concurrent checkout sees an empty list and cold-starts instead of
    /// grabbing a VM that is about to die.
    #[allow(dead_code)]
    pub async fn invalidate_agent(&self, agent_id: &str) {
        let entries = {
            let mut state = self.lock();
            state.agents.remove(agent_id).unwrap_or_default()
        };
        self.notify.notify_waiters();

        if entries.is_empty() {
            return;
        }
        info!(agent = agent_id, count = entries.len(), "invalidating agent");
        for entry in entries {
            teardown_entry(entry, agent_id).await;
        }
    }

    /// Drain every entry across all agents, honoring stateful extraction.
    pub async fn shutdown(&self) {
        let agents = {
            let mut state = self.lock();
            std::mem::take(&mut state.agents)
        };
        self.notify.notify_waiters();

        for (agent_id, entries) in agents {
            for entry in entries {
                teardown_entry(entry, &agent_id).await;
            }
        }
        info!("pool shut down");
    }

    fn detach_entry(&self, agent_id: &str, entry_id: u64) -> Option<PoolEntry> {
        let mut state = self.lock();
        let entries = state.agents.get_mut(agent_id)?;
        let index = entries.iter().position(|e| e.id == entry_id)?;
        Some(entries.remove(index))
    }

    fn arm_idle_timer(&self, agent_id: String, entry_id: u64) -> AbortHandle {
        let weak = self.weak.clone();
        let timeout = self.idle_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pool) = weak.upgrade() {
                pool.expire_idle(agent_id, entry_id).await;
            }
        });
        task.abort_handle()
    }

    /// Idle timer body: evict the entry if it is still present and still
    /// idle. A checkout that won the race flipped `busy` (or aborted us), in
    /// which case there is nothing to do.
    async fn expire_idle(&self, agent_id: String, entry_id: u64) {
        let entry = {
            let mut state = self.lock();
            let Some(entries) = state.agents.get_mut(&agent_id) else {
                return;
            };
            let Some(index) = entries.iter().position(|e| e.id == entry_id && !e.busy) else {
                return;
            };
            entries.remove(index)
        };
        self.notify.notify_waiters();

        info!(agent = %agent_id, "idle timeout, evicting VM");
        let mut entry = entry;
        // This task owns the timer; aborting it here would cancel the
        // teardown mid-flight.
        entry.idle_timer = None;
        teardown_entry(entry, &agent_id).await;
    }
}

/// Release everything an entry owns. Stateful entries get a graceful drain
/// and a workspace writeback first; failures there are logged and teardown
/// continues.
async fn teardown_entry(mut entry: PoolEntry, agent_id: &str) {
    if let Some(timer) = entry.idle_timer.take() {
        timer.abort();
    }
    let Some(mut vm) = entry.vm.take() else {
        // Checked out: the lease holder will find the entry gone at checkin
        // and destroy the VM itself.
        return;
    };

    if entry.stateful {
        if let Err(e) = vm.drain().await {
            warn!(agent = agent_id, id = vm.id(), error = %e, "drain failed");
        }
        if let Some(dest) = &entry.writeback {
            match vm.extract_workspace(dest).await {
                Ok(()) => info!(agent = agent_id, dest = %dest.display(), "workspace extracted"),
                Err(e) => {
                    warn!(agent = agent_id, error = %e, "workspace extraction failed")
                }
            }
        }
    }

    vm.destroy().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeLauncher, descriptor, stateful_descriptor};
    use std::time::Duration;

    fn pool_with(launcher: &Arc<FakeLauncher>, idle_timeout: Duration) -> Arc<VmPool> {
        let dyn_launcher: Arc<dyn VmLauncher> = launcher.clone();
        VmPool::new(dyn_launcher, idle_timeout, 4)
    }

    #[tokio::test]
    async fn warm_hit_reuses_the_same_vm() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = descriptor("a", 1);

        let lease = pool.checkout(&agent).await.unwrap();
        pool.checkin("a", lease).await;
        let lease = pool.checkout(&agent).await.unwrap();
        pool.checkin("a", lease).await;

        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn cap_blocks_third_checkout_until_checkin() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = descriptor("a", 2);

        let first = pool.checkout(&agent).await.unwrap();
        let _second = pool.checkout(&agent).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);

        let third = tokio::spawn({
            let pool = Arc::clone(&pool);
            let agent = descriptor("a", 2);
            async move { pool.checkout(&agent).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished(), "third checkout should wait at the cap");

        pool.checkin("a", first).await;
        let lease = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        // The third run rode the warm VM; no extra cold start.
        assert_eq!(launcher.launch_count(), 2);
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn idle_timeout_evicts_and_next_checkout_cold_starts() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_millis(40));
        let agent = descriptor("a", 1);

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);
        pool.checkin("a", lease).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(probes.destroyed(), "idle VM should be destroyed");

        let lease = pool.checkout(&agent).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn checkout_cancels_the_idle_timer() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_millis(60));
        let agent = descriptor("a", 1);

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);
        pool.checkin("a", lease).await;

        // Reclaim before the timer fires; the VM must survive.
        let lease = pool.checkout(&agent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!probes.destroyed());
        assert_eq!(launcher.launch_count(), 1);
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn unhealthy_warm_vm_fails_checkout_and_is_discarded() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = descriptor("a", 1);

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);
        pool.checkin("a", lease).await;

        probes.set_healthy(false);
        let err = pool.checkout(&agent).await.unwrap_err();
        assert!(matches!(err, PoolError::WarmUnhealthy { .. }));
        assert!(probes.destroyed());

        // The slot is free again; a retry cold-starts.
        let lease = pool.checkout(&agent).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn cold_start_failure_frees_the_slot() {
        let launcher = Arc::new(FakeLauncher::completing());
        launcher.fail_next_launch();
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = descriptor("a", 1);

        let err = pool.checkout(&agent).await.unwrap_err();
        assert!(matches!(err, PoolError::Provision(_)));

        let lease = pool.checkout(&agent).await.unwrap();
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn invalidate_agent_extracts_stateful_workspace() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = stateful_descriptor("keeper", "/srv/keeper-ws");

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);
        pool.checkin("keeper", lease).await;

        pool.invalidate_agent("keeper").await;

        assert!(probes.drained());
        assert_eq!(
            probes.extracted_to(),
            vec![PathBuf::from("/srv/keeper-ws")]
        );
        assert!(probes.destroyed());
    }

    #[tokio::test]
    async fn checkin_after_agent_invalidation_destroys_the_vm() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = descriptor("a", 1);

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);

        // Entry vanishes while the run is in flight.
        pool.invalidate_agent("a").await;
        assert!(!probes.destroyed(), "in-flight VM is not torn down");

        pool.checkin("a", lease).await;
        assert!(probes.destroyed());

        // And the cap slot is genuinely free.
        let lease = pool.checkout(&agent).await.unwrap();
        assert_eq!(launcher.launch_count(), 2);
        pool.checkin("a", lease).await;
    }

    #[tokio::test]
    async fn invalidate_vm_skips_workspace_extraction() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let agent = stateful_descriptor("keeper", "/srv/keeper-ws");

        let lease = pool.checkout(&agent).await.unwrap();
        let probes = launcher.probes(0);
        pool.invalidate_vm("keeper", lease).await;

        assert!(probes.destroyed());
        assert!(probes.extracted_to().is_empty());
    }

    #[tokio::test]
    async fn stateful_agents_run_one_vm_even_with_a_larger_limit() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));
        let mut agent = stateful_descriptor("keeper", "/srv/keeper-ws");
        agent.max_concurrent_vms = 5;

        let first = pool.checkout(&agent).await.unwrap();
        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            let agent = {
                let mut a = stateful_descriptor("keeper", "/srv/keeper-ws");
                a.max_concurrent_vms = 5;
                a
            };
            async move { pool.checkout(&agent).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        pool.checkin("keeper", first).await;
        let lease = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(launcher.launch_count(), 1);
        pool.checkin("keeper", lease).await;
    }

    #[tokio::test]
    async fn shutdown_tears_down_every_idle_entry() {
        let launcher = Arc::new(FakeLauncher::completing());
        let pool = pool_with(&launcher, Duration::from_secs(60));

        let lease_a = pool.checkout(&descriptor("a", 1)).await.unwrap();
        let lease_b = pool.checkout(&descriptor("b", 1)).await.unwrap();
        pool.checkin("a", lease_a).await;
        pool.checkin("b", lease_b).await;

        pool.shutdown().await;
        assert!(launcher.probes(0).destroyed());
        assert!(launcher.probes(1).destroyed());
    }
}
