//! In-memory VM fakes plugged in at the `VmHandle` / `VmLauncher` seams.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use machine::{
    AgentDescriptor, EventSink, ResourceProfile, Result, VmError, VmHandle, VmLauncher,
};
use serde_json::{Value, json};

pub fn descriptor(agent_id: &str, max_concurrent_vms: usize) -> AgentDescriptor {
    AgentDescriptor {
        agent_id: agent_id.to_string(),
        module_location: PathBuf::from("/opt/nightshift/agents").join(agent_id),
        resource_profile: ResourceProfile::default(),
        workspace_source: None,
        static_env: BTreeMap::new(),
        forward_env_names: Vec::new(),
        max_concurrent_vms,
        stateful: false,
    }
}

pub fn stateful_descriptor(agent_id: &str, workspace: &str) -> AgentDescriptor {
    AgentDescriptor {
        workspace_source: Some(PathBuf::from(workspace)),
        stateful: true,
        ..descriptor(agent_id, 0)
    }
}

/// Observation handles shared with a [`FakeVm`], surviving the handle's move
/// into the pool.
#[derive(Clone, Default)]
pub struct VmProbes {
    healthy: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
    drained: Arc<AtomicBool>,
    extracted: Arc<Mutex<Vec<PathBuf>>>,
}

impl VmProbes {
    fn new() -> Self {
        let probes = Self::default();
        probes.healthy.store(true, Ordering::SeqCst);
        probes
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn extracted_to(&self) -> Vec<PathBuf> {
        self.extracted.lock().unwrap().clone()
    }
}

/// What the next launched [`FakeVm`] should do.
#[derive(Clone)]
pub struct VmPlan {
    /// Events replayed by `wait_for_completion`, in order.
    pub script: Vec<(String, Value)>,
    pub fail_submit: bool,
}

impl VmPlan {
    pub fn completing() -> Self {
        Self {
            script: vec![
                ("nightshift.started".to_string(), json!({"workspace": "/workspace"})),
                ("agent.message".to_string(), json!({"text": "working"})),
                ("nightshift.completed".to_string(), json!({})),
            ],
            fail_submit: false,
        }
    }

    pub fn failing_submit() -> Self {
        Self {
            script: Vec::new(),
            fail_submit: true,
        }
    }

    /// A guest that emits some events and then drops the connection without
    /// a terminal event.
    pub fn hanging_up_after(script: Vec<(String, Value)>) -> Self {
        Self {
            script,
            fail_submit: false,
        }
    }
}

pub struct FakeVm {
    id: String,
    plan: VmPlan,
    probes: VmProbes,
}

#[async_trait]
impl VmHandle for FakeVm {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.probes.healthy.load(Ordering::SeqCst) && !self.probes.destroyed()
    }

    async fn submit_run(
        &self,
        _prompt: &str,
        _run_id: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self.plan.fail_submit {
            return Err(VmError::GuestProtocol("injected submit failure".to_string()));
        }
        Ok(())
    }

    async fn wait_for_completion(&self, run_id: &str, sink: &dyn EventSink) -> Result<()> {
        for (event_type, payload) in &self.plan.script {
            sink.publish(run_id, event_type, payload.clone()).await;
            if machine::is_terminal(event_type) {
                return Ok(());
            }
        }
        Err(VmError::StreamClosed)
    }

    async fn drain(&mut self) -> Result<()> {
        self.probes.drained.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn extract_workspace(&self, dest: &Path) -> Result<()> {
        self.probes.extracted.lock().unwrap().push(dest.to_path_buf());
        Ok(())
    }

    async fn destroy(&mut self) {
        self.probes.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Launcher that hands out scripted fakes and records every launch.
pub struct FakeLauncher {
    default_plan: VmPlan,
    queued: Mutex<VecDeque<VmPlan>>,
    probes: Mutex<Vec<VmProbes>>,
    launches: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeLauncher {
    /// Every launched VM runs to a clean `nightshift.completed`.
    pub fn completing() -> Self {
        Self::with_default(VmPlan::completing())
    }

    pub fn with_default(plan: VmPlan) -> Self {
        Self {
            default_plan: plan,
            queued: Mutex::new(VecDeque::new()),
            probes: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Queue a plan for the next launch, ahead of the default.
    pub fn queue(&self, plan: VmPlan) {
        self.queued.lock().unwrap().push_back(plan);
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Probes of the `index`-th launched VM.
    pub fn probes(&self, index: usize) -> VmProbes {
        self.probes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(&self, descriptor: &AgentDescriptor, vm_id: &str) -> Result<Box<dyn VmHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VmError::Provision("injected launch failure".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);

        let plan = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_plan.clone());
        let probes = VmProbes::new();
        self.probes.lock().unwrap().push(probes.clone());

        Ok(Box::new(FakeVm {
            id: format!("{}-{vm_id}", descriptor.agent_id),
            plan,
            probes,
        }))
    }
}
