mod agent;
mod config;
mod error;
mod events;
mod handle;

pub use agent::{AgentDescriptor, ResourceProfile, RunRequest};
pub use config::VmLaunchSpec;
pub use error::{Result, VmError};
pub use events::{
    ControlEvent, EVENT_COMPLETED, EVENT_ERROR, EVENT_INTERRUPTED, EVENT_STARTED, is_terminal,
};
pub use handle::{EventSink, VmHandle, VmLauncher};
