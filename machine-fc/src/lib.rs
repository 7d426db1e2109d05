mod api;
mod command;
mod network;
mod overlay;
mod paths;
mod prerequisites;
mod sse;
mod vm;

pub use network::{NetworkAllocator, NetworkError, NetworkLease};
pub use overlay::{GUEST_AGENT_PKG_DIR, OverlayError};
pub use paths::VmPaths;
pub use prerequisites::{HostConfig, check_host};
pub use vm::FirecrackerVm;
