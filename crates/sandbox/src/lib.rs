//! Policy-checked, resource-bounded command execution.
//!
//! Commands are screened against denial patterns, then run through the
//! platform backend with a pruned environment, CPU and wall-clock limits, and
//! bounded output capture. The whole process tree is terminated on timeout or
//! cancellation.

pub mod backend;
pub mod capture;
pub mod deny;
pub mod policy;
pub mod runner;

pub use backend::{ProcessHandle, ResourceLimits, SandboxBackend};
pub use deny::{DenyList, DenyPattern};
pub use policy::{NetworkIsolation, PolicyError, SandboxPolicy};
pub use runner::{CancelHandle, CommandSandbox, SandboxError};
