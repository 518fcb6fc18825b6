// sbx-runtime: Per-sandbox state and supervision.
//
// The manager owns the sandbox table; each sandbox serializes mutation
// through its own mutex, publishes its preview registry through an atomic
// pointer for lock-free proxy reads, and gates workspace writers during
// snapshots.

pub mod files;
pub mod jobs;
pub mod manager;
pub mod promote;
pub mod quota;
pub mod sandbox;
pub mod supervisor;

pub use jobs::JobStatus;
pub use manager::{CreateOptions, SandboxManager};
pub use promote::{ContainerFallback, FallbackProvisioner, PromotedReplica};
pub use quota::QuotaBucket;
pub use sandbox::{PreviewTarget, Sandbox, SandboxStatus, UpstreamDescriptor};
