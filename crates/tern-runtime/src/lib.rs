pub mod lifecycle;
pub mod sandbox;

pub use lifecycle::{AcquireOutcome, SandboxLifecycleManager};
pub use sandbox::{
    env_fingerprint, ExecOutcome, SandboxCreateParams, SandboxInstance, SandboxProvider,
    SandboxState, ENV_FINGERPRINT_LABEL,
};
