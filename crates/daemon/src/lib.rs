// Path-level filesystems and the FUSE bridge
pub mod fs;

// Task sandboxes and their per-root pools
pub mod mirror;
pub mod sandbox;

// Daemon glue
pub mod config;
pub mod worker;

pub use config::{ConfigError, FuseConfig, WorkerConfig};
pub use mirror::{Mirror, MirrorError};
pub use sandbox::{SandboxError, SandboxFs, SandboxOptions, SandboxState};
pub use worker::{Worker, WorkerError};

/// Whether this build can mount sandboxes.
pub const FUSE_ENABLED: bool = cfg!(feature = "fuse");
