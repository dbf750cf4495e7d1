//! Tessera: an event-sourced knowledge kernel.
//!
//! Facts ("tessellae") are appended to identities ("res") and never
//! mutated; every derived shape — entity state, genus schema, relationship
//! membership — is a pure fold over that log (§3, §9). The crate's public
//! surface is [`Kernel`], a library facade; there is no bundled transport,
//! CLI, or storage backend beyond the in-memory store (§1, §6).
pub mod action;
pub mod branch;
pub mod config;
pub mod cron;
pub mod entity;
pub mod error;
pub mod feature;
pub mod genus;
pub mod health;
pub mod ids;
pub mod kernel;
pub mod persistence;
pub mod process;
pub mod relationship;
pub mod scheduler;
pub mod sentinel;
pub mod session;
pub mod sync;
pub mod task;
pub mod tessella;
pub mod workspace;

pub use error::{KernelError, KernelResult};
pub use ids::Ulid;
pub use kernel::Kernel;
pub use session::Session;

/// Common imports for embedders.
pub mod prelude {
    pub use crate::config::KernelConfig;
    pub use crate::error::{KernelError, KernelResult};
    pub use crate::genus::{AttributeDef, AttributeType, Cardinality, GenusDiff, GenusKind, RoleDef, StateDef, TransitionDef};
    pub use crate::ids::Ulid;
    pub use crate::kernel::Kernel;
    pub use crate::session::Session;
}

/// Initialize `tracing` output from the `TESSERA_LOG` environment variable
/// (same shape as `RUST_LOG`), defaulting to `info` if unset.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize `tracing` output with `default_level` used when `TESSERA_LOG`
/// is unset. Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging_with_level(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("TESSERA_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = fmt().with_env_filter(filter).try_init();
}
