//! Identifiers used throughout the kernel.
//!
//! Res and genera are identified by ULIDs — lexicographically sortable by
//! creation time, which gives `Res::id` a natural creation order without a
//! second index. Tessellae are identified by a separate monotonic `u64`
//! global sequence (see [`crate::tessella::TessellaId`]) because ordering
//! *between* res only matters at the tessella level.

use std::sync::atomic::{AtomicU64, Ordering};

pub use ulid::Ulid;

/// Build a deterministic, all-zero-timestamp ULID for a built-in (sentinel)
/// concept. Sentinel ids never collide with user-generated ULIDs in
/// practice (those carry a real millisecond timestamp), and are fixed
/// across every node so that built-in genera bootstrap identically
/// everywhere without being synced.
const fn sentinel(discriminant: u128) -> Ulid {
    Ulid::from_parts(0, discriminant)
}

/// Sentinel ids for every built-in genus/concept. Fixed, all-zero-prefix,
/// bootstrapped on every node, excluded from sync and from user-facing
/// listings unless explicitly requested.
pub mod sentinel_ids {
    use super::{sentinel, Ulid};

    /// The meta-genus: the genus of all genera. A genus res's own
    /// `genus_id` points here.
    pub const META_GENUS: Ulid = sentinel(1);
    /// Built-in `Log` entity genus, used by `create_log` action side effects.
    pub const LOG_GENUS: Ulid = sentinel(2);
    /// Built-in `Error` entity genus (`open -> acknowledged`).
    pub const ERROR_GENUS: Ulid = sentinel(3);
    /// Built-in `Task` entity genus for process/action-driven work items.
    pub const TASK_GENUS: Ulid = sentinel(4);
    /// Built-in `Branch` entity genus.
    pub const BRANCH_GENUS: Ulid = sentinel(5);
    /// Built-in `Taxonomy` entity genus (`active <-> archived`).
    pub const TAXONOMY_GENUS: Ulid = sentinel(6);
    /// Built-in recurring `CronSchedule` entity genus.
    pub const CRON_SCHEDULE_GENUS: Ulid = sentinel(7);
    /// Built-in one-shot `ScheduledTrigger` entity genus.
    pub const SCHEDULED_TRIGGER_GENUS: Ulid = sentinel(8);
    /// Built-in `Workspace` entity genus.
    pub const WORKSPACE_GENUS: Ulid = sentinel(9);
    /// Built-in `Science` entity genus (`active <-> archived`).
    pub const SCIENCE_GENUS: Ulid = sentinel(10);
    /// Built-in `Device` entity genus, registered on first sync from an
    /// unknown device id.
    pub const DEVICE_GENUS: Ulid = sentinel(11);
    /// Built-in `ActionTaken` audit-record genus, one res per executed
    /// action, carrying the bindings/params it ran with (§4.4 step 5).
    pub const ACTION_TAKEN_GENUS: Ulid = sentinel(12);

    /// The default taxonomy every node bootstraps with.
    pub const DEFAULT_TAXONOMY: Ulid = sentinel(100);
    /// The default science every node bootstraps with.
    pub const DEFAULT_SCIENCE: Ulid = sentinel(101);

    /// All sentinel genus ids, for membership checks (e.g. sync exclusion,
    /// listing filters).
    pub const ALL_SENTINEL_GENERA: &[Ulid] = &[
        META_GENUS,
        LOG_GENUS,
        ERROR_GENUS,
        TASK_GENUS,
        BRANCH_GENUS,
        TAXONOMY_GENUS,
        CRON_SCHEDULE_GENUS,
        SCHEDULED_TRIGGER_GENUS,
        WORKSPACE_GENUS,
        SCIENCE_GENUS,
        DEVICE_GENUS,
        ACTION_TAKEN_GENUS,
    ];

    /// Whether a genus id names one of the built-in sentinel genera.
    pub fn is_sentinel_genus(id: &Ulid) -> bool {
        ALL_SENTINEL_GENERA.contains(id)
    }

    /// Whether a res id is itself a sentinel (currently only the
    /// bootstrapped default taxonomy/science carry fixed ids; entities
    /// created under sentinel genera still get fresh random ULIDs).
    pub fn is_sentinel_res(id: &Ulid) -> bool {
        *id == DEFAULT_TAXONOMY || *id == DEFAULT_SCIENCE || is_sentinel_genus(id)
    }
}

/// The default branch name every workspace starts on.
pub const MAIN_BRANCH: &str = "main";

/// Monotonic global sequence generator for tessella ids.
///
/// A single counter is shared across all res and branches so ordering is
/// total: the reducer, branch replay, and merge all depend on this.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Create a generator starting at 1 (0 is reserved/unused so `Option<u64>`
    /// cutoffs can use 0 to mean "before anything").
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Restore a generator to continue after `last_used`.
    pub fn resume_after(last_used: u64) -> Self {
        Self {
            next: AtomicU64::new(last_used + 1),
        }
    }

    /// Allocate the next id in the sequence.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Peek at the next id without allocating it.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_ids_are_stable_and_distinct() {
        assert_eq!(sentinel_ids::META_GENUS, sentinel_ids::META_GENUS);
        assert_ne!(sentinel_ids::META_GENUS, sentinel_ids::LOG_GENUS);
        assert_eq!(sentinel_ids::ALL_SENTINEL_GENERA.len(), 12);
    }

    #[test]
    fn sequence_generator_is_monotonic() {
        let gen = SequenceGenerator::new();
        let a = gen.next_id();
        let b = gen.next_id();
        let c = gen.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn resume_after_continues_sequence() {
        let gen = SequenceGenerator::resume_after(41);
        assert_eq!(gen.next_id(), 42);
    }
}
