//! The tessella store: an append-only, DashMap-indexed fact log.
//!
//! Grounded in the teacher's `CausalStorage` (`src/storage.rs`): a
//! concurrent map keyed by identity, with reads that never block writers to
//! other keys. Here the per-key value is an append-only `Vec<Tessella>`
//! rather than a single versioned cell, since every fact is kept forever.
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{KernelError, KernelResult};
use crate::ids::{SequenceGenerator, Ulid};

use super::{Res, Tessella, TessellaTag};

/// A per-branch cutoff used for branch-aware materialization: tessellae on
/// `branch_id` are visible only up to (and including) `max_tessella_id`.
/// `max_tessella_id = None` means "no cutoff" — used for the branch the
/// caller is actually standing on.
#[derive(Debug, Clone)]
pub struct BranchCutoff {
    pub branch_id: String,
    pub max_tessella_id: Option<u64>,
}

/// The append-only fact log plus the res identity table.
#[derive(Debug)]
pub struct TessellaStore {
    res: DashMap<Ulid, Res>,
    tessellae: DashMap<Ulid, Vec<Tessella>>,
    sequence: SequenceGenerator,
    /// Warn once history for a single res crosses this many tessellae (0 =
    /// never warn). Purely observational; never truncates a replay.
    replay_warn_threshold: usize,
}

impl TessellaStore {
    /// A fresh, empty store.
    pub fn new(replay_warn_threshold: usize) -> Self {
        Self {
            res: DashMap::new(),
            tessellae: DashMap::new(),
            sequence: SequenceGenerator::new(),
            replay_warn_threshold,
        }
    }

    /// Register a new res identity and append its `Created` tessella.
    /// Returns the res id.
    pub fn create_res(
        &self,
        id: Ulid,
        genus_id: Ulid,
        branch_id: &str,
        workspace_id: Option<Ulid>,
        source: Option<String>,
    ) -> KernelResult<Ulid> {
        if self.res.contains_key(&id) {
            return Err(KernelError::AlreadyExists {
                kind: "res",
                name: id.to_string(),
            });
        }
        let now = Utc::now();
        self.res.insert(
            id,
            Res {
                id,
                genus_id,
                branch_id: branch_id.to_string(),
                workspace_id,
                created_at: now,
            },
        );
        self.tessellae.insert(id, Vec::new());
        self.append(id, branch_id, TessellaTag::Created, source)?;
        debug!(res_id = %id, %genus_id, "res created");
        Ok(id)
    }

    /// Append one fact to a res's log on the caller's current branch.
    /// Allocates the next global sequence id.
    pub fn append(
        &self,
        res_id: Ulid,
        branch_id: &str,
        tag: TessellaTag,
        source: Option<String>,
    ) -> KernelResult<Tessella> {
        let mut entry = self
            .tessellae
            .get_mut(&res_id)
            .ok_or_else(|| KernelError::NotFound {
                kind: "res",
                id: res_id.to_string(),
            })?;
        let tessella = Tessella {
            id: self.sequence.next_id(),
            res_id,
            branch_id: branch_id.to_string(),
            tag,
            created_at: Utc::now(),
            source,
        };
        debug!(res_id = %res_id, branch_id, kind = tessella.tag.kind(), "tessella appended");
        entry.push(tessella.clone());
        if self.replay_warn_threshold > 0 && entry.len() > self.replay_warn_threshold {
            warn!(
                res_id = %res_id,
                count = entry.len(),
                "res history has grown past replay_warn_threshold"
            );
        }
        Ok(tessella)
    }

    /// Ingest a tessella with an id minted elsewhere (sync pull, merge
    /// replay). Bumps the local sequence past `tessella.id` so future local
    /// appends never collide with ids seen from peers.
    pub fn ingest(&self, tessella: Tessella) -> KernelResult<()> {
        if !self.res.contains_key(&tessella.res_id) {
            return Err(KernelError::NotFound {
                kind: "res",
                id: tessella.res_id.to_string(),
            });
        }
        let incoming_id = tessella.id;
        self.tessellae
            .get_mut(&tessella.res_id)
            .expect("res row vacated its tessella vec")
            .push(tessella);
        if incoming_id >= self.sequence.peek() {
            // best-effort: advance past any id we might otherwise reissue
            while self.sequence.peek() <= incoming_id {
                self.sequence.next_id();
            }
        }
        Ok(())
    }

    /// Register a res identity without appending a `Created` tessella,
    /// for sync pull where the `Created` tessella arrives as ordinary log
    /// content. No-op if the res is already known.
    pub fn ensure_res(
        &self,
        id: Ulid,
        genus_id: Ulid,
        branch_id: &str,
        workspace_id: Option<Ulid>,
    ) {
        self.res.entry(id).or_insert_with(|| Res {
            id,
            genus_id,
            branch_id: branch_id.to_string(),
            workspace_id,
            created_at: Utc::now(),
        });
        self.tessellae.entry(id).or_insert_with(Vec::new);
    }

    /// Insert a res row verbatim (preserving its original `created_at`),
    /// without appending a `Created` tessella. Used to restore a store from
    /// a persisted log, where the `Created` tessella arrives separately as
    /// ordinary log content.
    pub fn restore_res(&self, res: Res) {
        let id = res.id;
        self.res.entry(id).or_insert(res);
        self.tessellae.entry(id).or_insert_with(Vec::new);
    }

    /// Every res row currently known, for persistence snapshots.
    pub fn all_res(&self) -> Vec<Res> {
        self.res.iter().map(|e| e.value().clone()).collect()
    }

    /// Every tessella ever appended, across every res, ordered by global
    /// sequence id. Used for full-log persistence; not for hot read paths.
    pub fn all_tessellae_ordered(&self) -> Vec<Tessella> {
        let mut all: Vec<Tessella> = self.tessellae.iter().flat_map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// Look up a res's identity row.
    pub fn get_res(&self, res_id: &Ulid) -> KernelResult<Res> {
        self.res
            .get(res_id)
            .map(|r| r.clone())
            .ok_or_else(|| KernelError::NotFound {
                kind: "res",
                id: res_id.to_string(),
            })
    }

    /// Whether a res id is known to the store.
    pub fn contains_res(&self, res_id: &Ulid) -> bool {
        self.res.contains_key(res_id)
    }

    /// Full history for a res, sorted by global sequence id. Returns an
    /// empty vec for an unknown res rather than erroring, so read paths
    /// that fan out over many ids don't need per-id error handling.
    pub fn history(&self, res_id: &Ulid) -> Vec<Tessella> {
        let mut all = self
            .tessellae
            .get(res_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        all.sort_by_key(|t| t.id);
        all
    }

    /// History filtered and ordered per a branch chain's cutoffs (§4.6
    /// branch-aware materialization): a tessella is visible only if its
    /// `branch_id` has a cutoff entry, and (when the cutoff has a
    /// `max_tessella_id`) its id does not exceed it.
    pub fn history_for_branches(&self, res_id: &Ulid, cutoffs: &[BranchCutoff]) -> Vec<Tessella> {
        let mut visible: Vec<Tessella> = self
            .history(res_id)
            .into_iter()
            .filter(|t| {
                cutoffs.iter().any(|c| {
                    c.branch_id == t.branch_id
                        && c.max_tessella_id.map_or(true, |max| t.id <= max)
                })
            })
            .collect();
        visible.sort_by_key(|t| t.id);
        visible
    }

    /// Tessellae with `id > after`, in order — used by the sync protocol's
    /// pull to serve everything past a peer's watermark.
    pub fn history_since(&self, res_id: &Ulid, after: u64) -> Vec<Tessella> {
        self.history(res_id).into_iter().filter(|t| t.id > after).collect()
    }

    /// All known res ids whose genus is `genus_id`.
    pub fn res_ids_by_genus(&self, genus_id: &Ulid) -> Vec<Ulid> {
        self.res
            .iter()
            .filter(|e| e.genus_id == *genus_id)
            .map(|e| *e.key())
            .collect()
    }

    /// Every res id the store knows about. Used by sync push to find what
    /// might need sending, and by health checks to sweep all entities.
    pub fn all_res_ids(&self) -> Vec<Ulid> {
        self.res.iter().map(|e| *e.key()).collect()
    }

    /// The highest tessella id ever allocated locally (0 if none). Used as
    /// this node's sync watermark baseline.
    pub fn high_water_mark(&self) -> u64 {
        self.sequence.peek().saturating_sub(1)
    }
}
