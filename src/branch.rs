//! Branching and merging (§4.6).
//!
//! A branch is itself a `Branch` sentinel entity: its attributes record
//! the parent branch name and the tessella id it forked from. Branch-aware
//! materialization (used throughout `entity`/`feature`/`relationship`)
//! walks this chain to build the cutoff list a reducer fold is filtered
//! through.
use std::collections::HashSet;

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, instrument};

use crate::entity::{self, EntityFilter};
use crate::error::{KernelError, KernelResult};
use crate::ids::{sentinel_ids, Ulid, MAIN_BRANCH};
use crate::session::Session;
use crate::tessella::store::BranchCutoff;
use crate::tessella::{TessellaStore, TessellaTag};

fn find_branch_entity(store: &TessellaStore, branch_id: &str) -> KernelResult<Option<Ulid>> {
    let filter = EntityFilter {
        attribute_equals: Some(("name".to_string(), JsonValue::String(branch_id.to_string()))),
        ..Default::default()
    };
    let matches = entity::list_entities(store, MAIN_BRANCH, sentinel_ids::BRANCH_GENUS, &filter)?;
    Ok(matches.into_iter().next().map(|(id, _)| id))
}

/// Create a new branch forking from `parent_branch_id` at the store's
/// current high-water mark.
#[instrument(skip(store))]
pub fn create_branch(
    store: &TessellaStore,
    session: &Session,
    name: &str,
    parent_branch_id: &str,
) -> KernelResult<Ulid> {
    if name == MAIN_BRANCH {
        return Err(KernelError::AlreadyExists {
            kind: "branch",
            name: name.to_string(),
        });
    }
    if find_branch_entity(store, name)?.is_some() {
        return Err(KernelError::AlreadyExists {
            kind: "branch",
            name: name.to_string(),
        });
    }
    if parent_branch_id != MAIN_BRANCH && find_branch_entity(store, parent_branch_id)?.is_none() {
        return Err(KernelError::NotFound {
            kind: "branch",
            id: parent_branch_id.to_string(),
        });
    }

    let cutoff = store.high_water_mark();
    let mut attrs = Map::new();
    attrs.insert("name".to_string(), JsonValue::String(name.to_string()));
    attrs.insert(
        "parent_branch_id".to_string(),
        JsonValue::String(parent_branch_id.to_string()),
    );
    attrs.insert("cutoff_tessella_id".to_string(), JsonValue::from(cutoff));

    let branch_session = Session {
        branch_id: MAIN_BRANCH.to_string(),
        workspace_id: session.workspace_id,
    };
    let id = entity::create_entity(store, &branch_session, sentinel_ids::BRANCH_GENUS, attrs, None)?;
    debug!(branch = name, parent = parent_branch_id, cutoff, "branch created");
    Ok(id)
}

/// Resolve the cutoff chain for `branch_id`: itself (unrestricted) followed
/// by each ancestor up to `main`, each bounded by the tessella id it was
/// forked at.
pub fn cutoffs_for(store: &TessellaStore, branch_id: &str) -> KernelResult<Vec<BranchCutoff>> {
    let mut cutoffs = vec![BranchCutoff {
        branch_id: branch_id.to_string(),
        max_tessella_id: None,
    }];
    let mut current = branch_id.to_string();
    let mut seen = HashSet::new();
    seen.insert(current.clone());

    while current != MAIN_BRANCH {
        let branch_entity_id = find_branch_entity(store, &current)?.ok_or_else(|| KernelError::NotFound {
            kind: "branch",
            id: current.clone(),
        })?;
        let state = entity::materialize(store, MAIN_BRANCH, branch_entity_id)?;
        let parent = state
            .attributes
            .get("parent_branch_id")
            .and_then(|v| v.as_str())
            .unwrap_or(MAIN_BRANCH)
            .to_string();
        let cutoff_id = state
            .attributes
            .get("cutoff_tessella_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if !seen.insert(parent.clone()) {
            return Err(KernelError::SchemaInvalid {
                reason: format!("branch ancestry cycle detected at '{parent}'"),
            });
        }
        cutoffs.push(BranchCutoff {
            branch_id: parent.clone(),
            max_tessella_id: Some(cutoff_id),
        });
        current = parent;
    }
    Ok(cutoffs)
}

/// A res touched by tessellae appended strictly after the common ancestor
/// cutoff, on either side being compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TouchedRes(pub Ulid);

/// Find every res touched on `branch_id` since it forked from `other`'s
/// lineage. When `branch_id` is an ancestor of `other` (the common case:
/// `branch_id` is `main`, `other` is the feature branch being merged in),
/// `other`'s own cutoff chain already records the tessella id `other`
/// forked at — only tessellae appended to `branch_id` strictly after that
/// point count as "touched". Without this bound, every tessella ever
/// recorded on `branch_id` (including history from long before `other`
/// existed) would count, and any res edited on `branch_id` pre-fork would
/// wrongly collide with `other`'s post-fork edits.
///
/// If `branch_id` doesn't appear in `other`'s chain (no ancestor
/// relationship between the two), falls back to `branch_id`'s entire own
/// history — there is no shared fork point to bound by.
fn touched_since_fork(store: &TessellaStore, branch_id: &str, other: &str) -> KernelResult<HashSet<Ulid>> {
    let bound = cutoffs_for(store, other)?
        .into_iter()
        .find(|c| c.branch_id == branch_id)
        .and_then(|c| c.max_tessella_id);

    let mut touched = HashSet::new();
    for id in store.all_res_ids() {
        let touched_here = store
            .history(&id)
            .into_iter()
            .any(|t| t.branch_id == branch_id && bound.map_or(true, |max| t.id > max));
        if touched_here {
            touched.insert(id);
        }
    }
    Ok(touched)
}

/// Compare two branches, returning the res ids each has touched since
/// their common ancestor (§4.6 conflict detection).
pub fn compare_branches(
    store: &TessellaStore,
    left: &str,
    right: &str,
) -> KernelResult<(HashSet<Ulid>, HashSet<Ulid>)> {
    Ok((
        touched_since_fork(store, left, right)?,
        touched_since_fork(store, right, left)?,
    ))
}

/// Merge `source` into `target`. Without `force`, any res touched on both
/// sides since their common ancestor is a conflict and the merge is
/// rejected wholesale (§4.6, §7 `MergeConflict`) — there is no partial or
/// per-field merge.
///
/// On success, every tessella unique to `source` is replayed onto `target`
/// with fresh tessella ids (preserving relative order) and tagged
/// `source = "merge:<name>"`, so the merge itself is an ordinary,
/// inspectable part of the log.
#[instrument(skip(store))]
pub fn merge_branch(
    store: &TessellaStore,
    target: &str,
    source: &str,
    force: bool,
) -> KernelResult<usize> {
    let (target_touched, source_touched) = compare_branches(store, target, source)?;
    let conflicts: Vec<&Ulid> = target_touched.intersection(&source_touched).collect();
    if !conflicts.is_empty() && !force {
        return Err(KernelError::MergeConflict(conflicts.len()));
    }

    let source_cutoffs = cutoffs_for(store, source)?;
    let own_cutoff = source_cutoffs
        .first()
        .expect("cutoffs_for always yields at least the branch itself");

    let mut replayed = 0usize;
    let mut res_ids: Vec<Ulid> = source_touched.into_iter().collect();
    res_ids.sort();
    for res_id in res_ids {
        if !store.contains_res(&res_id) {
            continue;
        }
        let history = store.history_for_branches(&res_id, std::slice::from_ref(own_cutoff));
        for tessella in history {
            if matches!(tessella.tag, TessellaTag::Created) {
                continue;
            }
            store.append(
                res_id,
                target,
                tessella.tag,
                Some(format!("merge:{source}")),
            )?;
            replayed += 1;
        }
    }
    debug!(target, source, replayed, "branch merged");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genus::{define_genus, GenusDiff, GenusKind};

    fn widget_genus(store: &TessellaStore) -> Ulid {
        let genus_id = Ulid::new();
        define_genus(
            store,
            genus_id,
            "widget",
            GenusKind::Entity,
            MAIN_BRANCH,
            GenusDiff {
                attributes: vec![crate::genus::AttributeDef {
                    name: "title".into(),
                    attribute_type: crate::genus::AttributeType::Text,
                    required: false,
                    default_value: Some(JsonValue::String("".into())),
                }],
                ..Default::default()
            },
        )
        .unwrap();
        genus_id
    }

    #[test]
    fn create_branch_and_resolve_cutoffs() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        create_branch(&store, &session, "feature-x", MAIN_BRANCH).unwrap();
        let cutoffs = cutoffs_for(&store, "feature-x").unwrap();
        assert_eq!(cutoffs[0].branch_id, "feature-x");
        assert_eq!(cutoffs[1].branch_id, MAIN_BRANCH);
    }

    #[test]
    fn merge_replays_non_conflicting_changes() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("a".into()));
        let id = entity::create_entity(&store, &session, genus_id, attrs, None).unwrap();

        create_branch(&store, &session, "feature-x", MAIN_BRANCH).unwrap();
        let branch_session = Session::on_branch("feature-x");
        entity::set_attribute(&store, &branch_session, id, "title", JsonValue::String("b".into()))
            .unwrap();

        let replayed = merge_branch(&store, MAIN_BRANCH, "feature-x", false).unwrap();
        assert_eq!(replayed, 1);
        let state = entity::materialize(&store, MAIN_BRANCH, id).unwrap();
        assert_eq!(state.attributes.get("title").unwrap(), "b");
    }

    #[test]
    fn merge_rejects_conflicting_changes_without_force() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("a".into()));
        let id = entity::create_entity(&store, &session, genus_id, attrs, None).unwrap();

        create_branch(&store, &session, "feature-x", MAIN_BRANCH).unwrap();
        let branch_session = Session::on_branch("feature-x");
        entity::set_attribute(&store, &branch_session, id, "title", JsonValue::String("b".into()))
            .unwrap();
        entity::set_attribute(&store, &session, id, "title", JsonValue::String("c".into())).unwrap();

        let err = merge_branch(&store, MAIN_BRANCH, "feature-x", false).unwrap_err();
        assert!(matches!(err, KernelError::MergeConflict(1)));
    }
}
