//! Entity operations (§4.3): plain schema-bound res with attributes and,
//! optionally, a finite-state status.
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, instrument};

use crate::branch::cutoffs_for;
use crate::error::{KernelError, KernelResult};
use crate::genus::{load_genus, validate_attributes};
use crate::ids::Ulid;
use crate::session::Session;
use crate::tessella::{reduce_entity, EntityState, TessellaStore, TessellaTag};

/// Create a new entity of `genus_id`.
///
/// If `target_status` is given and the genus is stateful, the entity is
/// walked from the genus's initial state to `target_status` via the
/// shortest transition path (BFS, §4.3) rather than requiring the caller
/// to replay every intermediate status themselves.
#[instrument(skip(store, attributes))]
pub fn create_entity(
    store: &TessellaStore,
    session: &Session,
    genus_id: Ulid,
    attributes: Map<String, JsonValue>,
    target_status: Option<&str>,
) -> KernelResult<Ulid> {
    let genus = load_genus(store, &genus_id)?;
    if genus.meta.deprecated() {
        return Err(KernelError::GenusDeprecated {
            genus_id: genus_id.to_string(),
        });
    }
    let resolved = validate_attributes(&genus, &attributes)?;

    // Resolve the BFS path (if any) before appending a single tessella, so
    // an unreachable target_status raises NoTransitionPath with nothing
    // recorded — never a half-created res (§7, §8 S2).
    let initial = genus.initial_state();
    let path = match (&initial, target_status) {
        (None, Some(_)) => {
            return Err(KernelError::SchemaInvalid {
                reason: "target_status given but genus declares no states".to_string(),
            });
        }
        (None, None) => None,
        (Some(initial), None) => Some(vec![initial.name.clone()]),
        (Some(initial), Some(target)) if target.to_lowercase() == initial.name.to_lowercase() => {
            Some(vec![initial.name.clone()])
        }
        (Some(initial), Some(target)) => Some(genus.bfs_path(&initial.name, target).ok_or_else(|| {
            KernelError::NoTransitionPath {
                genus_id: genus_id.to_string(),
                target: target.to_string(),
                reachable: genus.reachable_from(&initial.name),
            }
        })?),
    };

    let id = Ulid::new();
    store.create_res(id, genus_id, &session.branch_id, session.workspace_id, None)?;
    for (key, value) in resolved {
        store.append(
            id,
            &session.branch_id,
            TessellaTag::AttributeSet { key, value },
            None,
        )?;
    }

    if let Some(path) = path {
        if path.len() == 1 {
            store.append(
                id,
                &session.branch_id,
                TessellaTag::StatusChanged {
                    from: None,
                    to: path[0].clone(),
                },
                None,
            )?;
        } else {
            for pair in path.windows(2) {
                store.append(
                    id,
                    &session.branch_id,
                    TessellaTag::StatusChanged {
                        from: Some(pair[0].clone()),
                        to: pair[1].clone(),
                    },
                    None,
                )?;
            }
        }
    }

    debug!(entity_id = %id, %genus_id, "entity created");
    Ok(id)
}

/// Set a single attribute on an existing entity.
pub fn set_attribute(
    store: &TessellaStore,
    session: &Session,
    entity_id: Ulid,
    key: &str,
    value: JsonValue,
) -> KernelResult<()> {
    let res = store.get_res(&entity_id)?;
    let genus = load_genus(store, &res.genus_id)?;
    let def = genus.attributes.get(&key.to_lowercase()).ok_or_else(|| {
        KernelError::SchemaInvalid {
            reason: format!("attribute '{key}' is not declared on this genus"),
        }
    })?;
    if !def.attribute_type.accepts(&value) {
        return Err(KernelError::SchemaInvalid {
            reason: format!("attribute '{key}' expects {:?}, got {value}", def.attribute_type),
        });
    }
    store.append(
        entity_id,
        &session.branch_id,
        TessellaTag::AttributeSet {
            key: key.to_string(),
            value,
        },
        None,
    )?;
    Ok(())
}

/// Transition an entity directly to an adjacent status. Rejects any
/// request that is not a single edge in the genus's transition graph —
/// use [`transition_to`] for BFS-driven multi-hop transitions.
pub fn transition_status(
    store: &TessellaStore,
    session: &Session,
    entity_id: Ulid,
    to: &str,
) -> KernelResult<()> {
    let res = store.get_res(&entity_id)?;
    let genus = load_genus(store, &res.genus_id)?;
    let state = materialize(store, &res.branch_id, entity_id)?;
    let from = state.status.clone().unwrap_or_default();
    if !genus.has_direct_transition(&from, to) {
        return Err(KernelError::InvalidTransition {
            genus_id: res.genus_id.to_string(),
            from,
            to: to.to_string(),
        });
    }
    store.append(
        entity_id,
        &session.branch_id,
        TessellaTag::StatusChanged {
            from: Some(from),
            to: to.to_string(),
        },
        None,
    )?;
    Ok(())
}

/// Transition an entity to `target`, via the genus's shortest transition
/// path if `target` is not directly adjacent to the entity's current
/// status (§4.3, §7 `NoTransitionPath`).
pub fn transition_to(
    store: &TessellaStore,
    session: &Session,
    entity_id: Ulid,
    target: &str,
) -> KernelResult<()> {
    let res = store.get_res(&entity_id)?;
    let genus = load_genus(store, &res.genus_id)?;
    let state = materialize(store, &res.branch_id, entity_id)?;
    let from = state.status.clone().unwrap_or_default();
    walk_to_status(store, session, entity_id, &genus, &from, target)
}

fn walk_to_status(
    store: &TessellaStore,
    session: &Session,
    entity_id: Ulid,
    genus: &crate::genus::GenusDef,
    from: &str,
    target: &str,
) -> KernelResult<()> {
    let path = genus.bfs_path(from, target).ok_or_else(|| KernelError::NoTransitionPath {
        genus_id: entity_id.to_string(),
        target: target.to_string(),
        reachable: genus.reachable_from(from),
    })?;
    for pair in path.windows(2) {
        store.append(
            entity_id,
            &session.branch_id,
            TessellaTag::StatusChanged {
                from: Some(pair[0].clone()),
                to: pair[1].clone(),
            },
            None,
        )?;
    }
    Ok(())
}

/// Materialize an entity's current state on the branch it was created on
/// (branch-aware: ancestor branches are folded in up to their cutoff).
pub fn materialize(store: &TessellaStore, branch_id: &str, entity_id: Ulid) -> KernelResult<EntityState> {
    let cutoffs = cutoffs_for(store, branch_id)?;
    let history = store.history_for_branches(&entity_id, &cutoffs);
    Ok(reduce_entity(&history))
}

/// Criteria for [`list_entities`].
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub status: Option<String>,
    pub attribute_equals: Option<(String, JsonValue)>,
    pub limit: Option<usize>,
}

/// List every entity of `genus_id` on `branch_id` matching `filter`.
pub fn list_entities(
    store: &TessellaStore,
    branch_id: &str,
    genus_id: Ulid,
    filter: &EntityFilter,
) -> KernelResult<Vec<(Ulid, EntityState)>> {
    let mut out = Vec::new();
    for id in store.res_ids_by_genus(&genus_id) {
        let state = materialize(store, branch_id, id)?;
        if let Some(status) = &filter.status {
            if state.status.as_deref() != Some(status.as_str()) {
                continue;
            }
        }
        if let Some((key, value)) = &filter.attribute_equals {
            if state.attributes.get(key) != Some(value) {
                continue;
            }
        }
        out.push((id, state));
        if let Some(limit) = filter.limit {
            if out.len() >= limit {
                break;
            }
        }
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
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
            "main",
            GenusDiff {
                states: vec![
                    crate::genus::StateDef {
                        name: "draft".into(),
                        initial: true,
                    },
                    crate::genus::StateDef {
                        name: "active".into(),
                        initial: false,
                    },
                    crate::genus::StateDef {
                        name: "archived".into(),
                        initial: false,
                    },
                    crate::genus::StateDef {
                        name: "orphan".into(),
                        initial: false,
                    },
                ],
                transitions: vec![
                    crate::genus::TransitionDef {
                        from: "draft".into(),
                        to: "active".into(),
                        name: None,
                    },
                    crate::genus::TransitionDef {
                        from: "active".into(),
                        to: "archived".into(),
                        name: None,
                    },
                ],
                attributes: vec![crate::genus::AttributeDef {
                    name: "title".into(),
                    attribute_type: crate::genus::AttributeType::Text,
                    required: true,
                    default_value: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();
        genus_id
    }

    #[test]
    fn create_entity_walks_bfs_to_target_status() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("thing".into()));
        let id = create_entity(&store, &session, genus_id, attrs, Some("archived")).unwrap();
        let state = materialize(&store, "main", id).unwrap();
        assert_eq!(state.status.as_deref(), Some("archived"));
    }

    #[test]
    fn create_entity_with_unreachable_target_leaves_no_trace() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("thing".into()));

        let before = store.all_res_ids().len();
        let err = create_entity(&store, &session, genus_id, attrs, Some("orphan")).unwrap_err();
        assert!(matches!(err, KernelError::NoTransitionPath { .. }));
        assert_eq!(store.all_res_ids().len(), before, "a failed create must not append a half-created res");
    }

    #[test]
    fn direct_transition_rejects_non_adjacent_status() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("thing".into()));
        let id = create_entity(&store, &session, genus_id, attrs, None).unwrap();
        let err = transition_status(&store, &session, id, "archived").unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[test]
    fn list_entities_filters_by_status() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = widget_genus(&store);
        let mut attrs = Map::new();
        attrs.insert("title".into(), JsonValue::String("a".into()));
        create_entity(&store, &session, genus_id, attrs.clone(), None).unwrap();
        create_entity(&store, &session, genus_id, attrs, Some("active")).unwrap();

        let filter = EntityFilter {
            status: Some("active".into()),
            ..Default::default()
        };
        let results = list_entities(&store, "main", genus_id, &filter).unwrap();
        assert_eq!(results.len(), 1);
    }
}
