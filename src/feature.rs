//! Feature operations (§4.3): schema-bound sub-records appended directly
//! onto a parent entity's own tessella log, gated by the parent's status.
use serde_json::{Map, Value as JsonValue};
use tracing::instrument;

use crate::entity;
use crate::error::{KernelError, KernelResult};
use crate::genus::{load_genus, validate_attributes};
use crate::ids::Ulid;
use crate::session::Session;
use crate::tessella::{FeatureState, TessellaStore, TessellaTag};

fn check_parent_editable(
    store: &TessellaStore,
    parent_id: Ulid,
    feature_genus_id: &Ulid,
) -> KernelResult<()> {
    let feature_genus = load_genus(store, feature_genus_id)?;
    let allowed = feature_genus.meta.editable_parent_statuses();
    if allowed.is_empty() {
        return Ok(());
    }
    let parent_res = store.get_res(&parent_id)?;
    let parent_state = entity::materialize(store, &parent_res.branch_id, parent_id)?;
    let status = parent_state.status.unwrap_or_default();
    if !allowed.iter().any(|s| s.eq_ignore_ascii_case(&status)) {
        return Err(KernelError::ParentNotEditable {
            parent_id: parent_id.to_string(),
            status,
        });
    }
    Ok(())
}

/// Append a new feature onto `parent_id`.
#[instrument(skip(store, attributes))]
pub fn create_feature(
    store: &TessellaStore,
    session: &Session,
    parent_id: Ulid,
    feature_genus_id: Ulid,
    attributes: Map<String, JsonValue>,
) -> KernelResult<Ulid> {
    check_parent_editable(store, parent_id, &feature_genus_id)?;
    let genus = load_genus(store, &feature_genus_id)?;
    let resolved = validate_attributes(&genus, &attributes)?;

    let feature_id = Ulid::new();
    store.append(
        parent_id,
        &session.branch_id,
        TessellaTag::FeatureCreated {
            feature_id,
            genus_id: feature_genus_id,
            attributes: Some(resolved),
        },
        None,
    )?;
    if let Some(initial) = genus.initial_state() {
        store.append(
            parent_id,
            &session.branch_id,
            TessellaTag::FeatureStatusChanged {
                feature_id,
                to: initial.name.clone(),
            },
            None,
        )?;
    }
    Ok(feature_id)
}

/// Set a single attribute on an existing feature.
pub fn set_feature_attribute(
    store: &TessellaStore,
    session: &Session,
    parent_id: Ulid,
    feature_id: Ulid,
    key: &str,
    value: JsonValue,
) -> KernelResult<()> {
    let feature = get_feature(store, &session.branch_id, parent_id, feature_id)?;
    let genus_id = feature.genus_id.ok_or_else(|| KernelError::NotFound {
        kind: "feature",
        id: feature_id.to_string(),
    })?;
    check_parent_editable(store, parent_id, &genus_id)?;
    let genus = load_genus(store, &genus_id)?;
    let def = genus.attributes.get(&key.to_lowercase()).ok_or_else(|| KernelError::SchemaInvalid {
        reason: format!("attribute '{key}' is not declared on this feature genus"),
    })?;
    if !def.attribute_type.accepts(&value) {
        return Err(KernelError::SchemaInvalid {
            reason: format!("attribute '{key}' expects {:?}, got {value}", def.attribute_type),
        });
    }
    store.append(
        parent_id,
        &session.branch_id,
        TessellaTag::FeatureAttributeSet {
            feature_id,
            key: key.to_string(),
            value,
        },
        None,
    )?;
    Ok(())
}

/// Transition a feature to an adjacent status on its own genus's graph.
pub fn transition_feature_status(
    store: &TessellaStore,
    session: &Session,
    parent_id: Ulid,
    feature_id: Ulid,
    to: &str,
) -> KernelResult<()> {
    let feature = get_feature(store, &session.branch_id, parent_id, feature_id)?;
    let genus_id = feature.genus_id.ok_or_else(|| KernelError::NotFound {
        kind: "feature",
        id: feature_id.to_string(),
    })?;
    check_parent_editable(store, parent_id, &genus_id)?;
    let genus = load_genus(store, &genus_id)?;
    let from = feature.status.unwrap_or_default();
    if !genus.has_direct_transition(&from, to) {
        return Err(KernelError::InvalidTransition {
            genus_id: genus_id.to_string(),
            from,
            to: to.to_string(),
        });
    }
    store.append(
        parent_id,
        &session.branch_id,
        TessellaTag::FeatureStatusChanged {
            feature_id,
            to: to.to_string(),
        },
        None,
    )?;
    Ok(())
}

/// Materialize one feature's current state from its parent's history.
pub fn get_feature(
    store: &TessellaStore,
    branch_id: &str,
    parent_id: Ulid,
    feature_id: Ulid,
) -> KernelResult<FeatureState> {
    let state = entity::materialize(store, branch_id, parent_id)?;
    state.features.get(&feature_id).cloned().ok_or_else(|| KernelError::NotFound {
        kind: "feature",
        id: feature_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genus::{define_genus, AttributeDef, AttributeType, GenusDiff, GenusKind, StateDef};
    use crate::ids::MAIN_BRANCH;

    fn parent_and_feature_genera(store: &TessellaStore) -> (Ulid, Ulid) {
        let parent_genus = Ulid::new();
        define_genus(
            store,
            parent_genus,
            "task",
            GenusKind::Entity,
            MAIN_BRANCH,
            GenusDiff {
                states: vec![
                    StateDef {
                        name: "open".into(),
                        initial: true,
                    },
                    StateDef {
                        name: "closed".into(),
                        initial: false,
                    },
                ],
                transitions: vec![crate::genus::TransitionDef {
                    from: "open".into(),
                    to: "closed".into(),
                    name: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();

        let feature_genus = Ulid::new();
        define_genus(
            store,
            feature_genus,
            "comment",
            GenusKind::Feature,
            MAIN_BRANCH,
            GenusDiff {
                meta: vec![(
                    "editable_parent_statuses".into(),
                    JsonValue::Array(vec![JsonValue::String("open".into())]),
                )],
                attributes: vec![AttributeDef {
                    name: "body".into(),
                    attribute_type: AttributeType::Text,
                    required: true,
                    default_value: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();
        (parent_genus, feature_genus)
    }

    #[test]
    fn create_feature_on_open_parent_succeeds() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let (parent_genus, feature_genus) = parent_and_feature_genera(&store);
        let parent_id = entity::create_entity(&store, &session, parent_genus, Map::new(), None).unwrap();

        let mut attrs = Map::new();
        attrs.insert("body".into(), JsonValue::String("hi".into()));
        let feature_id =
            create_feature(&store, &session, parent_id, feature_genus, attrs).unwrap();
        let feature = get_feature(&store, MAIN_BRANCH, parent_id, feature_id).unwrap();
        assert_eq!(feature.attributes.get("body").unwrap(), "hi");
    }

    #[test]
    fn create_feature_on_closed_parent_is_rejected() {
        let store = TessellaStore::new(0);
        let session = Session::main();
        let (parent_genus, feature_genus) = parent_and_feature_genera(&store);
        let parent_id = entity::create_entity(&store, &session, parent_genus, Map::new(), None).unwrap();
        entity::transition_status(&store, &session, parent_id, "closed").unwrap();

        let mut attrs = Map::new();
        attrs.insert("body".into(), JsonValue::String("hi".into()));
        let err = create_feature(&store, &session, parent_id, feature_genus, attrs).unwrap_err();
        assert!(matches!(err, KernelError::ParentNotEditable { .. }));
    }
}
