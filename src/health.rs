//! Health evaluation (§4.9): a read-only sweep for schema drift and
//! unacknowledged errors, never a mutation.
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::entity::{self, EntityFilter};
use crate::error::KernelResult;
use crate::genus::{load_genus, AttributeType};
use crate::ids::{sentinel_ids, Ulid, MAIN_BRANCH};
use crate::tessella::EntityState;

/// One detected problem with an entity's current state relative to its genus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthIssue {
    /// A required attribute (no default) is absent from the entity's state.
    MissingRequiredAttribute { attribute: String },
    /// An attribute's stored value no longer matches its declared type —
    /// reachable if the genus evolved an attribute's type is not actually
    /// possible (evolution forbids retyping), but a value could still be
    /// malformed if written outside the kernel's own validation path.
    AttributeTypeMismatch { attribute: String, expected: AttributeType },
    /// The entity's current status is not one of the genus's declared states.
    InvalidStatus { status: String },
    /// An `Error` entity referencing this entity is still `open`.
    UnacknowledgedError { error_id: Ulid },
}

/// Evaluate one entity's health against its genus.
#[instrument(skip(store))]
pub fn evaluate_health(
    store: &crate::tessella::TessellaStore,
    branch_id: &str,
    entity_id: Ulid,
) -> KernelResult<Vec<HealthIssue>> {
    let res = store.get_res(&entity_id)?;
    let genus = load_genus(store, &res.genus_id)?;
    let state = entity::materialize(store, branch_id, entity_id)?;
    let mut issues = Vec::new();

    for def in genus.attributes.values() {
        match state.attributes.get(&def.name) {
            Some(value) => {
                if !def.attribute_type.accepts(value) {
                    issues.push(HealthIssue::AttributeTypeMismatch {
                        attribute: def.name.clone(),
                        expected: def.attribute_type,
                    });
                }
            }
            None if def.required && def.default_value.is_none() => {
                issues.push(HealthIssue::MissingRequiredAttribute {
                    attribute: def.name.clone(),
                });
            }
            None => {}
        }
    }

    if !genus.states.is_empty() {
        if let Some(status) = &state.status {
            if !genus.has_state(status) {
                issues.push(HealthIssue::InvalidStatus { status: status.clone() });
            }
        }
    }

    for error_id in unacknowledged_errors_for(store, branch_id, entity_id, &state)? {
        issues.push(HealthIssue::UnacknowledgedError { error_id });
    }

    Ok(issues)
}

/// `Error` entities naming `entity_id` as their `source_entity_id` that
/// are still in the `open` status.
fn unacknowledged_errors_for(
    store: &crate::tessella::TessellaStore,
    branch_id: &str,
    entity_id: Ulid,
    _state: &EntityState,
) -> KernelResult<Vec<Ulid>> {
    let filter = EntityFilter {
        status: Some("open".to_string()),
        attribute_equals: Some((
            "source_entity_id".to_string(),
            serde_json::Value::String(entity_id.to_string()),
        )),
        ..Default::default()
    };
    let matches = entity::list_entities(store, branch_id, sentinel_ids::ERROR_GENUS, &filter)?;
    Ok(matches.into_iter().map(|(id, _)| id).collect())
}

/// Every entity of `genus_id` that has at least one health issue.
#[instrument(skip(store))]
pub fn list_unhealthy(
    store: &crate::tessella::TessellaStore,
    branch_id: &str,
    genus_id: Ulid,
) -> KernelResult<Vec<(Ulid, Vec<HealthIssue>)>> {
    let mut out = Vec::new();
    for id in store.res_ids_by_genus(&genus_id) {
        let issues = evaluate_health(store, branch_id, id)?;
        if !issues.is_empty() {
            out.push((id, issues));
        }
    }
    out.sort_by_key(|(id, _)| *id);
    Ok(out)
}

/// Every `Error` entity across the whole store still in the `open` status,
/// regardless of which entity genus they reference — used by an embedder's
/// own dashboard/alerting, not by the kernel itself.
pub fn list_all_unacknowledged_errors(
    store: &crate::tessella::TessellaStore,
) -> KernelResult<Vec<Ulid>> {
    let filter = EntityFilter {
        status: Some("open".to_string()),
        ..Default::default()
    };
    let matches = entity::list_entities(store, MAIN_BRANCH, sentinel_ids::ERROR_GENUS, &filter)?;
    Ok(matches.into_iter().map(|(id, _)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genus::{define_genus, AttributeDef, GenusDiff, GenusKind};
    use crate::session::Session;
    use serde_json::Map;

    #[test]
    fn missing_required_attribute_without_default_is_flagged() {
        let store = crate::tessella::TessellaStore::new(0);
        let session = Session::main();
        let genus_id = Ulid::new();
        define_genus(
            &store,
            genus_id,
            "widget",
            GenusKind::Entity,
            MAIN_BRANCH,
            GenusDiff {
                attributes: vec![AttributeDef {
                    name: "title".into(),
                    attribute_type: AttributeType::Text,
                    required: true,
                    default_value: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();

        // Bypass validate_attributes to simulate state drift: attribute
        // declared required with no value ever set.
        let id = Ulid::new();
        store.create_res(id, genus_id, MAIN_BRANCH, None, None).unwrap();

        let issues = evaluate_health(&store, MAIN_BRANCH, id).unwrap();
        assert!(issues.contains(&HealthIssue::MissingRequiredAttribute { attribute: "title".into() }));
        let _ = session;
    }
}
