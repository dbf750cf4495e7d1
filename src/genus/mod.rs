//! Genus definition, validation, and additive evolution (§4.2).
pub mod types;

use serde_json::Value as JsonValue;

use crate::error::{KernelError, KernelResult};
use crate::ids::Ulid;
use crate::tessella::{reduce_genus, TessellaStore, TessellaTag};

pub use types::{
    AttributeDef, AttributeType, Cardinality, GenusDef, GenusKind, GenusMeta, RoleDef, StateDef,
    TransitionDef,
};

/// A not-yet-appended additive diff against an existing genus, or the
/// full initial shape of a brand-new one. `define_*` and `evolve_genus`
/// both funnel through this so there is exactly one place that decides
/// what "additive" means (§3: genera evolve additively only).
#[derive(Debug, Clone, Default)]
pub struct GenusDiff {
    pub meta: Vec<(String, JsonValue)>,
    pub attributes: Vec<AttributeDef>,
    pub states: Vec<StateDef>,
    pub transitions: Vec<TransitionDef>,
    pub roles: Vec<RoleDef>,
}

/// Materialize a genus's current definition by replaying its tessellae.
pub fn load_genus(store: &TessellaStore, genus_id: &Ulid) -> KernelResult<GenusDef> {
    if !store.contains_res(genus_id) {
        return Err(KernelError::NotFound {
            kind: "genus",
            id: genus_id.to_string(),
        });
    }
    Ok(reduce_genus(&store.history(genus_id)))
}

/// Create a brand-new genus res and append its initial defining tessellae.
pub fn define_genus(
    store: &TessellaStore,
    genus_id: Ulid,
    name: &str,
    kind: GenusKind,
    branch_id: &str,
    diff: GenusDiff,
) -> KernelResult<GenusDef> {
    validate_diff(&GenusDef::default(), &diff)?;
    store.create_res(genus_id, crate::ids::sentinel_ids::META_GENUS, branch_id, None, None)?;
    store.append(
        genus_id,
        branch_id,
        TessellaTag::GenusMetaSet {
            key: "name".to_string(),
            value: JsonValue::String(name.to_string()),
        },
        None,
    )?;
    store.append(
        genus_id,
        branch_id,
        TessellaTag::GenusMetaSet {
            key: "kind".to_string(),
            value: serde_json::to_value(kind).map_err(KernelError::SerializationError)?,
        },
        None,
    )?;
    apply_diff(store, genus_id, branch_id, diff)?;
    load_genus(store, &genus_id)
}

/// Apply an additive diff to an existing genus, rejecting anything that
/// would remove or retype a previously-declared element (§3, §7
/// `EvolutionNonAdditive`).
pub fn evolve_genus(
    store: &TessellaStore,
    genus_id: &Ulid,
    branch_id: &str,
    diff: GenusDiff,
) -> KernelResult<GenusDef> {
    let current = load_genus(store, genus_id)?;
    if current.meta.deprecated() {
        return Err(KernelError::GenusDeprecated {
            genus_id: genus_id.to_string(),
        });
    }
    validate_diff(&current, &diff)?;
    apply_diff(store, *genus_id, branch_id, diff)?;
    load_genus(store, genus_id)
}

/// Mark a genus deprecated. Existing entities are unaffected; only new
/// `create_entity` calls against it are blocked (§4.2).
pub fn deprecate_genus(store: &TessellaStore, genus_id: &Ulid, branch_id: &str) -> KernelResult<()> {
    store.append(
        *genus_id,
        branch_id,
        TessellaTag::GenusMetaSet {
            key: "deprecated".to_string(),
            value: JsonValue::Bool(true),
        },
        None,
    )?;
    Ok(())
}

/// Clear a genus's deprecated flag.
pub fn restore_genus(store: &TessellaStore, genus_id: &Ulid, branch_id: &str) -> KernelResult<()> {
    store.append(
        *genus_id,
        branch_id,
        TessellaTag::GenusMetaSet {
            key: "deprecated".to_string(),
            value: JsonValue::Bool(false),
        },
        None,
    )?;
    Ok(())
}

/// Reject a diff that would remove or retype anything already declared on
/// `current`. New elements, and role member-genus unions, are always fine.
fn validate_diff(current: &GenusDef, diff: &GenusDiff) -> KernelResult<()> {
    for attr in &diff.attributes {
        let key = attr.name.to_lowercase();
        if let Some(existing) = current.attributes.get(&key) {
            if existing.attribute_type != attr.attribute_type {
                return Err(KernelError::EvolutionNonAdditive {
                    genus_id: key,
                    reason: format!(
                        "attribute '{}' cannot change type from {:?} to {:?}",
                        attr.name, existing.attribute_type, attr.attribute_type
                    ),
                });
            }
        }
    }
    for state in &diff.states {
        if state.initial {
            let key = state.name.to_lowercase();
            let already_has_other_initial = current
                .states
                .values()
                .any(|s| s.initial && s.name.to_lowercase() != key);
            if already_has_other_initial {
                return Err(KernelError::EvolutionNonAdditive {
                    genus_id: key,
                    reason: "genus already has a different initial state".to_string(),
                });
            }
            let other_initial_in_same_diff = diff
                .states
                .iter()
                .any(|s| s.initial && s.name.to_lowercase() != key);
            if other_initial_in_same_diff {
                return Err(KernelError::EvolutionNonAdditive {
                    genus_id: key,
                    reason: "diff declares more than one initial state".to_string(),
                });
            }
        }
    }
    for transition in &diff.transitions {
        // transitions referencing states must name states present in
        // current or in this same diff — order-independent within a diff.
        let known = |name: &str| {
            let lower = name.to_lowercase();
            current.states.contains_key(&lower)
                || diff.states.iter().any(|s| s.name.to_lowercase() == lower)
        };
        if !known(&transition.from) || !known(&transition.to) {
            return Err(KernelError::SchemaInvalid {
                reason: format!(
                    "transition {} -> {} references an undeclared state",
                    transition.from, transition.to
                ),
            });
        }
    }
    Ok(())
}

fn apply_diff(
    store: &TessellaStore,
    genus_id: Ulid,
    branch_id: &str,
    diff: GenusDiff,
) -> KernelResult<()> {
    for (key, value) in diff.meta {
        store.append(genus_id, branch_id, TessellaTag::GenusMetaSet { key, value }, None)?;
    }
    for attribute in diff.attributes {
        store.append(
            genus_id,
            branch_id,
            TessellaTag::GenusAttributeDefined { attribute },
            None,
        )?;
    }
    for state in diff.states {
        store.append(genus_id, branch_id, TessellaTag::GenusStateDefined { state }, None)?;
    }
    for transition in diff.transitions {
        store.append(
            genus_id,
            branch_id,
            TessellaTag::GenusTransitionDefined { transition },
            None,
        )?;
    }
    for role in diff.roles {
        store.append(genus_id, branch_id, TessellaTag::GenusRoleDefined { role }, None)?;
    }
    Ok(())
}

/// Validate a candidate attribute map against a genus's declared
/// attributes: rejects unknown keys, type mismatches, and missing
/// required attributes that have no default (§4.2, §7 `SchemaInvalid`).
pub fn validate_attributes(
    genus: &GenusDef,
    candidate: &serde_json::Map<String, JsonValue>,
) -> KernelResult<serde_json::Map<String, JsonValue>> {
    let mut resolved = candidate.clone();
    for (name, def) in &genus.attributes {
        match resolved.get(name) {
            Some(value) => {
                if !def.attribute_type.accepts(value) {
                    return Err(KernelError::SchemaInvalid {
                        reason: format!(
                            "attribute '{}' expects {:?}, got {}",
                            def.name, def.attribute_type, value
                        ),
                    });
                }
            }
            None => {
                if let Some(default) = &def.default_value {
                    resolved.insert(name.clone(), default.clone());
                } else if def.required {
                    return Err(KernelError::SchemaInvalid {
                        reason: format!("missing required attribute '{}'", def.name),
                    });
                }
            }
        }
    }
    for key in candidate.keys() {
        if !genus.attributes.contains_key(&key.to_lowercase()) {
            return Err(KernelError::SchemaInvalid {
                reason: format!("attribute '{key}' is not declared on this genus"),
            });
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TessellaStore {
        TessellaStore::new(0)
    }

    #[test]
    fn define_then_evolve_genus_is_additive() {
        let store = store();
        let genus_id = Ulid::new();
        let diff = GenusDiff {
            states: vec![StateDef {
                name: "draft".into(),
                initial: true,
            }],
            ..Default::default()
        };
        let genus = define_genus(&store, genus_id, "widget", GenusKind::Entity, "main", diff).unwrap();
        assert_eq!(genus.meta.name(), "widget");

        let evolve = GenusDiff {
            states: vec![StateDef {
                name: "active".into(),
                initial: false,
            }],
            transitions: vec![TransitionDef {
                from: "draft".into(),
                to: "active".into(),
                name: None,
            }],
            ..Default::default()
        };
        let evolved = evolve_genus(&store, &genus_id, "main", evolve).unwrap();
        assert!(evolved.has_direct_transition("draft", "active"));
    }

    #[test]
    fn retyping_an_attribute_is_rejected() {
        let store = store();
        let genus_id = Ulid::new();
        let diff = GenusDiff {
            attributes: vec![AttributeDef {
                name: "count".into(),
                attribute_type: AttributeType::Number,
                required: false,
                default_value: None,
            }],
            ..Default::default()
        };
        define_genus(&store, genus_id, "widget", GenusKind::Entity, "main", diff).unwrap();

        let bad = GenusDiff {
            attributes: vec![AttributeDef {
                name: "count".into(),
                attribute_type: AttributeType::Text,
                required: false,
                default_value: None,
            }],
            ..Default::default()
        };
        let err = evolve_genus(&store, &genus_id, "main", bad).unwrap_err();
        assert!(matches!(err, KernelError::EvolutionNonAdditive { .. }));
    }

    #[test]
    fn two_initial_states_in_one_diff_is_rejected() {
        let store = store();
        let genus_id = Ulid::new();
        let diff = GenusDiff {
            states: vec![
                StateDef { name: "draft".into(), initial: true },
                StateDef { name: "pending".into(), initial: true },
            ],
            ..Default::default()
        };
        let err = define_genus(&store, genus_id, "widget", GenusKind::Entity, "main", diff).unwrap_err();
        assert!(matches!(err, KernelError::EvolutionNonAdditive { .. }));
    }

    #[test]
    fn deprecated_genus_blocks_further_evolution_guard_not_creation() {
        let store = store();
        let genus_id = Ulid::new();
        define_genus(
            &store,
            genus_id,
            "widget",
            GenusKind::Entity,
            "main",
            GenusDiff::default(),
        )
        .unwrap();
        deprecate_genus(&store, &genus_id, "main").unwrap();
        let err = evolve_genus(&store, &genus_id, "main", GenusDiff::default()).unwrap_err();
        assert!(matches!(err, KernelError::GenusDeprecated { .. }));
    }

    #[test]
    fn validate_attributes_fills_defaults_and_rejects_unknown() {
        let mut genus = GenusDef::default();
        genus.attributes.insert(
            "title".into(),
            AttributeDef {
                name: "title".into(),
                attribute_type: AttributeType::Text,
                required: true,
                default_value: Some(JsonValue::String("untitled".into())),
            },
        );
        let empty = serde_json::Map::new();
        let resolved = validate_attributes(&genus, &empty).unwrap();
        assert_eq!(resolved.get("title").unwrap(), "untitled");

        let mut unknown = serde_json::Map::new();
        unknown.insert("title".into(), JsonValue::String("x".into()));
        unknown.insert("bogus".into(), JsonValue::Bool(true));
        let err = validate_attributes(&genus, &unknown).unwrap_err();
        assert!(matches!(err, KernelError::SchemaInvalid { .. }));
    }
}
