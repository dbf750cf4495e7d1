//! Relationship operations (§4.3): role-based, cardinality-enforced links
//! between entities, materialized the same way as any other res.
use std::collections::HashMap;

use tracing::instrument;

use crate::entity;
use crate::error::{KernelError, KernelResult};
use crate::genus::{load_genus, GenusDef};
use crate::ids::Ulid;
use crate::session::Session;
use crate::tessella::{EntityState, TessellaStore, TessellaTag};

fn validate_members(
    store: &TessellaStore,
    genus: &GenusDef,
    members: &HashMap<String, Vec<Ulid>>,
) -> KernelResult<()> {
    for (role_name, role) in &genus.roles {
        let supplied = members.get(role_name).map(|v| v.as_slice()).unwrap_or(&[]);
        if !role.cardinality.satisfied_by(supplied.len()) {
            return Err(KernelError::CardinalityViolation {
                role: role.name.clone(),
                expected: role.cardinality.describe().to_string(),
                actual: supplied.len(),
            });
        }
        if role.valid_member_genera.is_empty() {
            continue;
        }
        for member_id in supplied {
            let member_res = store.get_res(member_id)?;
            if !role.valid_member_genera.contains(&member_res.genus_id) {
                return Err(KernelError::MemberGenusMismatch {
                    member_id: member_id.to_string(),
                    member_genus_id: member_res.genus_id.to_string(),
                    role: role.name.clone(),
                });
            }
        }
    }
    for role_name in members.keys() {
        if !genus.roles.contains_key(&role_name.to_lowercase()) {
            return Err(KernelError::SchemaInvalid {
                reason: format!("role '{role_name}' is not declared on this relationship genus"),
            });
        }
    }
    Ok(())
}

/// Create a new relationship of `genus_id`, validating every role's
/// cardinality and member-genus constraints up front (§4.3) — a
/// relationship is never created partially populated.
#[instrument(skip(store, members))]
pub fn create_relationship(
    store: &TessellaStore,
    session: &Session,
    genus_id: Ulid,
    members: HashMap<String, Vec<Ulid>>,
) -> KernelResult<Ulid> {
    let genus = load_genus(store, &genus_id)?;
    if genus.meta.deprecated() {
        return Err(KernelError::GenusDeprecated {
            genus_id: genus_id.to_string(),
        });
    }
    validate_members(store, &genus, &members)?;

    let id = Ulid::new();
    store.create_res(id, genus_id, &session.branch_id, session.workspace_id, None)?;
    for (role, member_ids) in members {
        for member_id in member_ids {
            store.append(
                id,
                &session.branch_id,
                TessellaTag::MemberAdded {
                    role: role.clone(),
                    member_id,
                },
                None,
            )?;
        }
    }
    Ok(id)
}

/// Add one member under `role`, re-validating cardinality and member genus
/// for that role afterward.
pub fn add_member(
    store: &TessellaStore,
    session: &Session,
    relationship_id: Ulid,
    role: &str,
    member_id: Ulid,
) -> KernelResult<()> {
    let res = store.get_res(&relationship_id)?;
    let genus = load_genus(store, &res.genus_id)?;
    let role_def = genus.roles.get(&role.to_lowercase()).ok_or_else(|| KernelError::SchemaInvalid {
        reason: format!("role '{role}' is not declared on this relationship genus"),
    })?;
    if !role_def.valid_member_genera.is_empty() {
        let member_res = store.get_res(&member_id)?;
        if !role_def.valid_member_genera.contains(&member_res.genus_id) {
            return Err(KernelError::MemberGenusMismatch {
                member_id: member_id.to_string(),
                member_genus_id: member_res.genus_id.to_string(),
                role: role.to_string(),
            });
        }
    }
    let state = materialize(store, &res.branch_id, relationship_id)?;
    let current = state.members.get(role).map(|v| v.len()).unwrap_or(0);
    if !role_def.cardinality.satisfied_by(current + 1) {
        return Err(KernelError::CardinalityViolation {
            role: role.to_string(),
            expected: role_def.cardinality.describe().to_string(),
            actual: current + 1,
        });
    }
    store.append(
        relationship_id,
        &session.branch_id,
        TessellaTag::MemberAdded {
            role: role.to_string(),
            member_id,
        },
        None,
    )?;
    Ok(())
}

/// Remove one occurrence of `member_id` from `role`.
///
/// Only removes an exact `(role, member_id)` occurrence — with a
/// `OneOrMore`/`One` role this can drive the role below its minimum
/// cardinality; the kernel does not reject that, since "remove down to
/// zero and add the replacement in the same call" is a legitimate caller
/// pattern and the store has no notion of a multi-step transaction to
/// defer the check to.
pub fn remove_member(
    store: &TessellaStore,
    session: &Session,
    relationship_id: Ulid,
    role: &str,
    member_id: Ulid,
) -> KernelResult<()> {
    store.append(
        relationship_id,
        &session.branch_id,
        TessellaTag::MemberRemoved {
            role: role.to_string(),
            member_id,
        },
        None,
    )?;
    Ok(())
}

/// Materialize a relationship's current member map.
pub fn materialize(store: &TessellaStore, branch_id: &str, relationship_id: Ulid) -> KernelResult<EntityState> {
    entity::materialize(store, branch_id, relationship_id)
}

/// Every relationship of `genus_id` that currently has `member_id` filling
/// any role — a reverse lookup computed on demand rather than kept as a
/// separate denormalized index, since the store has no secondary indexes.
pub fn relationships_for_member(
    store: &TessellaStore,
    branch_id: &str,
    genus_id: Ulid,
    member_id: Ulid,
) -> KernelResult<Vec<Ulid>> {
    let mut out = Vec::new();
    for id in store.res_ids_by_genus(&genus_id) {
        let state = materialize(store, branch_id, id)?;
        if state.members.values().any(|members| members.contains(&member_id)) {
            out.push(id);
        }
    }
    out.sort();
    Ok(out)
}
