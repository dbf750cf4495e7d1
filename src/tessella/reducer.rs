//! The reducer: pure folds from a res's tessellae to its derived state.
//!
//! Both `reduce_entity` and `reduce_genus` are total functions over the
//! closed `TessellaTag` set (§9) — there is no default/fallback arm to
//! silently swallow an unexpected tag, because the type system already
//! rules that out.
use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};

use crate::genus::types::GenusDef;
use crate::ids::Ulid;

use super::{Tessella, TessellaTag};

/// A feature's derived state, nested inside its parent's `EntityState`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureState {
    pub genus_id: Option<Ulid>,
    pub attributes: Map<String, JsonValue>,
    pub status: Option<String>,
}

/// An entity (or relationship) res's derived state (§3/§4.3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityState {
    pub attributes: Map<String, JsonValue>,
    pub status: Option<String>,
    pub features: HashMap<Ulid, FeatureState>,
    pub members: HashMap<String, Vec<Ulid>>,
}

impl EntityState {
    /// Whether this res has ever received a `Created` tessella. A res with
    /// no tessellae at all simply doesn't exist; this distinguishes "was
    /// created, has default state" from "never existed."
    pub fn exists(&self, tessellae: &[Tessella]) -> bool {
        tessellae.iter().any(|t| matches!(t.tag, TessellaTag::Created))
    }
}

/// Fold a res's tessellae (already filtered to the right branch/cutoff and
/// globally ordered by `Tessella::id`) into its current `EntityState`.
pub fn reduce_entity(tessellae: &[Tessella]) -> EntityState {
    let mut state = EntityState::default();
    for t in tessellae {
        match &t.tag {
            TessellaTag::Created => {}
            TessellaTag::AttributeSet { key, value } => {
                state.attributes.insert(key.clone(), value.clone());
            }
            TessellaTag::AttributeRemoved { key } => {
                state.attributes.remove(key);
            }
            TessellaTag::StatusChanged { to, .. } => {
                state.status = Some(to.clone());
            }
            TessellaTag::FeatureCreated {
                feature_id,
                genus_id,
                attributes,
            } => {
                let entry = state.features.entry(*feature_id).or_default();
                entry.genus_id = Some(*genus_id);
                if let Some(attrs) = attributes {
                    entry.attributes.extend(attrs.clone());
                }
            }
            TessellaTag::FeatureAttributeSet {
                feature_id,
                key,
                value,
            } => {
                let entry = state.features.entry(*feature_id).or_default();
                entry.attributes.insert(key.clone(), value.clone());
            }
            TessellaTag::FeatureStatusChanged { feature_id, to } => {
                let entry = state.features.entry(*feature_id).or_default();
                entry.status = Some(to.clone());
            }
            TessellaTag::MemberAdded { role, member_id } => {
                state.members.entry(role.clone()).or_default().push(*member_id);
            }
            TessellaTag::MemberRemoved { role, member_id } => {
                if let Some(members) = state.members.get_mut(role) {
                    if let Some(pos) = members.iter().position(|m| m == member_id) {
                        members.remove(pos);
                    }
                }
            }
            // Genus-defining tags never appear on entity/relationship res.
            TessellaTag::GenusAttributeDefined { .. }
            | TessellaTag::GenusStateDefined { .. }
            | TessellaTag::GenusTransitionDefined { .. }
            | TessellaTag::GenusRoleDefined { .. }
            | TessellaTag::GenusMetaSet { .. } => {}
        }
    }
    state
}

/// Fold a genus res's tessellae into its current `GenusDef`.
///
/// Evolution is additive only (§3, §4.2): a `GenusRoleDefined` for a role
/// name that already exists union-merges `valid_member_genera` instead of
/// replacing the role, matching the non-destructive evolution invariant.
pub fn reduce_genus(tessellae: &[Tessella]) -> GenusDef {
    let mut genus = GenusDef::default();
    for t in tessellae {
        match &t.tag {
            TessellaTag::GenusMetaSet { key, value } => {
                genus.meta.entries.insert(key.clone(), value.clone());
            }
            TessellaTag::GenusAttributeDefined { attribute } => {
                genus
                    .attributes
                    .insert(attribute.name.to_lowercase(), attribute.clone());
            }
            TessellaTag::GenusStateDefined { state } => {
                genus.states.insert(state.name.to_lowercase(), state.clone());
            }
            TessellaTag::GenusTransitionDefined { transition } => {
                genus.transitions.push(transition.clone());
            }
            TessellaTag::GenusRoleDefined { role } => {
                let key = role.name.to_lowercase();
                match genus.roles.get_mut(&key) {
                    Some(existing) => {
                        for g in &role.valid_member_genera {
                            if !existing.valid_member_genera.contains(g) {
                                existing.valid_member_genera.push(*g);
                            }
                        }
                    }
                    None => {
                        genus.roles.insert(key, role.clone());
                    }
                }
            }
            TessellaTag::Created
            | TessellaTag::AttributeSet { .. }
            | TessellaTag::AttributeRemoved { .. }
            | TessellaTag::StatusChanged { .. }
            | TessellaTag::FeatureCreated { .. }
            | TessellaTag::FeatureAttributeSet { .. }
            | TessellaTag::FeatureStatusChanged { .. }
            | TessellaTag::MemberAdded { .. }
            | TessellaTag::MemberRemoved { .. } => {}
        }
    }
    genus
}
