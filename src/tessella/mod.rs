//! The tessella store & reducer (§4.1).
//!
//! A res is an identity; a tessella is an immutable fact appended to one
//! res. State is always derived by folding a res's tessellae through the
//! reducer — never mutated directly.
pub mod reducer;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::genus::types::{AttributeDef, RoleDef, StateDef, TransitionDef};
use crate::ids::Ulid;

pub use reducer::{reduce_entity, reduce_genus, EntityState, FeatureState};
pub use store::TessellaStore;

/// An identity with a history (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Res {
    /// The res's own id. A ULID, so ids are creation-ordered.
    pub id: Ulid,
    /// The genus binding this res to a schema.
    pub genus_id: Ulid,
    /// The branch that created this res.
    pub branch_id: String,
    /// The tenancy scope, if any (nullable for system res).
    pub workspace_id: Option<Ulid>,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
}

/// An immutable fact appended to one res (§3). Tessellae are never
/// updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tessella {
    /// The monotonic global sequence id. Total ordering is defined by this
    /// field alone, across every res and every branch.
    pub id: u64,
    /// The res this fact was appended to.
    pub res_id: Ulid,
    /// The branch this fact was appended on.
    pub branch_id: String,
    /// The fact itself.
    pub tag: TessellaTag,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
    /// Origin tag for sync/merge dedup, e.g. `device:X`, `merge:Y`, `sync:server`.
    pub source: Option<String>,
}

/// The closed set of tessella tags and their reducer semantics (§3). A
/// systems-language implementation should make this a closed sum type and
/// the reducer a total function over it (§9) — unknown tags have no place
/// here; forward-compatible opaque storage is left to a future revision
/// if ever needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TessellaTag {
    /// `state <- {}`. Every res's first tessella.
    Created,
    /// `state[key] = value`.
    AttributeSet { key: String, value: JsonValue },
    /// `delete state[key]`.
    AttributeRemoved { key: String },
    /// `state.status = to`.
    StatusChanged {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        to: String,
    },
    /// `state.features[feature_id] = { genus_id, ...attributes }`.
    FeatureCreated {
        feature_id: Ulid,
        genus_id: Ulid,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<Map<String, JsonValue>>,
    },
    /// `state.features[feature_id][key] = value`.
    FeatureAttributeSet {
        feature_id: Ulid,
        key: String,
        value: JsonValue,
    },
    /// `state.features[feature_id].status = to`.
    FeatureStatusChanged { feature_id: Ulid, to: String },
    /// Appends `member_id` to `state.members[role]` (multiset).
    MemberAdded { role: String, member_id: Ulid },
    /// Removes one occurrence of `member_id` from `state.members[role]`.
    MemberRemoved { role: String, member_id: Ulid },
    /// Adds one attribute to a genus's `attributes` sub-dictionary.
    GenusAttributeDefined { attribute: AttributeDef },
    /// Adds one state to a genus's `states` sub-dictionary.
    GenusStateDefined { state: StateDef },
    /// Adds one transition to a genus's `transitions` list.
    GenusTransitionDefined { transition: TransitionDef },
    /// Adds one role to a genus's `roles` sub-dictionary (or union-merges
    /// `valid_member_genera` if the role name already exists, per additive
    /// evolution semantics).
    GenusRoleDefined { role: RoleDef },
    /// Sets a generic genus metadata entry (name, kind, description,
    /// lifecycle flags, and the action/process variant-specific payloads
    /// that don't warrant their own tag).
    GenusMetaSet { key: String, value: JsonValue },
}

impl TessellaTag {
    /// A short, stable name for the tag, used in logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TessellaTag::Created => "created",
            TessellaTag::AttributeSet { .. } => "attribute_set",
            TessellaTag::AttributeRemoved { .. } => "attribute_removed",
            TessellaTag::StatusChanged { .. } => "status_changed",
            TessellaTag::FeatureCreated { .. } => "feature_created",
            TessellaTag::FeatureAttributeSet { .. } => "feature_attribute_set",
            TessellaTag::FeatureStatusChanged { .. } => "feature_status_changed",
            TessellaTag::MemberAdded { .. } => "member_added",
            TessellaTag::MemberRemoved { .. } => "member_removed",
            TessellaTag::GenusAttributeDefined { .. } => "genus_attribute_defined",
            TessellaTag::GenusStateDefined { .. } => "genus_state_defined",
            TessellaTag::GenusTransitionDefined { .. } => "genus_transition_defined",
            TessellaTag::GenusRoleDefined { .. } => "genus_role_defined",
            TessellaTag::GenusMetaSet { .. } => "genus_meta_set",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_kind_matches_tessella_tag_table() {
        assert_eq!(TessellaTag::Created.kind(), "created");
        assert_eq!(
            TessellaTag::AttributeSet {
                key: "title".into(),
                value: JsonValue::String("x".into())
            }
            .kind(),
            "attribute_set"
        );
    }
}
