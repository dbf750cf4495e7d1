//! Genus schema types.
//!
//! A genus is a schema, stored as a res (§3). This module defines the pure
//! data shapes the reducer folds tessellae into — `GenusDef` is a derived
//! projection, never a parallel table (§9).
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ids::Ulid;

/// Attribute value types a genus can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// Free text.
    Text,
    /// A numeric value (stored as JSON number).
    Number,
    /// A boolean flag.
    Boolean,
    /// A reference to a file tree (opaque to the kernel itself; the
    /// file-tree round trip lives outside the core per §1).
    Filetree,
}

impl AttributeType {
    /// Whether a JSON value's runtime shape matches this declared type.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            AttributeType::Text => value.is_string(),
            AttributeType::Number => value.is_number(),
            AttributeType::Boolean => value.is_boolean(),
            // Filetree attributes are opaque references (paths/hashes);
            // any JSON string or object is accepted at this layer.
            AttributeType::Filetree => value.is_string() || value.is_object(),
        }
    }
}

/// A declared attribute on a genus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// The attribute name, unique case-insensitively within the genus.
    pub name: String,
    /// Its declared value type.
    pub attribute_type: AttributeType,
    /// Whether entities of this genus must supply a value.
    pub required: bool,
    /// A default value used when an attribute is required but omitted at
    /// creation time (if present).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
}

/// A declared state on a genus's finite-state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDef {
    /// The state name, unique case-insensitively within the genus.
    pub name: String,
    /// Whether this is the single entry state new entities start in.
    pub initial: bool,
}

/// A declared transition edge between two states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    /// The source state name.
    pub from: String,
    /// The destination state name.
    pub to: String,
    /// An optional human-readable name for the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Cardinality a relationship role enforces on its membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one member.
    One,
    /// One or more members.
    OneOrMore,
    /// Any number of members, including zero.
    ZeroOrMore,
}

impl Cardinality {
    /// Whether `count` members satisfies this cardinality.
    pub fn satisfied_by(&self, count: usize) -> bool {
        match self {
            Cardinality::One => count == 1,
            Cardinality::OneOrMore => count >= 1,
            Cardinality::ZeroOrMore => true,
        }
    }

    /// A human-readable description, used in `CardinalityViolation` messages.
    pub fn describe(&self) -> &'static str {
        match self {
            Cardinality::One => "exactly one",
            Cardinality::OneOrMore => "one or more",
            Cardinality::ZeroOrMore => "zero or more",
        }
    }
}

/// A declared role on a relationship genus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    /// The role name, unique case-insensitively within the genus.
    pub name: String,
    /// The entity genera (kind-null) a member filling this role may belong
    /// to; empty means unconstrained.
    pub valid_member_genera: Vec<Ulid>,
    /// The cardinality this role enforces.
    pub cardinality: Cardinality,
}

/// What kind of genus this is. Discriminates the variant-specific shape
/// that otherwise lives in `meta` (resources/parameters/handler for
/// actions; lanes/steps for processes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenusKind {
    /// A plain entity genus.
    Entity,
    /// A declarative action genus (§4.4).
    Action,
    /// A feature genus, attached to a parent entity genus (§4.3).
    Feature,
    /// A relationship genus (§4.3).
    Relationship,
    /// A multi-lane process genus (§4.5).
    Process,
    /// A serialization genus (file-tree round trip; out of core scope).
    Serialization,
}

/// Free-form genus metadata: name, kind-specific description, lifecycle
/// flags, and (for feature/action/process genera) the variant-specific
/// declarations that don't warrant their own tessella tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenusMeta {
    /// Arbitrary key/value metadata, folded from `genus_meta_set` tessellae.
    /// Includes at minimum `name` and `kind`; may include `description`,
    /// `taxonomy_id`, `deprecated`, `deprecated_at`, `parent_genus_name`,
    /// `editable_parent_statuses`, `resources`, `parameters`, `handler`,
    /// `lanes`, `steps`.
    pub entries: HashMap<String, JsonValue>,
}

impl GenusMeta {
    /// Get a string-valued entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_str())
    }

    /// Get a boolean-valued entry, defaulting to `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.entries.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// The genus's declared name.
    pub fn name(&self) -> &str {
        self.get_str("name").unwrap_or_default()
    }

    /// The genus's kind.
    pub fn kind(&self) -> Option<GenusKind> {
        self.entries
            .get("kind")
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_value(JsonValue::String(s.to_string())).ok())
    }

    /// Whether the genus is currently deprecated.
    pub fn deprecated(&self) -> bool {
        self.get_bool("deprecated")
    }

    /// The feature genus's declared parent genus name, if any.
    pub fn parent_genus_name(&self) -> Option<&str> {
        self.get_str("parent_genus_name")
    }

    /// The feature genus's declared editable parent statuses, if any.
    pub fn editable_parent_statuses(&self) -> Vec<String> {
        self.entries
            .get("editable_parent_statuses")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A genus, fully materialized from its tessella log.
///
/// This is always a derived projection (§9) — there is no parallel "genus
/// definitions" table. Call sites reduce from the res's tessellae each time
/// they need the current shape (materialization caching, if any, is an
/// implementation detail of the store).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenusDef {
    /// Generic metadata (name, kind, lifecycle flags, variant-specific data).
    pub meta: GenusMeta,
    /// Declared attributes, keyed by lowercase name for case-insensitive lookup.
    pub attributes: HashMap<String, AttributeDef>,
    /// Declared states, keyed by lowercase name.
    pub states: HashMap<String, StateDef>,
    /// Declared transitions, in definition order.
    pub transitions: Vec<TransitionDef>,
    /// Declared roles (relationship genera only), keyed by lowercase name.
    pub roles: HashMap<String, RoleDef>,
}

impl GenusDef {
    /// The single state marked `initial`, if the genus is stateful.
    pub fn initial_state(&self) -> Option<&StateDef> {
        self.states.values().find(|s| s.initial)
    }

    /// Whether `status` is one of the genus's declared states (case-insensitive).
    pub fn has_state(&self, status: &str) -> bool {
        self.states.contains_key(&status.to_lowercase())
    }

    /// Direct transition targets reachable from `from` in one edge.
    pub fn direct_targets_from<'a>(&'a self, from: &str) -> impl Iterator<Item = &'a str> + 'a {
        let from = from.to_lowercase();
        self.transitions
            .iter()
            .filter(move |t| t.from.to_lowercase() == from)
            .map(|t| t.to.as_str())
    }

    /// Whether `(from, to)` is a direct edge in the transition graph.
    pub fn has_direct_transition(&self, from: &str, to: &str) -> bool {
        let to = to.to_lowercase();
        self.direct_targets_from(from).any(|t| t.to_lowercase() == to)
    }

    /// BFS shortest path of statuses from `from` to `to`, inclusive of both
    /// endpoints. Returns `None` if unreachable.
    pub fn bfs_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        use std::collections::{HashMap as Map, VecDeque};

        let from = from.to_lowercase();
        let to = to.to_lowercase();
        if from == to {
            return Some(vec![from]);
        }

        let mut visited: Map<String, String> = Map::new(); // child -> parent
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(from.clone());
        visited.insert(from.clone(), from.clone());

        while let Some(current) = queue.pop_front() {
            if current == to {
                // reconstruct path
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while cursor != from {
                    let parent = visited.get(&cursor)?.clone();
                    path.push(parent.clone());
                    cursor = parent;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.direct_targets_from(&current) {
                let next = next.to_lowercase();
                if !visited.contains_key(&next) {
                    visited.insert(next.clone(), current.clone());
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// All states reachable from `from` via any number of edges (for
    /// `NoTransitionPath` error messages).
    pub fn reachable_from(&self, from: &str) -> Vec<String> {
        use std::collections::{HashSet, VecDeque};

        let from = from.to_lowercase();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            for next in self.direct_targets_from(&current) {
                let next = next.to_lowercase();
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        let mut result: Vec<String> = visited.into_iter().collect();
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_genus() -> GenusDef {
        let mut states = HashMap::new();
        states.insert(
            "draft".to_string(),
            StateDef {
                name: "draft".to_string(),
                initial: true,
            },
        );
        states.insert(
            "active".to_string(),
            StateDef {
                name: "active".to_string(),
                initial: false,
            },
        );
        states.insert(
            "discontinued".to_string(),
            StateDef {
                name: "discontinued".to_string(),
                initial: false,
            },
        );

        GenusDef {
            meta: GenusMeta::default(),
            attributes: HashMap::new(),
            states,
            transitions: vec![
                TransitionDef {
                    from: "draft".to_string(),
                    to: "active".to_string(),
                    name: None,
                },
                TransitionDef {
                    from: "active".to_string(),
                    to: "discontinued".to_string(),
                    name: None,
                },
            ],
            roles: HashMap::new(),
        }
    }

    #[test]
    fn bfs_path_finds_multi_hop_path() {
        let genus = sample_genus();
        let path = genus.bfs_path("draft", "discontinued").unwrap();
        assert_eq!(path, vec!["draft", "active", "discontinued"]);
    }

    #[test]
    fn bfs_path_none_when_unreachable() {
        let genus = sample_genus();
        assert!(genus.bfs_path("discontinued", "draft").is_none());
    }

    #[test]
    fn reachable_from_lists_all_downstream_states() {
        let genus = sample_genus();
        assert_eq!(
            genus.reachable_from("draft"),
            vec!["active", "discontinued", "draft"]
        );
    }

    #[test]
    fn direct_transition_detection() {
        let genus = sample_genus();
        assert!(genus.has_direct_transition("draft", "active"));
        assert!(!genus.has_direct_transition("draft", "discontinued"));
    }
}
