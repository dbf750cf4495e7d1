//! Sentinel bootstrap: every built-in genus and the default taxonomy and
//! science, created identically on every node (§3 sentinel ids).
//!
//! Bootstrapping never goes through the sync protocol — sentinel res are
//! excluded from pull/push entirely (`sentinel_ids::is_sentinel_res`) —
//! so every node just runs this once at startup instead.
use serde_json::{Map, Value as JsonValue};
use tracing::info;

use crate::error::KernelResult;
use crate::genus::{define_genus, AttributeDef, AttributeType, GenusDiff, GenusKind, StateDef, TransitionDef};
use crate::ids::{sentinel_ids, Ulid, MAIN_BRANCH};
use crate::tessella::{TessellaStore, TessellaTag};

fn text(name: &str, required: bool) -> AttributeDef {
    AttributeDef {
        name: name.to_string(),
        attribute_type: AttributeType::Text,
        required,
        default_value: None,
    }
}

fn opaque(name: &str) -> AttributeDef {
    AttributeDef {
        name: name.to_string(),
        attribute_type: AttributeType::Filetree,
        required: false,
        default_value: None,
    }
}

fn active_archived_states() -> (Vec<StateDef>, Vec<TransitionDef>) {
    (
        vec![
            StateDef { name: "active".to_string(), initial: true },
            StateDef { name: "archived".to_string(), initial: false },
        ],
        vec![
            TransitionDef { from: "active".to_string(), to: "archived".to_string(), name: None },
            TransitionDef { from: "archived".to_string(), to: "active".to_string(), name: None },
        ],
    )
}

/// Create a res with a fixed, pre-chosen id (used only for the handful of
/// singleton sentinel res like the default taxonomy) bypassing the
/// random-id path `entity::create_entity` otherwise always takes.
fn create_fixed(
    store: &TessellaStore,
    id: Ulid,
    genus_id: Ulid,
    attributes: Map<String, JsonValue>,
    initial_status: Option<&str>,
) -> KernelResult<()> {
    store.create_res(id, genus_id, MAIN_BRANCH, None, None)?;
    for (key, value) in attributes {
        store.append(id, MAIN_BRANCH, TessellaTag::AttributeSet { key, value }, None)?;
    }
    if let Some(status) = initial_status {
        store.append(
            id,
            MAIN_BRANCH,
            TessellaTag::StatusChanged { from: None, to: status.to_string() },
            None,
        )?;
    }
    Ok(())
}

/// Define every sentinel genus and the default taxonomy/science. Idempotent
/// only in the sense that calling it twice on the same store double-defines
/// everything — callers run it exactly once, at node startup, against a
/// fresh store.
pub fn bootstrap(store: &TessellaStore) -> KernelResult<()> {
    define_genus(
        store,
        sentinel_ids::META_GENUS,
        "genus",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff::default(),
    )?;

    define_genus(
        store,
        sentinel_ids::LOG_GENUS,
        "log",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![text("message", false)],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::ERROR_GENUS,
        "error",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            states: vec![
                StateDef { name: "open".to_string(), initial: true },
                StateDef { name: "acknowledged".to_string(), initial: false },
            ],
            transitions: vec![TransitionDef {
                from: "open".to_string(),
                to: "acknowledged".to_string(),
                name: None,
            }],
            attributes: vec![text("reason", false), text("source_entity_id", false)],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::TASK_GENUS,
        "task",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            states: vec![
                StateDef { name: "open".to_string(), initial: true },
                StateDef { name: "in_progress".to_string(), initial: false },
                StateDef { name: "done".to_string(), initial: false },
            ],
            transitions: vec![
                TransitionDef { from: "open".to_string(), to: "in_progress".to_string(), name: None },
                TransitionDef { from: "in_progress".to_string(), to: "done".to_string(), name: None },
                TransitionDef { from: "open".to_string(), to: "done".to_string(), name: None },
            ],
            attributes: vec![
                text("title", true),
                text("description", false),
                text("associated_res_id", false),
            ],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::ACTION_TAKEN_GENUS,
        "action_taken",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![
                text("action_genus_id", true),
                text("bindings_json", true),
                text("params_json", true),
            ],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::BRANCH_GENUS,
        "branch",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![text("name", true), text("parent_branch_id", false), {
                let mut def = text("cutoff_tessella_id", true);
                def.attribute_type = AttributeType::Number;
                def
            }],
            ..Default::default()
        },
    )?;

    let (states, transitions) = active_archived_states();
    define_genus(
        store,
        sentinel_ids::TAXONOMY_GENUS,
        "taxonomy",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            states: states.clone(),
            transitions: transitions.clone(),
            attributes: vec![text("name", true)],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::SCIENCE_GENUS,
        "science",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            states,
            transitions,
            attributes: vec![text("name", true)],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::CRON_SCHEDULE_GENUS,
        "cron_schedule",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![
                text("cron_expression", false),
                text("action_genus_id", false),
                opaque("resources"),
                opaque("params"),
                text("last_fired_at", false),
            ],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::SCHEDULED_TRIGGER_GENUS,
        "scheduled_trigger",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![
                text("fire_at", true),
                AttributeDef {
                    name: "fired".to_string(),
                    attribute_type: AttributeType::Boolean,
                    required: false,
                    default_value: Some(JsonValue::Bool(false)),
                },
                text("action_genus_id", false),
                opaque("resources"),
                opaque("params"),
            ],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::WORKSPACE_GENUS,
        "workspace",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![text("name", true)],
            ..Default::default()
        },
    )?;

    define_genus(
        store,
        sentinel_ids::DEVICE_GENUS,
        "device",
        GenusKind::Entity,
        MAIN_BRANCH,
        GenusDiff {
            attributes: vec![text("device_id", true), text("last_sync_at", false)],
            ..Default::default()
        },
    )?;

    let mut taxonomy_attrs = Map::new();
    taxonomy_attrs.insert("name".to_string(), JsonValue::String("default".to_string()));
    create_fixed(
        store,
        sentinel_ids::DEFAULT_TAXONOMY,
        sentinel_ids::TAXONOMY_GENUS,
        taxonomy_attrs,
        Some("active"),
    )?;

    let mut science_attrs = Map::new();
    science_attrs.insert("name".to_string(), JsonValue::String("default".to_string()));
    create_fixed(
        store,
        sentinel_ids::DEFAULT_SCIENCE,
        sentinel_ids::SCIENCE_GENUS,
        science_attrs,
        Some("active"),
    )?;

    info!("sentinel genera and default taxonomy/science bootstrapped");
    Ok(())
}
