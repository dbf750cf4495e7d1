//! The multi-lane process engine (§4.5).
//!
//! A process genus declares one or more lanes, each an ordered list of
//! named steps. Lanes are conceptually independent — a process instance
//! tracks a separate cursor per lane — but every step still goes through
//! the same single-writer store, so "parallel" here means "independently
//! advancing," not "executed on separate threads" (§5).
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, instrument, warn};

use crate::action;
use crate::entity;
use crate::error::{KernelError, KernelResult};
use crate::genus::load_genus;
use crate::ids::{sentinel_ids, Ulid};
use crate::session::Session;
use crate::tessella::TessellaStore;

/// One step in a lane. `name` must be unique within its lane — `branch_step`
/// targets resolve by `(lane, name)`, and a branch step's target must name
/// a step in the *same* lane (processes don't let one lane jump into
/// another's cursor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub lane: String,
    pub name: String,
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Creates a `Task` entity and waits for it to reach `done` before the
    /// lane advances.
    Task { title: JsonValue },
    /// Takes a declarative action immediately, then advances.
    Action {
        action_genus_id: Ulid,
        resources: HashMap<String, String>,
        params: Map<String, JsonValue>,
    },
    /// Reads state with no side effect, then advances. The round trip to
    /// an external source is out of the core's scope (§1) — this records
    /// that a fetch happened, it does not perform one.
    Fetch { description: String },
    /// Blocks the lane until every named `(lane, step)` dependency — which
    /// may belong to any lane, including this one — has completed.
    Gate { depends_on: Vec<GateDependency> },
    /// Unconditionally jumps the lane to another step by name, in the same lane.
    Branch { target_step: String },
}

/// One dependency a gate step waits on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDependency {
    pub lane: String,
    pub step: String,
}

fn process_steps(genus: &crate::genus::GenusDef) -> KernelResult<Vec<StepDef>> {
    match genus.meta.entries.get("steps") {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(KernelError::SerializationError),
    }
}

fn lane_names(steps: &[StepDef]) -> Vec<String> {
    let mut lanes = Vec::new();
    for step in steps {
        if !lanes.contains(&step.lane) {
            lanes.push(step.lane.clone());
        }
    }
    lanes
}

fn first_step_name<'a>(steps: &'a [StepDef], lane: &str) -> Option<&'a str> {
    steps.iter().find(|s| s.lane == lane).map(|s| s.name.as_str())
}

fn next_step_name<'a>(steps: &'a [StepDef], lane: &str, current: &str) -> Option<&'a str> {
    let lane_steps: Vec<&StepDef> = steps.iter().filter(|s| s.lane == lane).collect();
    let pos = lane_steps.iter().position(|s| s.name == current)?;
    lane_steps.get(pos + 1).map(|s| s.name.as_str())
}

fn find_step<'a>(steps: &'a [StepDef], lane: &str, name: &str) -> Option<&'a StepDef> {
    steps.iter().find(|s| s.lane == lane && s.name == name)
}

/// Start a new instance of `process_genus_id`: one lane cursor per
/// declared lane, each positioned at that lane's first step.
#[instrument(skip(store, attributes))]
pub fn start_process(
    store: &TessellaStore,
    session: &Session,
    process_genus_id: Ulid,
    attributes: Map<String, JsonValue>,
) -> KernelResult<Ulid> {
    let genus = load_genus(store, &process_genus_id)?;
    let steps = process_steps(&genus)?;
    let lanes = lane_names(&steps);

    let mut cursors = Map::new();
    let mut statuses = Map::new();
    for lane in &lanes {
        match first_step_name(&steps, lane) {
            Some(step) => {
                cursors.insert(lane.clone(), JsonValue::String(step.to_string()));
                statuses.insert(format!("{lane}:{step}"), JsonValue::String("active".to_string()));
            }
            None => {
                cursors.insert(lane.clone(), JsonValue::Null);
            }
        }
    }
    for step in &steps {
        statuses
            .entry(format!("{}:{}", step.lane, step.name))
            .or_insert_with(|| JsonValue::String("pending".to_string()));
    }

    let mut attrs = attributes;
    attrs.insert("lane_cursors".to_string(), JsonValue::Object(cursors));
    attrs.insert("step_statuses".to_string(), JsonValue::Object(statuses));
    attrs.insert("instance_status".to_string(), JsonValue::String("running".to_string()));
    attrs.insert("started_at".to_string(), JsonValue::String(Utc::now().to_rfc3339()));
    attrs.insert(
        "process_genus_id".to_string(),
        JsonValue::String(process_genus_id.to_string()),
    );
    let id = entity::create_entity(store, session, process_genus_id, attrs, None)?;
    debug!(process_id = %id, lanes = lanes.len(), "process started");
    advance(store, session, id)?;
    Ok(id)
}

fn lane_cursors(state: &crate::tessella::EntityState) -> HashMap<String, Option<String>> {
    match state.attributes.get("lane_cursors") {
        Some(JsonValue::Object(map)) => map
            .iter()
            .map(|(lane, v)| (lane.clone(), v.as_str().map(str::to_string)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Per-step status (§4.5 `StepStatus`), keyed `"{lane}:{name}"`.
fn step_statuses(state: &crate::tessella::EntityState) -> HashMap<String, String> {
    match state.attributes.get("step_statuses") {
        Some(JsonValue::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Steps currently in `completed` status — what gate dependencies check.
fn completed_steps(state: &crate::tessella::EntityState) -> std::collections::HashSet<String> {
    step_statuses(state)
        .into_iter()
        .filter(|(_, status)| status == "completed")
        .map(|(key, _)| key)
        .collect()
}

fn set_step_status(
    store: &TessellaStore,
    session: &Session,
    process_instance_id: Ulid,
    state: &crate::tessella::EntityState,
    lane: &str,
    step_name: &str,
    status: &str,
) -> KernelResult<()> {
    let mut statuses = step_statuses(state);
    statuses.insert(format!("{lane}:{step_name}"), status.to_string());
    let mut map = Map::new();
    for (key, value) in statuses {
        map.insert(key, JsonValue::String(value));
    }
    entity::set_attribute(store, session, process_instance_id, "step_statuses", JsonValue::Object(map))
}

/// Set the instance's overall `status` (§4.5 `ProcessInstance.status`),
/// stamping `completed_at` once it reaches a terminal state.
fn set_instance_status(
    store: &TessellaStore,
    session: &Session,
    process_instance_id: Ulid,
    status: &str,
) -> KernelResult<()> {
    entity::set_attribute(
        store,
        session,
        process_instance_id,
        "instance_status",
        JsonValue::String(status.to_string()),
    )?;
    if matches!(status, "completed" | "failed" | "cancelled") {
        entity::set_attribute(
            store,
            session,
            process_instance_id,
            "completed_at",
            JsonValue::String(Utc::now().to_rfc3339()),
        )?;
    }
    Ok(())
}

fn instance_status(state: &crate::tessella::EntityState) -> String {
    state
        .attributes
        .get("instance_status")
        .and_then(|v| v.as_str())
        .unwrap_or("running")
        .to_string()
}

fn task_is_done(store: &TessellaStore, branch_id: &str, task_id: Ulid) -> KernelResult<bool> {
    let state = entity::materialize(store, branch_id, task_id)?;
    Ok(state.status.as_deref() == Some("done"))
}

/// Advance every lane of a process instance as far as it can go without
/// external input: runs action/fetch/branch steps to completion and stops
/// a lane at the first unmet task or gate. A no-op once the instance has
/// reached a terminal status (§4.5 Failure semantics, testable property 8).
#[instrument(skip(store))]
pub fn advance(store: &TessellaStore, session: &Session, process_instance_id: Ulid) -> KernelResult<()> {
    let res = store.get_res(&process_instance_id)?;
    let (process_genus_id, status): (Ulid, String) = {
        let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
        let process_genus_id = state
            .attributes
            .get("process_genus_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KernelError::SchemaInvalid {
                reason: "process instance missing process_genus_id".to_string(),
            })?;
        (process_genus_id, instance_status(&state))
    };
    if status != "running" {
        return Ok(());
    }
    let genus = load_genus(store, &process_genus_id)?;
    let steps = process_steps(&genus)?;
    let lanes = lane_names(&steps);

    for lane in &lanes {
        loop {
            let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
            let cursors = lane_cursors(&state);
            let Some(current_name) = cursors.get(lane).cloned().flatten() else {
                break; // lane finished or never started
            };
            let Some(step) = find_step(&steps, lane, &current_name) else {
                warn!(lane, step = current_name, "process cursor points at unknown step");
                break;
            };

            let advanced = match &step.kind {
                StepKind::Task { title } => {
                    let task_attr_key = format!("__task_id_{lane}_{current_name}");
                    match state.attributes.get(&task_attr_key).and_then(|v| v.as_str()) {
                        Some(existing) => {
                            let task_id: Ulid = existing.parse().map_err(|_| KernelError::SchemaInvalid {
                                reason: "corrupt task id recorded on process instance".to_string(),
                            })?;
                            if task_is_done(store, &res.branch_id, task_id)? {
                                true
                            } else {
                                false
                            }
                        }
                        None => {
                            let mut task_attrs = Map::new();
                            task_attrs.insert("title".to_string(), title.clone());
                            let task_id =
                                entity::create_entity(store, session, sentinel_ids::TASK_GENUS, task_attrs, None)?;
                            entity::set_attribute(
                                store,
                                session,
                                process_instance_id,
                                &task_attr_key,
                                JsonValue::String(task_id.to_string()),
                            )?;
                            false
                        }
                    }
                }
                StepKind::Action { action_genus_id, resources, params } => {
                    let mut resolved_resources = HashMap::new();
                    for (name, token) in resources {
                        if let Some(stripped) = token.strip_prefix("$instance") {
                            let _ = stripped;
                            resolved_resources.insert(name.clone(), process_instance_id);
                        } else if let Ok(id) = token.parse::<Ulid>() {
                            resolved_resources.insert(name.clone(), id);
                        }
                    }
                    let params_map: HashMap<String, JsonValue> =
                        params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    match action::take_action(store, session, *action_genus_id, resolved_resources, params_map) {
                        Ok(_) => true,
                        Err(e) => {
                            set_step_status(store, session, process_instance_id, &state, lane, &current_name, "failed")?;
                            set_instance_status(store, session, process_instance_id, "failed")?;
                            return Err(e);
                        }
                    }
                }
                StepKind::Fetch { description } => {
                    let mut attrs = Map::new();
                    attrs.insert("message".to_string(), JsonValue::String(description.clone()));
                    entity::create_entity(store, session, sentinel_ids::LOG_GENUS, attrs, None)?;
                    true
                }
                StepKind::Gate { depends_on } => {
                    let completed = completed_steps(&state);
                    let satisfied = depends_on
                        .iter()
                        .all(|dep| completed.contains(&format!("{}:{}", dep.lane, dep.step)));
                    let already_active =
                        step_statuses(&state).get(&format!("{lane}:{current_name}")).map(String::as_str) == Some("active");
                    if !satisfied && !already_active {
                        set_step_status(store, session, process_instance_id, &state, lane, &current_name, "active")?;
                    }
                    satisfied
                }
                StepKind::Branch { target_step } => {
                    if find_step(&steps, lane, target_step).is_none() {
                        return Err(KernelError::SchemaInvalid {
                            reason: format!(
                                "branch_step target '{target_step}' is not a step in lane '{lane}'"
                            ),
                        });
                    }
                    let lane_order: Vec<&str> =
                        steps.iter().filter(|s| s.lane == *lane).map(|s| s.name.as_str()).collect();
                    let from_pos = lane_order.iter().position(|n| *n == current_name).unwrap_or(0);
                    let to_pos = lane_order.iter().position(|n| *n == target_step.as_str()).unwrap_or(from_pos);

                    let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
                    set_step_status(store, session, process_instance_id, &state, lane, &current_name, "completed")?;
                    if to_pos > from_pos {
                        for skipped in &lane_order[from_pos + 1..to_pos] {
                            let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
                            set_step_status(store, session, process_instance_id, &state, lane, skipped, "skipped")?;
                        }
                    }
                    let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
                    set_step_status(store, session, process_instance_id, &state, lane, target_step, "active")?;
                    let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
                    set_lane_cursor(store, session, process_instance_id, &state, lane, Some(target_step))?;
                    continue;
                }
            };

            if !advanced {
                break;
            }
            let next = next_step_name(&steps, lane, &current_name).map(str::to_string);
            let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
            set_step_status(store, session, process_instance_id, &state, lane, &current_name, "completed")?;
            if let Some(next_name) = &next {
                let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
                set_step_status(store, session, process_instance_id, &state, lane, next_name, "active")?;
            }
            let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
            set_lane_cursor(store, session, process_instance_id, &state, lane, next.as_deref())?;
            if next.is_none() {
                break;
            }
        }
    }

    let final_state = entity::materialize(store, &res.branch_id, process_instance_id)?;
    if instance_status(&final_state) == "running" {
        let cursors = lane_cursors(&final_state);
        if lanes.iter().all(|lane| cursors.get(lane).cloned().flatten().is_none()) {
            set_instance_status(store, session, process_instance_id, "completed")?;
        }
    }
    Ok(())
}

/// Cancel a running process instance. A no-op if it has already reached a
/// terminal status.
pub fn cancel_process(store: &TessellaStore, session: &Session, process_instance_id: Ulid) -> KernelResult<()> {
    let res = store.get_res(&process_instance_id)?;
    let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
    if instance_status(&state) != "running" {
        return Ok(());
    }
    set_instance_status(store, session, process_instance_id, "cancelled")
}

fn set_lane_cursor(
    store: &TessellaStore,
    session: &Session,
    process_instance_id: Ulid,
    state: &crate::tessella::EntityState,
    lane: &str,
    step_name: Option<&str>,
) -> KernelResult<()> {
    let mut cursors = match state.attributes.get("lane_cursors") {
        Some(JsonValue::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    cursors.insert(
        lane.to_string(),
        step_name.map(|s| JsonValue::String(s.to_string())).unwrap_or(JsonValue::Null),
    );
    entity::set_attribute(
        store,
        session,
        process_instance_id,
        "lane_cursors",
        JsonValue::Object(cursors),
    )
}

/// Mark a lane's current task step's underlying `Task` entity done,
/// then advance the process — this is how external callers drive
/// task-gated lanes forward.
pub fn complete_task_step(
    store: &TessellaStore,
    session: &Session,
    process_instance_id: Ulid,
    lane: &str,
) -> KernelResult<()> {
    let res = store.get_res(&process_instance_id)?;
    let state = entity::materialize(store, &res.branch_id, process_instance_id)?;
    let cursors = lane_cursors(&state);
    let current = cursors.get(lane).cloned().flatten().ok_or_else(|| KernelError::NotFound {
        kind: "lane",
        id: lane.to_string(),
    })?;
    let task_attr_key = format!("__task_id_{lane}_{current}");
    let task_id: Ulid = state
        .attributes
        .get(&task_attr_key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| KernelError::NotFound {
            kind: "task",
            id: task_attr_key.clone(),
        })?
        .parse()
        .map_err(|_| KernelError::SchemaInvalid {
            reason: "corrupt task id recorded on process instance".to_string(),
        })?;
    entity::transition_status(store, session, task_id, "done")?;
    advance(store, session, process_instance_id)
}
