//! Cron and one-shot scheduled triggers (§4.8).
//!
//! Parsing a cron expression into "is this tick due" is out of scope for
//! the core (§1) — callers decide which `CronSchedule` ids are due for a
//! given tick and pass them in. What the kernel owns is the dedup
//! (`last_fired_at`'s minute must differ from `now`'s, so a tick called
//! twice within the same minute never double-fires) and the firing itself.
use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{error, instrument, warn};

use crate::action;
use crate::entity;
use crate::error::KernelResult;
use crate::ids::{sentinel_ids, Ulid};
use crate::session::Session;
use crate::tessella::TessellaStore;

fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive() && a.hour() == b.hour() && a.minute() == b.minute()
}

fn record_fire_failure(store: &TessellaStore, session: &Session, schedule_id: Ulid, reason: String) {
    let mut attrs = Map::new();
    attrs.insert("source_schedule_id".to_string(), JsonValue::String(schedule_id.to_string()));
    attrs.insert("reason".to_string(), JsonValue::String(reason));
    if let Err(e) = entity::create_entity(store, session, sentinel_ids::ERROR_GENUS, attrs, None) {
        error!(schedule_id = %schedule_id, error = %e, "failed to record cron firing error");
    }
}

fn fire_action(
    store: &TessellaStore,
    session: &Session,
    action_genus_id: Ulid,
    resources: &HashMap<String, Ulid>,
    params: &HashMap<String, JsonValue>,
) -> KernelResult<()> {
    action::take_action(store, session, action_genus_id, resources.clone(), params.clone())
}

fn schedule_action_binding(
    state: &crate::tessella::EntityState,
) -> Option<(Ulid, HashMap<String, Ulid>, HashMap<String, JsonValue>)> {
    let action_genus_id: Ulid = state.attributes.get("action_genus_id")?.as_str()?.parse().ok()?;
    let resources = match state.attributes.get("resources") {
        Some(JsonValue::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().and_then(|s| s.parse().ok()).map(|id| (k.clone(), id)))
            .collect(),
        _ => HashMap::new(),
    };
    let params = match state.attributes.get("params") {
        Some(JsonValue::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    };
    Some((action_genus_id, resources, params))
}

/// Fire every due `CronSchedule` in `due_schedule_ids` at `now`, skipping
/// any whose `last_fired_at` already falls in the same minute.
#[instrument(skip(store, due_schedule_ids))]
pub fn tick_cron_schedules(
    store: &TessellaStore,
    session: &Session,
    due_schedule_ids: &[Ulid],
    now: DateTime<Utc>,
) -> KernelResult<usize> {
    let mut fired = 0usize;
    for schedule_id in due_schedule_ids {
        let state = entity::materialize(store, &session.branch_id, *schedule_id)?;
        if let Some(last) = state.attributes.get("last_fired_at").and_then(|v| v.as_str()) {
            if let Ok(last_at) = DateTime::parse_from_rfc3339(last) {
                if same_minute(last_at.with_timezone(&Utc), now) {
                    continue;
                }
            }
        }
        match schedule_action_binding(&state) {
            Some((action_genus_id, resources, params)) => {
                if let Err(e) = fire_action(store, session, action_genus_id, &resources, &params) {
                    record_fire_failure(store, session, *schedule_id, e.to_string());
                } else {
                    fired += 1;
                }
            }
            None => warn!(schedule_id = %schedule_id, "cron schedule has no action binding"),
        }
        entity::set_attribute(
            store,
            session,
            *schedule_id,
            "last_fired_at",
            JsonValue::String(now.to_rfc3339()),
        )?;
    }
    Ok(fired)
}

/// Fire every `ScheduledTrigger` whose `fire_at` has passed and that
/// hasn't fired yet. One-shot: `fired = true` makes it inert forever.
#[instrument(skip(store))]
pub fn tick_scheduled_triggers(
    store: &TessellaStore,
    session: &Session,
    trigger_ids: &[Ulid],
    now: DateTime<Utc>,
) -> KernelResult<usize> {
    let mut fired = 0usize;
    for trigger_id in trigger_ids {
        let state = entity::materialize(store, &session.branch_id, *trigger_id)?;
        if state.attributes.get("fired").and_then(|v| v.as_bool()).unwrap_or(false) {
            continue;
        }
        let due = state
            .attributes
            .get("fire_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc) <= now)
            .unwrap_or(false);
        if !due {
            continue;
        }
        match schedule_action_binding(&state) {
            Some((action_genus_id, resources, params)) => {
                if let Err(e) = fire_action(store, session, action_genus_id, &resources, &params) {
                    record_fire_failure(store, session, *trigger_id, e.to_string());
                    continue; // leave unfired so a future tick can retry
                }
                fired += 1;
            }
            None => warn!(trigger_id = %trigger_id, "scheduled trigger has no action binding"),
        }
        entity::set_attribute(store, session, *trigger_id, "fired", JsonValue::Bool(true))?;
    }
    Ok(fired)
}
