//! Optional background scheduler (§4.8) for embedders who would rather have
//! cron/trigger ticks driven automatically than call [`crate::cron`] from
//! their own event loop. Grounded in the teacher's tokio-backed async
//! runtime (`runtime/mod.rs`) — without the teacher's WASM-portable
//! `Runtime` trait abstraction, since this kernel targets native embedders
//! only and a plain `tokio::spawn` is enough.
//!
//! Parsing a cron expression into "is this due right now" stays out of
//! scope (see `crate::cron`'s own doc comment): every known `CronSchedule`
//! and `ScheduledTrigger` is re-ticked on every interval, leaning on
//! `tick_cron_schedules`'s same-minute dedup and `tick_scheduled_triggers`'s
//! own `fire_at`/`fired` check to make that safe to do unconditionally.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, instrument};

use crate::entity::{self, EntityFilter};
use crate::error::KernelResult;
use crate::ids::sentinel_ids;
use crate::kernel::Kernel;
use crate::session::Session;

/// A background tokio task that ticks cron schedules and scheduled
/// triggers on a fixed interval.
pub struct BackgroundScheduler {
    handle: tokio::task::JoinHandle<()>,
}

impl BackgroundScheduler {
    /// Spawn a ticker against `kernel` on `session`'s branch, firing once
    /// per `period`. Must be called from within a tokio runtime.
    pub fn spawn(kernel: Arc<Kernel>, session: Session, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = tick_once(&kernel, &session) {
                    error!(error = %e, "background scheduler tick failed");
                }
            }
        });
        Self { handle }
    }

    /// Stop the background task. Dropping the handle without calling this
    /// leaves the task running detached.
    pub fn stop(self) {
        self.handle.abort();
    }
}

#[instrument(skip(kernel, session))]
fn tick_once(kernel: &Kernel, session: &Session) -> KernelResult<()> {
    let now = Utc::now();

    let schedules = entity::list_entities(
        kernel.store(),
        &session.branch_id,
        sentinel_ids::CRON_SCHEDULE_GENUS,
        &EntityFilter::default(),
    )?;
    let schedule_ids: Vec<_> = schedules.into_iter().map(|(id, _)| id).collect();
    kernel.tick_cron_schedules(session, &schedule_ids, now)?;

    let triggers = entity::list_entities(
        kernel.store(),
        &session.branch_id,
        sentinel_ids::SCHEDULED_TRIGGER_GENUS,
        &EntityFilter::default(),
    )?;
    let trigger_ids: Vec<_> = triggers.into_iter().map(|(id, _)| id).collect();
    kernel.tick_scheduled_triggers(session, &trigger_ids, now)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, Value as JsonValue};

    use super::*;
    use crate::action::{ActionEffect, ResourceDef};
    use crate::genus::{define_genus, GenusDiff, GenusKind, StateDef, TransitionDef};
    use crate::ids::{MAIN_BRANCH, Ulid};

    #[tokio::test]
    async fn scheduler_fires_a_due_one_shot_trigger_in_the_background() {
        let kernel = Arc::new(Kernel::new().unwrap());
        let session = Session::main();

        let lamp_genus_id = Ulid::new();
        define_genus(
            kernel.store(),
            lamp_genus_id,
            "lamp",
            GenusKind::Entity,
            MAIN_BRANCH,
            GenusDiff {
                states: vec![
                    StateDef { name: "off".into(), initial: true },
                    StateDef { name: "on".into(), initial: false },
                ],
                transitions: vec![TransitionDef { from: "off".into(), to: "on".into(), name: None }],
                ..Default::default()
            },
        )
        .unwrap();
        let lamp_id = entity::create_entity(kernel.store(), &session, lamp_genus_id, Map::new(), None).unwrap();

        let action_genus_id = Ulid::new();
        define_genus(
            kernel.store(),
            action_genus_id,
            "turn_on",
            GenusKind::Action,
            MAIN_BRANCH,
            GenusDiff {
                meta: vec![
                    (
                        "resources".into(),
                        serde_json::to_value(vec![ResourceDef {
                            name: "lamp".into(),
                            genus_id: lamp_genus_id,
                            required_status: Some("off".into()),
                        }])
                        .unwrap(),
                    ),
                    (
                        "handler".into(),
                        serde_json::to_value(vec![ActionEffect::TransitionStatus {
                            resource: "lamp".into(),
                            to: "on".into(),
                        }])
                        .unwrap(),
                    ),
                ],
                ..Default::default()
            },
        )
        .unwrap();

        let mut trigger_attrs = Map::new();
        trigger_attrs.insert(
            "action_genus_id".to_string(),
            JsonValue::String(action_genus_id.to_string()),
        );
        let mut resources = Map::new();
        resources.insert("lamp".to_string(), JsonValue::String(lamp_id.to_string()));
        trigger_attrs.insert("resources".to_string(), JsonValue::Object(resources));
        trigger_attrs.insert("fire_at".to_string(), JsonValue::String(Utc::now().to_rfc3339()));
        entity::create_entity(
            kernel.store(),
            &session,
            sentinel_ids::SCHEDULED_TRIGGER_GENUS,
            trigger_attrs,
            None,
        )
        .unwrap();

        let scheduler = BackgroundScheduler::spawn(kernel.clone(), session.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop();

        let lamp_state = kernel.entity_state(MAIN_BRANCH, lamp_id).unwrap();
        assert_eq!(lamp_state.status.as_deref(), Some("on"));
    }
}
