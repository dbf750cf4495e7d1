//! Task entity helpers (§4.8/§4.5 support): a thin, typed face on the
//! sentinel `Task` genus, used directly by callers and internally by the
//! process engine's task steps.
use serde_json::{Map, Value as JsonValue};

use crate::entity;
use crate::error::KernelResult;
use crate::ids::{sentinel_ids, Ulid};
use crate::session::Session;
use crate::tessella::TessellaStore;

/// Create an open task.
pub fn create_task(store: &TessellaStore, session: &Session, title: &str) -> KernelResult<Ulid> {
    let mut attrs = Map::new();
    attrs.insert("title".to_string(), JsonValue::String(title.to_string()));
    entity::create_entity(store, session, sentinel_ids::TASK_GENUS, attrs, None)
}

/// Move a task to `in_progress`.
pub fn start_task(store: &TessellaStore, session: &Session, task_id: Ulid) -> KernelResult<()> {
    entity::transition_status(store, session, task_id, "in_progress")
}

/// Mark a task `done`, from whichever status it's currently in (direct
/// `open -> done` and `in_progress -> done` are both declared edges on the
/// sentinel genus).
pub fn complete_task(store: &TessellaStore, session: &Session, task_id: Ulid) -> KernelResult<()> {
    entity::transition_status(store, session, task_id, "done")
}

/// Every task not yet `done`.
pub fn list_open_tasks(store: &TessellaStore, branch_id: &str) -> KernelResult<Vec<Ulid>> {
    let mut out = Vec::new();
    for id in store.res_ids_by_genus(&sentinel_ids::TASK_GENUS) {
        let state = entity::materialize(store, branch_id, id)?;
        if state.status.as_deref() != Some("done") {
            out.push(id);
        }
    }
    out.sort();
    Ok(out)
}
