//! Workspace (tenancy) scoping (§4.10).
//!
//! A workspace is a sentinel-genus entity like any other; `Res::workspace_id`
//! is what actually scopes ownership, set once at creation time from the
//! caller's `Session` and never changed afterward.
use serde_json::Map;
use tracing::instrument;

use crate::entity;
use crate::error::KernelResult;
use crate::ids::{sentinel_ids, Ulid, MAIN_BRANCH};
use crate::session::Session;
use crate::tessella::TessellaStore;

/// Create a new workspace. Workspaces themselves always live unscoped
/// (`workspace_id = None`) — a workspace can't belong to itself.
#[instrument(skip(store))]
pub fn create_workspace(store: &TessellaStore, name: &str) -> KernelResult<Ulid> {
    let session = Session::main();
    let mut attrs = Map::new();
    attrs.insert("name".to_string(), serde_json::Value::String(name.to_string()));
    entity::create_entity(store, &session, sentinel_ids::WORKSPACE_GENUS, attrs, None)
}

/// Every res scoped to `workspace_id`, across all genera and branches.
pub fn res_in_workspace(store: &TessellaStore, workspace_id: Ulid) -> KernelResult<Vec<Ulid>> {
    let mut out = Vec::new();
    for id in store.all_res_ids() {
        let res = store.get_res(&id)?;
        if res.workspace_id == Some(workspace_id) {
            out.push(id);
        }
    }
    out.sort();
    Ok(out)
}
