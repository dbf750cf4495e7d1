//! The sync protocol (§4.7): watermark-based pull/push between nodes.
//!
//! This is deliberately last-writer-wins, not CRDT or consensus-based
//! (§1 non-goals) — conflicting edits are just more tessellae, ordered by
//! whichever node's clock assigned them later in the combined log. Echo
//! suppression (tagging facts with their origin device) is what keeps a
//! push-then-pull round trip from re-importing a device's own writes.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::{debug, instrument};

use crate::entity::{self, EntityFilter};
use crate::error::KernelResult;
use crate::ids::{sentinel_ids, Ulid, MAIN_BRANCH};
use crate::session::Session;
use crate::tessella::{Tessella, TessellaStore};

/// Minimal identity for a res a peer doesn't know about yet, sent
/// alongside the tessellae that reference it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResBootstrap {
    pub res_id: Ulid,
    pub genus_id: Ulid,
    pub branch_id: String,
    pub workspace_id: Option<Ulid>,
}

/// A peer's request to pull everything new since `high_water_mark`. The
/// field is named `since` on the wire (§4.7, §6's canonical
/// `{since, device_id}` shape) so a peer built directly from the wire
/// contract doesn't need to know this crate's internal field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub device_id: String,
    #[serde(rename = "since")]
    pub high_water_mark: u64,
}

/// What a pull request returns: new facts, the res they belong to (for
/// peers that haven't seen that res before), and any genus definitions
/// those res depend on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub res_bootstrap: Vec<ResBootstrap>,
    pub tessellae: Vec<Tessella>,
    pub new_high_water_mark: u64,
}

/// A peer's request to push tessellae it holds that the server may not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub res_bootstrap: Vec<ResBootstrap>,
    pub tessellae: Vec<Tessella>,
}

fn device_entity_id(store: &TessellaStore, device_id: &str) -> KernelResult<Option<Ulid>> {
    let filter = EntityFilter {
        attribute_equals: Some(("device_id".to_string(), serde_json::Value::String(device_id.to_string()))),
        ..Default::default()
    };
    let matches = entity::list_entities(store, MAIN_BRANCH, sentinel_ids::DEVICE_GENUS, &filter)?;
    Ok(matches.into_iter().next().map(|(id, _)| id))
}

/// Register a device on first contact, or touch its `last_sync_at`.
fn register_or_touch_device(store: &TessellaStore, device_id: &str) -> KernelResult<Ulid> {
    let session = Session::main();
    match device_entity_id(store, device_id)? {
        Some(id) => {
            entity::set_attribute(
                store,
                &session,
                id,
                "last_sync_at",
                serde_json::Value::String(Utc::now().to_rfc3339()),
            )?;
            Ok(id)
        }
        None => {
            let mut attrs = Map::new();
            attrs.insert("device_id".to_string(), serde_json::Value::String(device_id.to_string()));
            attrs.insert("last_sync_at".to_string(), serde_json::Value::String(Utc::now().to_rfc3339()));
            entity::create_entity(store, &session, sentinel_ids::DEVICE_GENUS, attrs, None)
        }
    }
}

/// Serve a pull: every tessella past the watermark, on a non-sentinel res,
/// that the requesting device didn't itself author (echo suppression),
/// capped at `max_batch` (0 = unlimited), plus bootstrap rows for any res
/// the peer hasn't seen and the genus tessellae those res depend on.
#[instrument(skip(store))]
pub fn pull(store: &TessellaStore, request: &PullRequest, max_batch: usize) -> KernelResult<PullResponse> {
    register_or_touch_device(store, &request.device_id)?;
    let own_echo = format!("device:{}", request.device_id);

    let mut candidates: Vec<Tessella> = Vec::new();
    let mut res_ids_seen = std::collections::HashSet::new();
    for res_id in store.all_res_ids() {
        if sentinel_ids::is_sentinel_res(&res_id) {
            continue;
        }
        let res = store.get_res(&res_id)?;
        if sentinel_ids::is_sentinel_genus(&res.genus_id) {
            continue;
        }
        for tessella in store.history_since(&res_id, request.high_water_mark) {
            if tessella.source.as_deref() == Some(own_echo.as_str()) {
                continue;
            }
            res_ids_seen.insert(res_id);
            candidates.push(tessella);
        }
    }
    candidates.sort_by_key(|t| t.id);
    if max_batch > 0 && candidates.len() > max_batch {
        candidates.truncate(max_batch);
    }

    let new_high_water_mark = candidates.last().map(|t| t.id).unwrap_or(request.high_water_mark);

    let mut res_bootstrap = Vec::new();
    let mut genus_ids = std::collections::HashSet::new();
    for res_id in &res_ids_seen {
        let res = store.get_res(res_id)?;
        res_bootstrap.push(ResBootstrap {
            res_id: *res_id,
            genus_id: res.genus_id,
            branch_id: res.branch_id,
            workspace_id: res.workspace_id,
        });
        genus_ids.insert(res.genus_id);
    }
    for genus_id in genus_ids {
        if sentinel_ids::is_sentinel_genus(&genus_id) {
            continue;
        }
        let genus_res = store.get_res(&genus_id)?;
        res_bootstrap.push(ResBootstrap {
            res_id: genus_id,
            genus_id: sentinel_ids::META_GENUS,
            branch_id: genus_res.branch_id.clone(),
            workspace_id: None,
        });
        candidates.extend(store.history(&genus_id));
    }
    candidates.sort_by_key(|t| t.id);

    debug!(device = request.device_id, count = candidates.len(), "pull served");
    Ok(PullResponse {
        res_bootstrap,
        tessellae: candidates,
        new_high_water_mark,
    })
}

/// Apply a push: bootstrap any unfamiliar res, then ingest each tessella,
/// tagging untagged facts with the pushing device's origin so a later
/// pull round trip doesn't echo them straight back.
#[instrument(skip(store, request))]
pub fn push(store: &TessellaStore, request: PushRequest) -> KernelResult<usize> {
    register_or_touch_device(store, &request.device_id)?;
    let origin = format!("device:{}", request.device_id);

    for bootstrap in &request.res_bootstrap {
        store.ensure_res(bootstrap.res_id, bootstrap.genus_id, &bootstrap.branch_id, bootstrap.workspace_id);
    }

    let mut ingested = 0usize;
    for mut tessella in request.tessellae {
        if !store.contains_res(&tessella.res_id) {
            continue; // no bootstrap row; drop rather than guess a genus
        }
        let already_known = store.history(&tessella.res_id).iter().any(|t| t.id == tessella.id);
        if already_known {
            continue;
        }
        if tessella.source.is_none() {
            tessella.source = Some(origin.clone());
        }
        store.ingest(tessella)?;
        ingested += 1;
    }
    debug!(device = request.device_id, ingested, "push applied");
    Ok(ingested)
}
