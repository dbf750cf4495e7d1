//! The `Kernel` facade: the crate's single public entry point (§6).
//!
//! Every method takes a [`Session`] explicitly rather than reading from
//! ambient state — concurrent callers on different branches never share a
//! hidden "current branch" (§5). Internally this is a thin, synchronous
//! wrapper over the free functions in `entity`/`feature`/.../`sync`; the
//! facade exists for embedders who want one type to hold, not because the
//! modules themselves need a home.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::info;

use crate::branch;
use crate::config::KernelConfig;
use crate::cron;
use crate::entity::{self, EntityFilter};
use crate::error::KernelResult;
use crate::feature;
use crate::genus::{self, GenusDef, GenusDiff, GenusKind};
use crate::health::{self, HealthIssue};
use crate::ids::Ulid;
use crate::process;
use crate::relationship;
use crate::action;
use crate::sentinel;
use crate::session::Session;
use crate::sync::{self, PullRequest, PullResponse, PushRequest};
use crate::task;
use crate::tessella::{EntityState, TessellaStore};
use crate::workspace;

/// The kernel: an in-memory tessella store plus the bootstrapped sentinel
/// genera, and every kernel operation as a method.
pub struct Kernel {
    store: TessellaStore,
    config: KernelConfig,
}

impl Kernel {
    /// Build a fresh kernel with default configuration and bootstrap the
    /// sentinel genera (§3) onto it.
    pub fn new() -> KernelResult<Self> {
        Self::with_config(KernelConfig::default())
    }

    /// Build a fresh kernel with explicit configuration.
    pub fn with_config(config: KernelConfig) -> KernelResult<Self> {
        let store = TessellaStore::new(config.store.replay_warn_threshold);
        sentinel::bootstrap(&store)?;
        info!("kernel initialized");
        Ok(Self { store, config })
    }

    /// Direct access to the underlying store, for callers building their
    /// own read paths (e.g. a future persistence/replication layer).
    pub fn store(&self) -> &TessellaStore {
        &self.store
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // -- genus ---------------------------------------------------------

    /// Define a new genus, returning its freshly minted id alongside its
    /// materialized shape.
    pub fn define_genus(
        &self,
        name: &str,
        kind: GenusKind,
        session: &Session,
        diff: GenusDiff,
    ) -> KernelResult<(Ulid, GenusDef)> {
        let genus_id = Ulid::new();
        let def = genus::define_genus(&self.store, genus_id, name, kind, &session.branch_id, diff)?;
        Ok((genus_id, def))
    }

    pub fn evolve_genus(&self, genus_id: &Ulid, session: &Session, diff: GenusDiff) -> KernelResult<GenusDef> {
        genus::evolve_genus(&self.store, genus_id, &session.branch_id, diff)
    }

    pub fn deprecate_genus(&self, genus_id: &Ulid, session: &Session) -> KernelResult<()> {
        genus::deprecate_genus(&self.store, genus_id, &session.branch_id)
    }

    pub fn restore_genus(&self, genus_id: &Ulid, session: &Session) -> KernelResult<()> {
        genus::restore_genus(&self.store, genus_id, &session.branch_id)
    }

    pub fn load_genus(&self, genus_id: &Ulid) -> KernelResult<GenusDef> {
        genus::load_genus(&self.store, genus_id)
    }

    // -- entity ----------------------------------------------------------

    pub fn create_entity(
        &self,
        session: &Session,
        genus_id: Ulid,
        attributes: Map<String, JsonValue>,
        target_status: Option<&str>,
    ) -> KernelResult<Ulid> {
        entity::create_entity(&self.store, session, genus_id, attributes, target_status)
    }

    pub fn set_attribute(&self, session: &Session, entity_id: Ulid, key: &str, value: JsonValue) -> KernelResult<()> {
        entity::set_attribute(&self.store, session, entity_id, key, value)
    }

    pub fn transition_status(&self, session: &Session, entity_id: Ulid, to: &str) -> KernelResult<()> {
        entity::transition_status(&self.store, session, entity_id, to)
    }

    pub fn transition_to(&self, session: &Session, entity_id: Ulid, target: &str) -> KernelResult<()> {
        entity::transition_to(&self.store, session, entity_id, target)
    }

    pub fn entity_state(&self, branch_id: &str, entity_id: Ulid) -> KernelResult<EntityState> {
        entity::materialize(&self.store, branch_id, entity_id)
    }

    pub fn list_entities(
        &self,
        branch_id: &str,
        genus_id: Ulid,
        filter: &EntityFilter,
    ) -> KernelResult<Vec<(Ulid, EntityState)>> {
        entity::list_entities(&self.store, branch_id, genus_id, filter)
    }

    // -- feature ---------------------------------------------------------

    pub fn create_feature(
        &self,
        session: &Session,
        parent_id: Ulid,
        feature_genus_id: Ulid,
        attributes: Map<String, JsonValue>,
    ) -> KernelResult<Ulid> {
        feature::create_feature(&self.store, session, parent_id, feature_genus_id, attributes)
    }

    pub fn set_feature_attribute(
        &self,
        session: &Session,
        parent_id: Ulid,
        feature_id: Ulid,
        key: &str,
        value: JsonValue,
    ) -> KernelResult<()> {
        feature::set_feature_attribute(&self.store, session, parent_id, feature_id, key, value)
    }

    pub fn transition_feature_status(
        &self,
        session: &Session,
        parent_id: Ulid,
        feature_id: Ulid,
        to: &str,
    ) -> KernelResult<()> {
        feature::transition_feature_status(&self.store, session, parent_id, feature_id, to)
    }

    // -- relationship ------------------------------------------------------

    pub fn create_relationship(
        &self,
        session: &Session,
        genus_id: Ulid,
        members: HashMap<String, Vec<Ulid>>,
    ) -> KernelResult<Ulid> {
        relationship::create_relationship(&self.store, session, genus_id, members)
    }

    pub fn add_member(&self, session: &Session, relationship_id: Ulid, role: &str, member_id: Ulid) -> KernelResult<()> {
        relationship::add_member(&self.store, session, relationship_id, role, member_id)
    }

    pub fn remove_member(&self, session: &Session, relationship_id: Ulid, role: &str, member_id: Ulid) -> KernelResult<()> {
        relationship::remove_member(&self.store, session, relationship_id, role, member_id)
    }

    // -- action ------------------------------------------------------------

    pub fn take_action(
        &self,
        session: &Session,
        action_genus_id: Ulid,
        resources: HashMap<String, Ulid>,
        params: HashMap<String, JsonValue>,
    ) -> KernelResult<()> {
        action::take_action(&self.store, session, action_genus_id, resources, params)
    }

    // -- process -------------------------------------------------------------

    pub fn start_process(
        &self,
        session: &Session,
        process_genus_id: Ulid,
        attributes: Map<String, JsonValue>,
    ) -> KernelResult<Ulid> {
        process::start_process(&self.store, session, process_genus_id, attributes)
    }

    pub fn advance_process(&self, session: &Session, process_instance_id: Ulid) -> KernelResult<()> {
        process::advance(&self.store, session, process_instance_id)
    }

    pub fn complete_task_step(&self, session: &Session, process_instance_id: Ulid, lane: &str) -> KernelResult<()> {
        process::complete_task_step(&self.store, session, process_instance_id, lane)
    }

    // -- branch --------------------------------------------------------------

    pub fn create_branch(&self, session: &Session, name: &str, parent_branch_id: &str) -> KernelResult<Ulid> {
        branch::create_branch(&self.store, session, name, parent_branch_id)
    }

    pub fn merge_branch(&self, target: &str, source: &str, force: bool) -> KernelResult<usize> {
        branch::merge_branch(&self.store, target, source, force)
    }

    // -- sync ----------------------------------------------------------------

    pub fn sync_pull(&self, request: &PullRequest) -> KernelResult<PullResponse> {
        sync::pull(&self.store, request, self.config.sync.max_pull_batch)
    }

    pub fn sync_push(&self, request: PushRequest) -> KernelResult<usize> {
        sync::push(&self.store, request)
    }

    // -- cron ------------------------------------------------------------------

    pub fn tick_cron_schedules(&self, session: &Session, due_schedule_ids: &[Ulid], now: DateTime<Utc>) -> KernelResult<usize> {
        cron::tick_cron_schedules(&self.store, session, due_schedule_ids, now)
    }

    pub fn tick_scheduled_triggers(&self, session: &Session, trigger_ids: &[Ulid], now: DateTime<Utc>) -> KernelResult<usize> {
        cron::tick_scheduled_triggers(&self.store, session, trigger_ids, now)
    }

    // -- health ----------------------------------------------------------------

    pub fn evaluate_health(&self, branch_id: &str, entity_id: Ulid) -> KernelResult<Vec<HealthIssue>> {
        health::evaluate_health(&self.store, branch_id, entity_id)
    }

    pub fn list_unhealthy(&self, branch_id: &str, genus_id: Ulid) -> KernelResult<Vec<(Ulid, Vec<HealthIssue>)>> {
        health::list_unhealthy(&self.store, branch_id, genus_id)
    }

    // -- workspace / task --------------------------------------------------------

    pub fn create_workspace(&self, name: &str) -> KernelResult<Ulid> {
        workspace::create_workspace(&self.store, name)
    }

    pub fn create_task(&self, session: &Session, title: &str) -> KernelResult<Ulid> {
        task::create_task(&self.store, session, title)
    }

    pub fn complete_task(&self, session: &Session, task_id: Ulid) -> KernelResult<()> {
        task::complete_task(&self.store, session, task_id)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new().expect("sentinel bootstrap against a fresh store never fails")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_bootstraps_sentinel_genera_on_construction() {
        let kernel = Kernel::new().unwrap();
        let genus = kernel.load_genus(&crate::ids::sentinel_ids::TASK_GENUS).unwrap();
        assert_eq!(genus.meta.name(), "task");
    }

    #[test]
    fn kernel_create_entity_and_transition_roundtrip() {
        let kernel = Kernel::new().unwrap();
        let session = Session::main();
        let (genus_id, _genus) = kernel
            .define_genus(
                "widget",
                GenusKind::Entity,
                &session,
                GenusDiff {
                    states: vec![
                        crate::genus::StateDef { name: "draft".into(), initial: true },
                        crate::genus::StateDef { name: "active".into(), initial: false },
                    ],
                    transitions: vec![crate::genus::TransitionDef {
                        from: "draft".into(),
                        to: "active".into(),
                        name: None,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let entity_id = kernel.create_entity(&session, genus_id, Map::new(), None).unwrap();
        kernel.transition_status(&session, entity_id, "active").unwrap();
        let state = kernel.entity_state(&session.branch_id, entity_id).unwrap();
        assert_eq!(state.status.as_deref(), Some("active"));
    }
}
