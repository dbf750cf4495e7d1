//! Integration tests mirroring the kernel's documented scenarios end to end
//! through the public `Kernel` facade.
use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};
use tessera::prelude::*;

fn entity_genus(
    kernel: &Kernel,
    session: &Session,
    name: &str,
    states: Vec<StateDef>,
    transitions: Vec<TransitionDef>,
    attributes: Vec<AttributeDef>,
) -> Ulid {
    let (genus_id, _) = kernel
        .define_genus(
            name,
            GenusKind::Entity,
            session,
            GenusDiff {
                states,
                transitions,
                attributes,
                ..Default::default()
            },
        )
        .unwrap();
    genus_id
}

// S1 (create + evolve): define `Product` with states {draft(initial),
// active, discontinued}, create with target_status="active", then evolve
// the genus to add a `price` attribute and set it.
#[test]
fn s1_create_and_evolve() {
    let kernel = Kernel::new().unwrap();
    let session = Session::main();

    let product_genus = entity_genus(
        &kernel,
        &session,
        "product",
        vec![
            StateDef { name: "draft".into(), initial: true },
            StateDef { name: "active".into(), initial: false },
            StateDef { name: "discontinued".into(), initial: false },
        ],
        vec![
            TransitionDef { from: "draft".into(), to: "active".into(), name: None },
            TransitionDef { from: "active".into(), to: "discontinued".into(), name: None },
        ],
        Vec::new(),
    );

    let entity_id = kernel
        .create_entity(&session, product_genus, Map::new(), Some("active"))
        .unwrap();

    let history = kernel.store().history(&entity_id);
    assert_eq!(history.len(), 2, "expected one created + one status_changed tessella");
    assert!(matches!(history[0].tag, tessera::tessella::TessellaTag::Created));
    assert!(matches!(
        history[1].tag,
        tessera::tessella::TessellaTag::StatusChanged { .. }
    ));

    kernel
        .evolve_genus(
            &product_genus,
            &session,
            GenusDiff {
                attributes: vec![AttributeDef {
                    name: "price".into(),
                    attribute_type: AttributeType::Number,
                    required: false,
                    default_value: None,
                }],
                ..Default::default()
            },
        )
        .unwrap();

    kernel
        .set_attribute(&session, entity_id, "price", JsonValue::from(29.99))
        .unwrap();

    let state = kernel.entity_state(&session.branch_id, entity_id).unwrap();
    assert_eq!(state.status.as_deref(), Some("active"));
    assert_eq!(state.attributes.get("price"), Some(&JsonValue::from(29.99)));
}

// S2 (BFS path): genus `Issue` with chain draft -> in_review -> approved ->
// published. create_entity(target_status="published") walks all three
// edges; target_status="archived" (unreachable) raises NoTransitionPath.
#[test]
fn s2_bfs_path_and_no_path() {
    let kernel = Kernel::new().unwrap();
    let session = Session::main();

    let issue_genus = entity_genus(
        &kernel,
        &session,
        "issue",
        vec![
            StateDef { name: "draft".into(), initial: true },
            StateDef { name: "in_review".into(), initial: false },
            StateDef { name: "approved".into(), initial: false },
            StateDef { name: "published".into(), initial: false },
        ],
        vec![
            TransitionDef { from: "draft".into(), to: "in_review".into(), name: None },
            TransitionDef { from: "in_review".into(), to: "approved".into(), name: None },
            TransitionDef { from: "approved".into(), to: "published".into(), name: None },
        ],
        Vec::new(),
    );

    let published = kernel
        .create_entity(&session, issue_genus, Map::new(), Some("published"))
        .unwrap();
    let history = kernel.store().history(&published);
    let status_changes = history
        .iter()
        .filter(|t| matches!(t.tag, tessera::tessella::TessellaTag::StatusChanged { .. }))
        .count();
    assert_eq!(status_changes, 3, "expected exactly three status_changed tessellae in path order");
    let state = kernel.entity_state(&session.branch_id, published).unwrap();
    assert_eq!(state.status.as_deref(), Some("published"));

    let err = kernel
        .create_entity(&session, issue_genus, Map::new(), Some("archived"))
        .unwrap_err();
    assert!(matches!(err, KernelError::NoTransitionPath { .. }));
}

// S3 (action atomicity): `deploy(server=Server@active)` against a server in
// `draft` must fail with PreconditionFailed and must not touch the server.
#[test]
fn s3_action_atomicity_on_precondition_failure() {
    let kernel = Kernel::new().unwrap();
    let session = Session::main();

    let server_genus = entity_genus(
        &kernel,
        &session,
        "server",
        vec![
            StateDef { name: "draft".into(), initial: true },
            StateDef { name: "active".into(), initial: false },
            StateDef { name: "deployed".into(), initial: false },
        ],
        vec![
            TransitionDef { from: "draft".into(), to: "active".into(), name: None },
            TransitionDef { from: "active".into(), to: "deployed".into(), name: None },
        ],
        Vec::new(),
    );

    let resources = vec![tessera::action::ResourceDef {
        name: "server".into(),
        genus_id: server_genus,
        required_status: Some("active".into()),
    }];
    let parameters = vec![tessera::action::ParameterDef {
        name: "version".into(),
        parameter_type: AttributeType::Text,
        required: true,
    }];
    let handler = vec![
        tessera::action::ActionEffect::TransitionStatus {
            resource: "server".into(),
            to: "deployed".into(),
        },
        tessera::action::ActionEffect::CreateLog {
            message: JsonValue::String("deployed $param.version".into()),
        },
    ];
    let (action_genus, _) = kernel
        .define_genus(
            "deploy",
            GenusKind::Action,
            &session,
            GenusDiff {
                meta: vec![
                    ("resources".into(), serde_json::to_value(resources).unwrap()),
                    ("parameters".into(), serde_json::to_value(parameters).unwrap()),
                    ("handler".into(), serde_json::to_value(handler).unwrap()),
                ],
                ..Default::default()
            },
        )
        .unwrap();

    let server_id = kernel.create_entity(&session, server_genus, Map::new(), None).unwrap();
    let before = kernel.store().history(&server_id).len();

    let mut resources_bound = HashMap::new();
    resources_bound.insert("server".to_string(), server_id);
    let mut params = HashMap::new();
    params.insert("version".to_string(), JsonValue::String("1.2.3".into()));

    let err = kernel
        .take_action(&session, action_genus, resources_bound, params)
        .unwrap_err();
    assert!(matches!(err, KernelError::PreconditionFailed { .. }));

    let after = kernel.store().history(&server_id).len();
    assert_eq!(before, after, "server tessella count must be unchanged after a rejected action");
}

// S4 (process gate): lanes A{a1,a2} B{b1} Final{g: gate depends_on [a2,b1],
// pub: action_step}. The gate must not pass until the last of {a2,b1}
// completes, and the pub step then runs.
#[test]
fn s4_process_gate_waits_for_last_dependency() {
    let kernel = Kernel::new().unwrap();
    let session = Session::main();

    let log_marker = vec![tessera::action::ActionEffect::CreateLog {
        message: JsonValue::String("published".into()),
    }];
    let (publish_action, _) = kernel
        .define_genus(
            "publish",
            GenusKind::Action,
            &session,
            GenusDiff {
                meta: vec![("handler".into(), serde_json::to_value(log_marker).unwrap())],
                ..Default::default()
            },
        )
        .unwrap();

    let steps = vec![
        tessera::process::StepDef {
            lane: "a".into(),
            name: "a1".into(),
            kind: tessera::process::StepKind::Task { title: JsonValue::String("a1".into()) },
        },
        tessera::process::StepDef {
            lane: "a".into(),
            name: "a2".into(),
            kind: tessera::process::StepKind::Task { title: JsonValue::String("a2".into()) },
        },
        tessera::process::StepDef {
            lane: "b".into(),
            name: "b1".into(),
            kind: tessera::process::StepKind::Task { title: JsonValue::String("b1".into()) },
        },
        tessera::process::StepDef {
            lane: "final".into(),
            name: "g".into(),
            kind: tessera::process::StepKind::Gate {
                depends_on: vec![
                    tessera::process::GateDependency { lane: "a".into(), step: "a2".into() },
                    tessera::process::GateDependency { lane: "b".into(), step: "b1".into() },
                ],
            },
        },
        tessera::process::StepDef {
            lane: "final".into(),
            name: "pub".into(),
            kind: tessera::process::StepKind::Action {
                action_genus_id: publish_action,
                resources: HashMap::new(),
                params: Map::new(),
            },
        },
    ];
    let (process_genus, _) = kernel
        .define_genus(
            "release",
            GenusKind::Process,
            &session,
            GenusDiff {
                meta: vec![("steps".into(), serde_json::to_value(steps).unwrap())],
                ..Default::default()
            },
        )
        .unwrap();

    let instance_id = kernel.start_process(&session, process_genus, Map::new()).unwrap();

    // Complete a1, b1, then a2 (out of the {a2,b1} set's nominal order).
    kernel.complete_task_step(&session, instance_id, "a").unwrap(); // a1 done, cursor now at a2
    kernel.complete_task_step(&session, instance_id, "b").unwrap(); // b1 done, gate still waits on a2
    let state = kernel.entity_state(&session.branch_id, instance_id).unwrap();
    assert!(
        state.attributes.get("lane_cursors").unwrap()["final"] == JsonValue::String("g".into()),
        "gate must still be blocked with only b1 complete"
    );

    kernel.complete_task_step(&session, instance_id, "a").unwrap(); // a2 done: gate passes, pub runs
    let state = kernel.entity_state(&session.branch_id, instance_id).unwrap();
    assert_eq!(
        state.attributes.get("lane_cursors").unwrap()["final"],
        JsonValue::Null,
        "final lane must run to completion once the gate passes"
    );
}

// S5 (branch+merge): set title="A" on main, fork "x", set title="B" on x.
// main still reads "A" until merge; after merge, main reads "B" and the
// merged tessella is tagged source="merge:x".
#[test]
fn s5_branch_and_merge() {
    let kernel = Kernel::new().unwrap();
    let main_session = Session::main();

    let doc_genus = entity_genus(
        &kernel,
        &main_session,
        "doc",
        Vec::new(),
        Vec::new(),
        vec![AttributeDef {
            name: "title".into(),
            attribute_type: AttributeType::Text,
            required: false,
            default_value: Some(JsonValue::String("".into())),
        }],
    );

    let entity_id = kernel.create_entity(&main_session, doc_genus, Map::new(), None).unwrap();
    kernel
        .set_attribute(&main_session, entity_id, "title", JsonValue::String("A".into()))
        .unwrap();

    kernel.create_branch(&main_session, "x", "main").unwrap();
    let branch_session = Session::on_branch("x");
    kernel
        .set_attribute(&branch_session, entity_id, "title", JsonValue::String("B".into()))
        .unwrap();

    let main_state = kernel.entity_state("main", entity_id).unwrap();
    assert_eq!(main_state.attributes.get("title"), Some(&JsonValue::String("A".into())));

    kernel.merge_branch("main", "x", false).unwrap();

    let main_state = kernel.entity_state("main", entity_id).unwrap();
    assert_eq!(main_state.attributes.get("title"), Some(&JsonValue::String("B".into())));

    let merged = kernel
        .store()
        .history(&entity_id)
        .into_iter()
        .find(|t| t.branch_id == "main" && t.source.as_deref() == Some("merge:x"));
    assert!(merged.is_some(), "merged tessella on main must be tagged source=\"merge:x\"");
}

// S6 (sync round-trip): CA creates Book E, pushes with device_id="CA". CB
// pulls with device_id="CB", since=0 and must see E's res bootstrap, the
// Book genus's defining tessellae, and the created/attribute_set facts.
// After CB ingests them, materializing E on CB yields {title, status}.
// CA pulling again sees nothing new for E (its own writes are echoed back
// to it already, via `source`, so a second pull returns zero tessellae).
#[test]
fn s6_sync_round_trip_with_echo_suppression() {
    let server = Kernel::new().unwrap();
    let server_session = Session::main();

    let book_genus = entity_genus(
        &server,
        &server_session,
        "book",
        vec![StateDef { name: "draft".into(), initial: true }],
        Vec::new(),
        vec![AttributeDef {
            name: "title".into(),
            attribute_type: AttributeType::Text,
            required: false,
            default_value: Some(JsonValue::String("".into())),
        }],
    );

    // CA's own local store, disjoint from the server, standing in for a
    // separate device.
    let client_a = tessera::tessella::TessellaStore::new(0);
    tessera::sentinel::bootstrap(&client_a).unwrap();
    // CA needs the genus locally before it can create an entity of that
    // kind; ingest the genus's own log from the server to bootstrap it.
    client_a.ensure_res(book_genus, tessera::ids::sentinel_ids::META_GENUS, "main", None);
    for t in server.store().history(&book_genus) {
        client_a.ingest(t).unwrap();
    }

    let mut attrs = Map::new();
    attrs.insert("title".to_string(), JsonValue::String("Novel".into()));
    let entity_id = tessera::entity::create_entity(&client_a, &server_session, book_genus, attrs, None).unwrap();

    let push = tessera::sync::PushRequest {
        device_id: "CA".to_string(),
        res_bootstrap: vec![tessera::sync::ResBootstrap {
            res_id: entity_id,
            genus_id: book_genus,
            branch_id: "main".to_string(),
            workspace_id: None,
        }],
        tessellae: client_a.history(&entity_id),
    };
    server.sync_push(push).unwrap();

    let pull_request = tessera::sync::PullRequest { device_id: "CB".to_string(), high_water_mark: 0 };
    let response = server.sync_pull(&pull_request).unwrap();
    assert!(response.res_bootstrap.iter().any(|b| b.res_id == entity_id));
    assert!(response
        .tessellae
        .iter()
        .any(|t| matches!(t.tag, tessera::tessella::TessellaTag::Created) && t.res_id == entity_id));
    assert!(response.tessellae.iter().any(|t| t.res_id == book_genus));

    // CB applies the pull response to its own local store.
    let client_b = tessera::tessella::TessellaStore::new(0);
    for bootstrap in &response.res_bootstrap {
        client_b.ensure_res(bootstrap.res_id, bootstrap.genus_id, &bootstrap.branch_id, bootstrap.workspace_id);
    }
    for t in response.tessellae {
        client_b.ingest(t).unwrap();
    }
    let cb_state = tessera::entity::materialize(&client_b, "main", entity_id).unwrap();
    assert_eq!(cb_state.attributes.get("title"), Some(&JsonValue::String("Novel".into())));
    assert_eq!(cb_state.status.as_deref(), Some("draft"));

    // CA pulling again (its own writes were tagged with its own device
    // origin on push) sees no further tessellae for E.
    let ca_pull = tessera::sync::PullRequest { device_id: "CA".to_string(), high_water_mark: 0 };
    let ca_response = server.sync_pull(&ca_pull).unwrap();
    assert!(ca_response.tessellae.iter().all(|t| t.res_id != entity_id));
}
