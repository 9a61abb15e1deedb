//! # Kernel Integration Tests
//!
//! End-to-end behavior through the command protocol: propagation, removal,
//! history, scheduling and persistence.

#![allow(clippy::unwrap_used, clippy::panic)]

use bassline_core::{
    BATCH_SCHEDULER, ContactId, CoreError, ErrorCode, ExternalInput, GroupId, GroupTemplate,
    GroupView, HISTORY_SOURCE, Kernel, KernelConfig, MemoryStorage, QueryOptions, RedbStorage,
    WireId, WireType, decode_template, encode_template,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tempfile::tempdir;

// =============================================================================
// HELPERS
// =============================================================================

fn kernel_with(config: KernelConfig) -> Kernel {
    let mut kernel = Kernel::with_storage(config, Box::new(MemoryStorage::new()));
    kernel.initialize().unwrap();
    kernel
}

fn kernel() -> Kernel {
    kernel_with(KernelConfig::default())
}

fn parse<T: DeserializeOwned>(value: Value) -> T {
    serde_json::from_value(value).unwrap()
}

fn add_group(kernel: &mut Kernel, name: &str, parent: Option<GroupId>) -> GroupId {
    parse(
        kernel
            .dispatch(ExternalInput::AddGroup {
                name: name.into(),
                parent_group_id: parent,
                primitive_id: None,
            })
            .unwrap(),
    )
}

fn add_contact(kernel: &mut Kernel, group: GroupId, content: Option<Value>) -> ContactId {
    parse(
        kernel
            .dispatch(ExternalInput::AddContact {
                group_id: group,
                content,
                blend_mode: None,
            })
            .unwrap(),
    )
}

fn connect(kernel: &mut Kernel, from: ContactId, to: ContactId, wire_type: WireType) -> WireId {
    parse(
        kernel
            .dispatch(ExternalInput::CreateWire {
                from_contact_id: from,
                to_contact_id: to,
                wire_type: Some(wire_type),
            })
            .unwrap(),
    )
}

fn update(kernel: &mut Kernel, group: GroupId, contact: ContactId, value: Value) {
    kernel
        .dispatch(ExternalInput::ContactUpdate {
            contact_id: contact,
            group_id: group,
            value: Some(value),
        })
        .unwrap();
}

fn content(kernel: &mut Kernel, contact: ContactId) -> Value {
    kernel
        .dispatch(ExternalInput::QueryContact {
            contact_id: contact,
        })
        .unwrap()
}

fn view(kernel: &mut Kernel, group: GroupId) -> GroupView {
    parse(
        kernel
            .dispatch(ExternalInput::QueryGroup {
                group_id: group,
                options: QueryOptions {
                    include_contacts: true,
                    include_wires: true,
                    include_subgroups: true,
                },
            })
            .unwrap(),
    )
}

fn undo_depth(kernel: &mut Kernel) -> usize {
    let history = kernel.dispatch(ExternalInput::GetHistory).unwrap();
    history["undo"].as_array().map_or(0, Vec::len)
}

fn template_shell() -> GroupTemplate {
    GroupTemplate {
        name: String::new(),
        contacts: Vec::new(),
        wires: Vec::new(),
        subgroups: Vec::new(),
        boundary_indices: Vec::new(),
        primitive: None,
    }
}

fn port(kernel: &Kernel, gadget: GroupId, name: &str) -> ContactId {
    kernel
        .runtime()
        .group(gadget)
        .and_then(|g| g.boundary_by_name(name))
        .map(|c| c.id)
        .unwrap()
}

// =============================================================================
// PROPAGATION
// =============================================================================

#[test]
fn connect_copies_content_to_empty_endpoint() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!({"k": 1})));
    let b = add_contact(&mut kernel, root, None);

    connect(&mut kernel, a, b, WireType::Bidirectional);

    assert_eq!(content(&mut kernel, b), json!({"k": 1}));
}

#[test]
fn bidirectional_connect_applies_each_blend_rule() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a: ContactId = parse(
        kernel
            .dispatch(ExternalInput::AddContact {
                group_id: root,
                content: Some(json!(3)),
                blend_mode: Some(bassline_core::BlendMode::Max),
            })
            .unwrap(),
    );
    let b: ContactId = parse(
        kernel
            .dispatch(ExternalInput::AddContact {
                group_id: root,
                content: Some(json!(9)),
                blend_mode: Some(bassline_core::BlendMode::Max),
            })
            .unwrap(),
    );

    connect(&mut kernel, a, b, WireType::Bidirectional);

    // b rejects the smaller 3; a grows to 9.
    assert_eq!(content(&mut kernel, a), json!(9));
    assert_eq!(content(&mut kernel, b), json!(9));
    assert_eq!(kernel.status().contradictions, 1);
}

#[test]
fn adder_gadget_sums_inputs() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let gadget: GroupId = parse(
        kernel
            .dispatch(ExternalInput::AddGroup {
                name: "adder".into(),
                parent_group_id: Some(root),
                primitive_id: Some("core/add".into()),
            })
            .unwrap(),
    );
    let a = add_contact(&mut kernel, root, None);
    let b = add_contact(&mut kernel, root, None);
    let sum = add_contact(&mut kernel, root, None);
    let (in_a, in_b, out) = (
        port(&kernel, gadget, "a"),
        port(&kernel, gadget, "b"),
        port(&kernel, gadget, "sum"),
    );
    connect(&mut kernel, a, in_a, WireType::Directed);
    connect(&mut kernel, b, in_b, WireType::Directed);
    connect(&mut kernel, out, sum, WireType::Directed);

    update(&mut kernel, root, a, json!(5));
    update(&mut kernel, root, b, json!(3));

    assert_eq!(content(&mut kernel, sum), json!(8));
}

// =============================================================================
// REMOVAL
// =============================================================================

#[test]
fn removing_a_wire_clears_orphaned_endpoints() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!("v")));
    let b = add_contact(&mut kernel, root, None);
    let wire = connect(&mut kernel, a, b, WireType::Bidirectional);

    kernel
        .dispatch(ExternalInput::RemoveWire { wire_id: wire })
        .unwrap();

    assert_eq!(content(&mut kernel, a), Value::Null);
    assert_eq!(content(&mut kernel, b), Value::Null);
}

#[test]
fn removing_a_contact_drops_its_wire_and_orphans_the_peer() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!(1)));
    let b = add_contact(&mut kernel, root, None);
    connect(&mut kernel, a, b, WireType::Bidirectional);
    assert_eq!(content(&mut kernel, b), json!(1));

    kernel
        .dispatch(ExternalInput::RemoveContact { contact_id: a })
        .unwrap();

    let group = view(&mut kernel, root);
    assert!(group.wires.unwrap().is_empty());
    assert_eq!(group.contacts.unwrap().len(), 1);
    assert_eq!(content(&mut kernel, b), Value::Null);
}

#[test]
fn unknown_ids_are_reported_not_found() {
    let mut kernel = kernel();
    let response = kernel.execute_json(json!({
        "requestId": "q1",
        "type": "query-contact",
        "contactId": 987654321
    }));
    assert_eq!(response.request_id.as_deref(), Some("q1"));
    assert_eq!(
        response.error.map(|e| e.code),
        Some(bassline_core::ErrorCode::NotFound)
    );
}

// =============================================================================
// HISTORY
// =============================================================================

#[test]
fn undo_restores_contents_wires_and_groups_exactly() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!(1)));
    let b = add_contact(&mut kernel, root, None);
    let c = add_contact(&mut kernel, root, None);
    let ab = connect(&mut kernel, a, b, WireType::Bidirectional);
    let before = kernel.runtime().group(root).unwrap().snapshot();

    kernel
        .record("rewire", |k| {
            k.dispatch(ExternalInput::RemoveWire { wire_id: ab })?;
            k.dispatch(ExternalInput::AddGroup {
                name: "child".into(),
                parent_group_id: Some(root),
                primitive_id: None,
            })?;
            k.dispatch(ExternalInput::CreateWire {
                from_contact_id: b,
                to_contact_id: c,
                wire_type: None,
            })?;
            k.dispatch(ExternalInput::ContactUpdate {
                contact_id: c,
                group_id: root,
                value: Some(json!(7)),
            })?;
            Ok(())
        })
        .unwrap();
    let after = kernel.runtime().group(root).unwrap().snapshot();
    assert_ne!(before, after);
    assert_eq!(content(&mut kernel, b), json!(7));

    kernel.undo().unwrap();
    assert_eq!(kernel.runtime().group(root).unwrap().snapshot(), before);

    kernel.redo().unwrap();
    assert_eq!(kernel.runtime().group(root).unwrap().snapshot(), after);
}

#[test]
fn undo_reverts_to_recorded_value_despite_later_writes() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, None);

    kernel
        .record("set", |k| {
            k.dispatch(ExternalInput::ContactUpdate {
                contact_id: a,
                group_id: root,
                value: Some(json!(1)),
            })
        })
        .unwrap();
    update(&mut kernel, root, a, json!(5));

    kernel.undo().unwrap();

    assert_eq!(content(&mut kernel, a), Value::Null);
}

#[test]
fn cancel_batch_keeps_effects_but_records_nothing() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let depth = undo_depth(&mut kernel);

    kernel
        .dispatch(ExternalInput::StartRecording {
            description: "drag".into(),
        })
        .unwrap();
    for n in 0..3 {
        add_contact(&mut kernel, root, Some(json!(n)));
    }
    assert_eq!(kernel.cancel_batch().unwrap(), 3);

    assert_eq!(undo_depth(&mut kernel), depth);
    assert_eq!(view(&mut kernel, root).contacts.unwrap().len(), 3);
}

#[test]
fn history_misuse_is_a_conflict() {
    let mut kernel = kernel();
    let code = |response: bassline_core::CommandResponse| response.error.map(|e| e.code);

    let stop = kernel.execute_json(json!({"type": "stop-recording"}));
    assert_eq!(code(stop), Some(bassline_core::ErrorCode::Conflict));

    let undo = kernel.execute_json(json!({"type": "undo"}));
    assert_eq!(code(undo), Some(bassline_core::ErrorCode::Conflict));

    kernel.execute_json(json!({"type": "start-recording", "description": "one"}));
    let again = kernel.execute_json(json!({"type": "start-recording", "description": "two"}));
    assert_eq!(code(again), Some(bassline_core::ErrorCode::Conflict));
    let undo_while_recording = kernel.execute_json(json!({"type": "undo"}));
    assert_eq!(
        code(undo_while_recording),
        Some(bassline_core::ErrorCode::Conflict)
    );
}

#[test]
fn undo_of_group_removal_restores_parent_wires() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!(true)));
    let gadget: GroupId = parse(
        kernel
            .dispatch(ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/not".into(),
                parent_group_id: Some(root),
            })
            .unwrap(),
    );
    let input = port(&kernel, gadget, "value");
    connect(&mut kernel, a, input, WireType::Directed);
    let before = kernel.runtime().group(root).unwrap().snapshot();

    kernel
        .record("delete gadget", |k| {
            k.dispatch(ExternalInput::RemoveGroup { group_id: gadget })
        })
        .unwrap();
    assert_eq!(content(&mut kernel, a), Value::Null);

    kernel.undo().unwrap();

    assert_eq!(kernel.runtime().group(root).unwrap().snapshot(), before);
    assert_eq!(
        kernel
            .runtime()
            .group(gadget)
            .and_then(|g| g.boundary_by_name("result"))
            .and_then(|c| c.content.clone()),
        Some(json!(false))
    );
}

#[test]
fn failed_undo_keeps_graph_and_entry() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!(1)));
    let b = add_contact(&mut kernel, root, None);
    let c: ContactId = parse(
        kernel
            .record("wire then add", |k| {
                k.dispatch(ExternalInput::CreateWire {
                    from_contact_id: a,
                    to_contact_id: b,
                    wire_type: None,
                })?;
                k.dispatch(ExternalInput::AddContact {
                    group_id: root,
                    content: None,
                    blend_mode: None,
                })
            })
            .unwrap(),
    );
    // Removing b outside the session also drops the recorded wire, so the
    // entry's last inverse step can no longer run.
    kernel
        .dispatch(ExternalInput::RemoveContact { contact_id: b })
        .unwrap();
    let before = kernel.runtime().group(root).unwrap().snapshot();

    let error = kernel.undo().unwrap_err();

    assert_eq!(error.code(), ErrorCode::Conflict);
    assert_eq!(kernel.runtime().group(root).unwrap().snapshot(), before);
    assert!(kernel.runtime().find_contact(c).is_some());
    assert_eq!(undo_depth(&mut kernel), 1);
}

#[test]
fn replay_commands_are_refused_even_with_history_source() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, Some(json!(1)));
    let b = add_contact(&mut kernel, root, None);

    let response = kernel.execute_json(json!({
        "type": "restore-wire",
        "source": HISTORY_SOURCE,
        "wire": {
            "groupId": root,
            "wire": {"id": 9_999_999, "fromId": a, "toId": b, "type": "bidirectional"}
        }
    }));

    assert_eq!(response.error.map(|e| e.code), Some(ErrorCode::InvalidInput));
    assert!(view(&mut kernel, root).wires.unwrap().is_empty());
    assert_eq!(content(&mut kernel, b), Value::Null);
}

// =============================================================================
// FAILURE ATOMICITY
// =============================================================================

#[test]
fn runaway_wire_leaves_no_trace() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let x = add_contact(&mut kernel, root, Some(json!(true)));
    let gadget: GroupId = parse(
        kernel
            .dispatch(ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/not".into(),
                parent_group_id: Some(root),
            })
            .unwrap(),
    );
    let (value, result) = (port(&kernel, gadget, "value"), port(&kernel, gadget, "result"));
    connect(&mut kernel, x, value, WireType::Directed);
    let before = kernel.runtime().group(root).unwrap().snapshot();
    let wires = view(&mut kernel, root).wires.unwrap().len();

    // x -> not -> x never settles.
    let response = kernel.execute_json(json!({
        "type": "create-wire",
        "fromContactId": result,
        "toContactId": x,
        "wireType": "directed"
    }));

    assert_eq!(response.error.map(|e| e.code), Some(ErrorCode::Internal));
    assert_eq!(view(&mut kernel, root).wires.unwrap().len(), wires);
    assert_eq!(kernel.runtime().group(root).unwrap().snapshot(), before);
    assert_eq!(content(&mut kernel, x), json!(true));
    assert_eq!(content(&mut kernel, result), json!(false));
}

// =============================================================================
// SCHEDULING
// =============================================================================

#[test]
fn batch_scheduler_coalesces_until_tick() {
    let mut kernel = kernel_with(KernelConfig {
        scheduler: BATCH_SCHEDULER.into(),
        scheduler_config: Some(json!({"windowMs": 5})),
        ..KernelConfig::default()
    });
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, None);
    let b = add_contact(&mut kernel, root, None);
    connect(&mut kernel, a, b, WireType::Directed);

    update(&mut kernel, root, a, json!("first"));
    update(&mut kernel, root, a, json!("second"));
    assert_eq!(content(&mut kernel, b), Value::Null);
    assert_eq!(kernel.status().pending_updates, 1);

    assert_eq!(kernel.tick().unwrap(), 1);

    assert_eq!(content(&mut kernel, b), json!("second"));
    assert_eq!(kernel.status().contradictions, 1);
    assert_eq!(
        kernel.tick_interval(),
        Some(std::time::Duration::from_millis(5))
    );
}

#[test]
fn undo_of_batched_update_reverts_downstream_contacts() {
    let mut kernel = kernel_with(KernelConfig {
        scheduler: BATCH_SCHEDULER.into(),
        ..KernelConfig::default()
    });
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, None);
    let b = add_contact(&mut kernel, root, None);
    connect(&mut kernel, a, b, WireType::Directed);

    kernel
        .record("set a", |k| {
            k.dispatch(ExternalInput::ContactUpdate {
                contact_id: a,
                group_id: root,
                value: Some(json!(7)),
            })
        })
        .unwrap();
    kernel.tick().unwrap();
    assert_eq!(content(&mut kernel, b), json!(7));

    kernel.undo().unwrap();
    kernel.tick().unwrap();
    assert_eq!(content(&mut kernel, a), Value::Null);
    assert_eq!(content(&mut kernel, b), Value::Null);

    kernel.redo().unwrap();
    assert_eq!(content(&mut kernel, b), json!(7));
}

#[test]
fn switching_scheduler_applies_pending_updates() {
    let mut kernel = kernel_with(KernelConfig {
        scheduler: BATCH_SCHEDULER.into(),
        ..KernelConfig::default()
    });
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, None);
    update(&mut kernel, root, a, json!(1));

    kernel
        .dispatch(ExternalInput::SetScheduler {
            scheduler_id: "immediate".into(),
            config: None,
        })
        .unwrap();

    assert_eq!(content(&mut kernel, a), json!(1));
    assert!(kernel.tick_interval().is_none());
}

// =============================================================================
// PERSISTENCE
// =============================================================================

#[test]
fn redb_round_trip_restores_network() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("network.redb");

    let (root, a, b, gadget) = {
        let mut kernel = Kernel::with_storage(
            KernelConfig::default(),
            Box::new(RedbStorage::open(&path).unwrap()),
        );
        kernel.initialize().unwrap();
        let root = add_group(&mut kernel, "root", None);
        let a = add_contact(&mut kernel, root, Some(json!(2)));
        let b = add_contact(&mut kernel, root, None);
        let gadget: GroupId = parse(
            kernel
                .dispatch(ExternalInput::CreatePrimitiveGadget {
                    qualified_name: "core/multiply".into(),
                    parent_group_id: Some(root),
                })
                .unwrap(),
        );
        let (in_a, in_b, out) = (
            port(&kernel, gadget, "a"),
            port(&kernel, gadget, "b"),
            port(&kernel, gadget, "product"),
        );
        connect(&mut kernel, a, in_a, WireType::Directed);
        connect(&mut kernel, a, in_b, WireType::Directed);
        connect(&mut kernel, out, b, WireType::Directed);
        assert_eq!(content(&mut kernel, b), json!(4));
        (root, a, b, gadget)
    };

    let mut kernel = Kernel::with_storage(
        KernelConfig::default(),
        Box::new(RedbStorage::open(&path).unwrap()),
    );
    kernel.initialize().unwrap();

    assert_eq!(content(&mut kernel, b), json!(4));
    let group = view(&mut kernel, root);
    assert_eq!(group.wires.unwrap().len(), 3);
    assert_eq!(group.subgroups.unwrap()[0].id, gadget);

    // The restored gadget computes again.
    update(&mut kernel, root, a, json!(3));
    assert_eq!(content(&mut kernel, b), json!(9));
}

#[test]
fn removals_are_persisted() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("network.redb");

    let root = {
        let mut kernel = Kernel::with_storage(
            KernelConfig::default(),
            Box::new(RedbStorage::open(&path).unwrap()),
        );
        kernel.initialize().unwrap();
        let root = add_group(&mut kernel, "root", None);
        let child = add_group(&mut kernel, "child", Some(root));
        add_contact(&mut kernel, child, Some(json!(1)));
        kernel
            .dispatch(ExternalInput::RemoveGroup { group_id: child })
            .unwrap();
        root
    };

    let mut kernel = Kernel::with_storage(
        KernelConfig::default(),
        Box::new(RedbStorage::open(&path).unwrap()),
    );
    kernel.initialize().unwrap();
    let status = kernel.status();
    assert_eq!(status.roots, 1);
    assert_eq!(status.counts.groups, 1);
    assert_eq!(status.counts.contacts, 0);
    assert!(view(&mut kernel, root).subgroups.unwrap().is_empty());
}

// =============================================================================
// TEMPLATES
// =============================================================================

#[test]
fn export_then_import_builds_working_copy() {
    let mut kernel = kernel();
    let root = add_group(&mut kernel, "root", None);
    let a = add_contact(&mut kernel, root, None);
    let b = add_contact(&mut kernel, root, None);
    connect(&mut kernel, a, b, WireType::Directed);

    let template = kernel
        .dispatch(ExternalInput::ExportGroup { group_id: root })
        .unwrap();
    let imported: bassline_core::ImportResult = parse(
        kernel
            .dispatch(ExternalInput::ImportTemplate {
                template: parse(template),
                parent_group_id: None,
            })
            .unwrap(),
    );
    assert!(imported.skipped_wires.is_empty());

    let copy = view(&mut kernel, imported.group_id);
    let contacts = copy.contacts.unwrap();
    assert_eq!(contacts.len(), 2);
    update(&mut kernel, imported.group_id, contacts[0].id, json!("x"));
    assert_eq!(content(&mut kernel, contacts[1].id), json!("x"));
}

#[test]
fn over_deep_binary_template_is_rejected() {
    let mut template = template_shell();
    for level in 0..500 {
        template = GroupTemplate {
            name: format!("level-{}", level),
            subgroups: vec![template],
            ..template_shell()
        };
    }
    let bytes = encode_template(&template).unwrap();

    assert!(matches!(
        decode_template(&bytes),
        Err(CoreError::InvalidTemplate(_))
    ));
}
