//! # Propagation Benchmarks
//!
//! Wave cost over chains and fan-outs, template export/import, and the
//! full command path through the kernel.
//!
//! Run with: cargo bench -p bassline-core

#![allow(clippy::unwrap_used)]

use bassline_core::{
    ContactGroup, ContactId, ExternalInput, GadgetRegistry, GroupId, Kernel, KernelConfig,
    MemoryStorage, Position, WireType,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;

// =============================================================================
// BUILDERS
// =============================================================================

/// `len` contacts wired head to tail.
fn chain(len: usize, wire_type: WireType) -> (ContactGroup, ContactId) {
    let mut group = ContactGroup::new("chain");
    let ids: Vec<ContactId> = (0..len)
        .map(|_| group.add_contact(Position::default(), None))
        .collect();
    for pair in ids.windows(2) {
        group.connect(pair[0], pair[1], wire_type).unwrap();
    }
    (group, ids[0])
}

/// One hub wired to `width` leaves.
fn fan_out(width: usize) -> (ContactGroup, ContactId) {
    let mut group = ContactGroup::new("fan");
    let hub = group.add_contact(Position::default(), None);
    for _ in 0..width {
        let leaf = group.add_contact(Position::default(), None);
        group.connect(hub, leaf, WireType::Directed).unwrap();
    }
    (group, hub)
}

/// A kernel holding a root with one adder gadget fed by two contacts.
fn adder_kernel() -> (Kernel, GroupId, ContactId) {
    let mut kernel = Kernel::with_storage(KernelConfig::default(), Box::new(MemoryStorage::new()));
    kernel.initialize().unwrap();
    let root: GroupId = serde_json::from_value(
        kernel
            .dispatch(ExternalInput::AddGroup {
                name: "root".into(),
                parent_group_id: None,
                primitive_id: None,
            })
            .unwrap(),
    )
    .unwrap();
    let gadget: GroupId = serde_json::from_value(
        kernel
            .dispatch(ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/add".into(),
                parent_group_id: Some(root),
            })
            .unwrap(),
    )
    .unwrap();
    let port = |kernel: &Kernel, name: &str| {
        kernel
            .runtime()
            .group(gadget)
            .and_then(|g| g.boundary_by_name(name))
            .map(|c| c.id)
            .unwrap()
    };
    let (a, b) = (port(&kernel, "a"), port(&kernel, "b"));
    kernel
        .dispatch(ExternalInput::ContactUpdate {
            contact_id: b,
            group_id: gadget,
            value: Some(json!(1)),
        })
        .unwrap();
    (kernel, gadget, a)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");
    for len in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("directed", len), &len, |b, &len| {
            let (mut network, head) = chain(len, WireType::Directed);
            let mut n = 0i64;
            b.iter(|| {
                n += 1;
                black_box(network.deliver_content(head, Some(json!(n)), None).unwrap())
            });
        });
        group.bench_with_input(BenchmarkId::new("bidirectional", len), &len, |b, &len| {
            let (mut network, head) = chain(len, WireType::Bidirectional);
            let mut n = 0i64;
            b.iter(|| {
                n += 1;
                black_box(network.deliver_content(head, Some(json!(n)), None).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    for width in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let (mut network, hub) = fan_out(width);
            let mut n = 0i64;
            b.iter(|| {
                n += 1;
                black_box(network.deliver_content(hub, Some(json!(n)), None).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_templates(c: &mut Criterion) {
    let registry = GadgetRegistry::with_builtins();
    let (network, _) = chain(500, WireType::Bidirectional);
    let template = network.to_template();

    c.bench_function("template_export_500", |b| {
        b.iter(|| black_box(network.to_template()));
    });
    c.bench_function("template_import_500", |b| {
        b.iter(|| black_box(ContactGroup::from_template(&template, &registry).unwrap()));
    });
}

fn bench_kernel_dispatch(c: &mut Criterion) {
    let (mut kernel, gadget, input) = adder_kernel();
    let mut n = 0i64;
    c.bench_function("kernel_contact_update_adder", |b| {
        b.iter(|| {
            n += 1;
            black_box(
                kernel
                    .dispatch(ExternalInput::ContactUpdate {
                        contact_id: input,
                        group_id: gadget,
                        value: Some(json!(n)),
                    })
                    .unwrap(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_chain,
    bench_fan_out,
    bench_templates,
    bench_kernel_dispatch
);
criterion_main!(benches);
