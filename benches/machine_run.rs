// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use machina::{
    action::{ActionFactory, NullSink},
    machine::{Machine, NodeId},
    mutation::{HybridMutation, Mutation},
    time::{TimeSlice, TimeStamp, TimeUnit},
};

const PPQN: u32 = 1920;

/// A ring of `size` sixteenth notes where every node also branches two
/// steps ahead with even odds.
fn branching_ring(size: usize) -> Machine {
    let unit = TimeUnit::beats(PPQN);
    let mut machine = Machine::new(unit);
    machine.seed(42);

    let ids: Vec<NodeId> = (0..size)
        .map(|i| {
            let id = machine.add_node(TimeStamp::new(unit, 0, PPQN / 4));
            let pitch = 48 + (i % 24) as u8;
            if let Some(node) = machine.node_mut(id) {
                node.set_enter_action(Some(ActionFactory::note_on(pitch)));
                node.set_exit_action(Some(ActionFactory::note_off(pitch)));
            }
            id
        })
        .collect();
    if let Some(node) = machine.node_mut(ids[0]) {
        node.set_initial(true);
    }
    for (i, id) in ids.iter().enumerate() {
        machine.add_edge(*id, ids[(i + 1) % size], 1.0);
        machine.add_edge(*id, ids[(i + 2) % size], 0.5);
    }
    machine
}

fn benchmark_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("machine_run");

    // 256 frames at 48kHz and 120bpm, a typical audio callback.
    for size in [8, 64, 512] {
        group.bench_with_input(BenchmarkId::new("window", size), &size, |b, size| {
            let mut machine = branching_ring(*size);
            let mut slice = TimeSlice::new(48000, 120.0, machine.unit());
            let window = TimeStamp::new(slice.tick_unit(), 256, 0);
            slice.set_slice(TimeStamp::zero(slice.tick_unit()), window);

            b.iter(|| {
                let advanced = machine.run(black_box(&slice), &mut NullSink);
                slice.set_start(slice.start_ticks() + window);
                black_box(advanced)
            })
        });
    }

    group.finish();
}

fn benchmark_mutation(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutation");
    let hybrid = HybridMutation::uniform();

    group.bench_function("hybrid", |b| {
        let mut machine = branching_ring(64);
        b.iter(|| {
            hybrid.mutate(black_box(&mut machine));
        })
    });

    group.bench_function("copy", |b| {
        let machine = branching_ring(512);
        b.iter(|| black_box(machine.clone()))
    });

    group.finish();
}

criterion_group!(benches, benchmark_run, benchmark_mutation);
criterion_main!(benches);
