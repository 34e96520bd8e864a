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
//! Structural edits to a machine's graph.
//!
//! Every operator draws from the machine's own random number generator, so a
//! seeded machine mutates reproducibly. None of them can leave an initial
//! node that had outgoing edges without any.
use std::fmt;

use rand::{seq::SliceRandom, Rng};
use tracing::debug;

use crate::{
    action::ActionFactory,
    machine::{Machine, NodeId},
    time::TimeStamp,
};

/// The weight of edges created by mutation.
const NEW_EDGE_PROBABILITY: f64 = 1.0;

/// An edit applied to a machine in place.
pub trait Mutation: Send + Sync {
    /// Applies the edit. Edits that find nothing to work on do nothing.
    fn mutate(&self, machine: &mut Machine);

    /// A short name for logging.
    fn name(&self) -> &'static str;
}

/// Deletes every node with no outgoing edges, other than initial nodes and
/// nodes an initial node depends on for its only way out.
#[derive(Clone, Copy, Debug, Default)]
pub struct Compress;

impl Mutation for Compress {
    fn mutate(&self, machine: &mut Machine) {
        let dead_ends: Vec<NodeId> = machine
            .nodes()
            .filter(|node| node.edges().is_empty() && !node.is_initial())
            .map(|node| node.id())
            .collect();

        let mut removed = 0;
        for id in dead_ends {
            if machine.removal_strands_initial(id) {
                continue;
            }
            machine.remove_node(id);
            removed += 1;
        }
        debug!(removed, "Compressed machine.");
    }

    fn name(&self) -> &'static str {
        "compress"
    }
}

/// Adds a note node, copied from a random existing note, between two random
/// nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddNode;

impl Mutation for AddNode {
    fn mutate(&self, machine: &mut Machine) {
        let unit = machine.unit();
        let notes = note_nodes(machine);
        let template = notes
            .choose(machine.rng())
            .copied()
            .and_then(|id| machine.node(id));
        let (duration, enter, exit) = match template {
            Some(node) => (
                node.duration(),
                node.enter_action().copied(),
                node.exit_action().copied(),
            ),
            None => {
                let pitch = machine.rng().gen_range(0..128u8);
                (
                    TimeStamp::new(unit, 1, 0),
                    Some(ActionFactory::note_on(pitch)),
                    Some(ActionFactory::note_off(pitch)),
                )
            }
        };

        let tail = machine.random_node();
        let head = machine.random_node();
        let id = machine.add_node(duration);
        if let Some(node) = machine.node_mut(id) {
            node.set_enter_action(enter);
            node.set_exit_action(exit);
        }
        if let Some(tail) = tail {
            connect(machine, tail, id);
        }
        if let Some(head) = head {
            connect(machine, id, head);
        }
        debug!(node = %id, "Added node.");
    }

    fn name(&self) -> &'static str {
        "add node"
    }
}

/// Deletes a random node that is not initial.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoveNode;

impl Mutation for RemoveNode {
    fn mutate(&self, machine: &mut Machine) {
        let candidates: Vec<NodeId> = machine
            .nodes()
            .filter(|node| !node.is_initial())
            .map(|node| node.id())
            .filter(|id| !machine.removal_strands_initial(*id))
            .collect();
        let Some(id) = candidates.choose(machine.rng()).copied() else {
            return;
        };
        machine.remove_node(id);
        debug!(node = %id, "Removed node.");
    }

    fn name(&self) -> &'static str {
        "remove node"
    }
}

/// Moves a random note node to a random pitch.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdjustNode;

impl Mutation for AdjustNode {
    fn mutate(&self, machine: &mut Machine) {
        let notes = note_nodes(machine);
        let Some(id) = notes.choose(machine.rng()).copied() else {
            return;
        };
        let pitch = machine.rng().gen_range(0..128u8);
        if let Some(node) = machine.node_mut(id) {
            node.set_pitch(pitch);
            debug!(node = %id, pitch, "Adjusted node.");
        }
    }

    fn name(&self) -> &'static str {
        "adjust node"
    }
}

/// Exchanges the pitches of two distinct random note nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SwapNodes;

impl Mutation for SwapNodes {
    fn mutate(&self, machine: &mut Machine) {
        let notes = note_nodes(machine);
        let picked: Vec<NodeId> = notes.choose_multiple(machine.rng(), 2).copied().collect();
        let [a, b] = picked[..] else {
            return;
        };
        let pitches = (
            machine.node(a).and_then(|node| node.pitch()),
            machine.node(b).and_then(|node| node.pitch()),
        );
        let (Some(pitch_a), Some(pitch_b)) = pitches else {
            return;
        };
        if let Some(node) = machine.node_mut(a) {
            node.set_pitch(pitch_b);
        }
        if let Some(node) = machine.node_mut(b) {
            node.set_pitch(pitch_a);
        }
        debug!(a = %a, b = %b, "Swapped nodes.");
    }

    fn name(&self) -> &'static str {
        "swap nodes"
    }
}

/// Connects two random, not yet connected nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AddEdge;

impl Mutation for AddEdge {
    fn mutate(&self, machine: &mut Machine) {
        let (Some(tail), Some(head)) = (machine.random_node(), machine.random_node()) else {
            return;
        };
        if tail == head
            || machine
                .node(tail)
                .is_some_and(|node| node.connected_to(head))
        {
            return;
        }
        connect(machine, tail, head);
    }

    fn name(&self) -> &'static str {
        "add edge"
    }
}

/// Removes a random edge, unless it is an initial node's only way out.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoveEdge;

impl Mutation for RemoveEdge {
    fn mutate(&self, machine: &mut Machine) {
        let Some((tail, edge)) = machine.random_edge() else {
            return;
        };
        let Some(node) = machine.node(tail) else {
            return;
        };
        if node.is_initial() && node.edges().len() == 1 {
            debug!(node = %tail, "Keeping the initial node's last edge.");
            return;
        }
        machine.remove_edge(tail, edge);
        if let Some(node) = machine.node(tail) {
            if node.is_selector() {
                node.normalize_probabilities();
            }
        }
        debug!(edge = %edge, "Removed edge.");
    }

    fn name(&self) -> &'static str {
        "remove edge"
    }
}

/// Gives a random edge a new random weight.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdjustEdge;

impl Mutation for AdjustEdge {
    fn mutate(&self, machine: &mut Machine) {
        let Some((_, edge)) = machine.random_edge() else {
            return;
        };
        let probability: f64 = machine.rng().gen();
        machine.set_edge_probability(edge, probability);
        debug!(edge = %edge, probability, "Adjusted edge.");
    }

    fn name(&self) -> &'static str {
        "adjust edge"
    }
}

/// Picks one of several mutations by weight each time it is applied.
pub struct HybridMutation {
    mutations: Vec<(f64, Box<dyn Mutation>)>,
    total: f64,
}

impl HybridMutation {
    pub fn new() -> HybridMutation {
        HybridMutation {
            mutations: Vec::new(),
            total: 0.0,
        }
    }

    /// Every operator with equal weight.
    pub fn uniform() -> HybridMutation {
        let mut hybrid = HybridMutation::new();
        hybrid.append(1.0, Box::new(Compress));
        hybrid.append(1.0, Box::new(AddNode));
        hybrid.append(1.0, Box::new(RemoveNode));
        hybrid.append(1.0, Box::new(AdjustNode));
        hybrid.append(1.0, Box::new(SwapNodes));
        hybrid.append(1.0, Box::new(AddEdge));
        hybrid.append(1.0, Box::new(RemoveEdge));
        hybrid.append(1.0, Box::new(AdjustEdge));
        hybrid
    }

    /// Adds a mutation. Weights are relative to each other; non-positive
    /// weights are ignored.
    pub fn append(&mut self, weight: f64, mutation: Box<dyn Mutation>) {
        if !weight.is_finite() || weight <= 0.0 {
            return;
        }
        self.total += weight;
        self.mutations.push((weight, mutation));
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

impl Default for HybridMutation {
    fn default() -> Self {
        HybridMutation::uniform()
    }
}

impl fmt::Debug for HybridMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (weight, mutation) in self.mutations.iter() {
            list.entry(&(weight, mutation.name()));
        }
        list.finish()
    }
}

impl Mutation for HybridMutation {
    fn mutate(&self, machine: &mut Machine) {
        if self.mutations.is_empty() {
            return;
        }
        let draw = machine.rng().gen::<f64>() * self.total;
        let mut cumulative = 0.0;
        for (weight, mutation) in self.mutations.iter() {
            cumulative += weight;
            if draw < cumulative {
                mutation.mutate(machine);
                return;
            }
        }
        if let Some((_, last)) = self.mutations.last() {
            last.mutate(machine);
        }
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}

/// The nodes that play a note.
fn note_nodes(machine: &Machine) -> Vec<NodeId> {
    machine
        .nodes()
        .filter(|node| node.pitch().is_some())
        .map(|node| node.id())
        .collect()
}

/// Adds an edge from `tail` to `head`, keeping selector weights normalized.
fn connect(machine: &mut Machine, tail: NodeId, head: NodeId) {
    if tail == head {
        return;
    }
    if machine.add_edge(tail, head, NEW_EDGE_PROBABILITY).is_none() {
        return;
    }
    if let Some(node) = machine.node(tail) {
        if node.is_selector() {
            node.normalize_probabilities();
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{testutil::note_loop, time::TimeUnit};

    use super::*;

    fn machine(seed: u64) -> Machine {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        machine.seed(seed);
        note_loop(&mut machine, &[60, 62, 64, 65, 67], TimeStamp::new(unit, 0, 240));
        machine
    }

    fn initial_nodes_have_edges(machine: &Machine) -> bool {
        let initial = machine.initial_nodes();
        !initial.is_empty()
            && initial.iter().all(|id| {
                machine
                    .node(*id)
                    .is_some_and(|node| !node.edges().is_empty())
            })
    }

    #[test]
    fn random_mutations_keep_initial_nodes_reachable() {
        let hybrid = HybridMutation::uniform();
        for seed in 0..20 {
            let mut machine = machine(seed);
            for step in 0..300 {
                hybrid.mutate(&mut machine);
                assert!(
                    initial_nodes_have_edges(&machine),
                    "seed {} step {} stranded an initial node",
                    seed,
                    step
                );
            }
        }
    }

    #[test]
    fn removal_heavy_mutations_keep_initial_nodes_reachable() {
        let mut hybrid = HybridMutation::new();
        hybrid.append(1.0, Box::new(Compress));
        hybrid.append(4.0, Box::new(RemoveNode));
        hybrid.append(4.0, Box::new(RemoveEdge));
        for seed in 0..20 {
            let mut machine = machine(seed);
            for _ in 0..200 {
                hybrid.mutate(&mut machine);
                assert!(initial_nodes_have_edges(&machine));
            }
            assert!(machine.node_count() >= 2);
        }
    }

    #[test]
    fn adjusted_selector_edges_stay_normalized() {
        let mut machine = machine(5);
        let ids = machine.node_ids();
        let selector = ids[0];
        for head in ids.iter().skip(2) {
            machine.add_edge(selector, *head, 0.5);
        }
        machine
            .node_mut(selector)
            .expect("selector")
            .set_selector(true);

        for _ in 0..100 {
            AdjustEdge.mutate(&mut machine);
            for node in machine.nodes().filter(|node| node.is_selector()) {
                let sum: f64 = node.edges().iter().map(|edge| edge.probability()).sum();
                assert!((sum - 1.0).abs() < 1e-9, "selector weights sum to {}", sum);
            }
        }
    }

    #[test]
    fn compress_removes_dead_ends() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        let nodes = note_loop(&mut machine, &[60, 62], TimeStamp::new(unit, 0, 240));
        let dead_end = machine.add_node(TimeStamp::new(unit, 0, 240));
        machine.add_edge(nodes[1], dead_end, 0.5);
        let lonely = machine.add_node(TimeStamp::new(unit, 0, 240));

        Compress.mutate(&mut machine);
        assert!(machine.node(dead_end).is_none());
        assert!(machine.node(lonely).is_none());
        assert_eq!(2, machine.node_count());
        // The edge into the removed node went with it.
        assert_eq!(1, machine.node(nodes[1]).expect("node").edges().len());
    }

    #[test]
    fn compress_spares_what_initial_nodes_need() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        let initial = machine.add_node(TimeStamp::new(unit, 1, 0));
        let only_exit = machine.add_node(TimeStamp::new(unit, 1, 0));
        machine.node_mut(initial).expect("initial").set_initial(true);
        machine.add_edge(initial, only_exit, 1.0);

        Compress.mutate(&mut machine);
        assert_eq!(2, machine.node_count());
    }

    #[test]
    fn remove_edge_keeps_the_initial_nodes_last_edge() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        let initial = machine.add_node(TimeStamp::new(unit, 1, 0));
        let next = machine.add_node(TimeStamp::new(unit, 1, 0));
        machine.node_mut(initial).expect("initial").set_initial(true);
        machine.add_edge(initial, next, 1.0);

        for _ in 0..10 {
            RemoveEdge.mutate(&mut machine);
        }
        assert_eq!(1, machine.node(initial).expect("initial").edges().len());
        assert_eq!(1, machine.edge_count());
    }

    #[test]
    fn swap_nodes_exchanges_pitches() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        machine.seed(1);
        let nodes = note_loop(&mut machine, &[60, 72], TimeStamp::new(unit, 0, 240));

        SwapNodes.mutate(&mut machine);
        assert_eq!(Some(72), machine.node(nodes[0]).and_then(|node| node.pitch()));
        assert_eq!(Some(60), machine.node(nodes[1]).and_then(|node| node.pitch()));
        let exit = machine.node(nodes[0]).and_then(|node| node.exit_action().copied());
        assert_eq!(Some(72), exit.and_then(|action| action.pitch()));
    }

    #[test]
    fn add_node_copies_an_existing_note() {
        let mut machine = machine(9);
        let before = machine.node_count();
        AddNode.mutate(&mut machine);
        assert_eq!(before + 1, machine.node_count());

        let added = machine.node_ids().into_iter().max().expect("node");
        let node = machine.node(added).expect("added");
        assert!(matches!(node.pitch(), Some(60 | 62 | 64 | 65 | 67)));
        assert!(!node.edges().is_empty());
        assert!(machine.nodes().any(|other| other.connected_to(added)));
    }

    #[test]
    fn add_node_on_an_empty_machine() {
        let unit = TimeUnit::beats(480);
        let mut machine = Machine::new(unit);
        AddNode.mutate(&mut machine);
        assert_eq!(1, machine.node_count());
        let node = machine.nodes().next().expect("node");
        assert!(node.pitch().is_some());
        assert_eq!(TimeStamp::new(unit, 1, 0), node.duration());
        assert!(node.edges().is_empty());
    }
}
