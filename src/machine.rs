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
use std::{collections::BTreeMap, fmt};

use rand::{rngs::StdRng, seq::IteratorRandom, Rng, SeedableRng};
use tracing::{error, warn};

use crate::{
    action::MidiSink,
    time::{TimeDuration, TimeSlice, TimeStamp, TimeUnit},
};

mod edge;
mod node;

pub use edge::{Edge, EdgeId, Probability};
pub use node::{Node, NodeId};

/// The default size of the active node table.
pub const DEFAULT_MAX_ACTIVE_NODES: usize = 128;

/// Upper bound on node exits handled by a single call to run.
const MAX_TRANSITIONS_PER_RUN: usize = 4096;

/// A probabilistic state machine over a graph of nodes.
///
/// Nodes live in an arena keyed by [`NodeId`]; edges are owned by their tail
/// node and refer to their head by id. Running the machine walks a time
/// cursor forward, exiting the earliest active node and firing its outgoing
/// edges, until the window given to [`Machine::run`] is used up.
pub struct Machine {
    unit: TimeUnit,
    nodes: BTreeMap<NodeId, Node>,
    next_node_id: u32,
    next_edge_id: u32,
    time: TimeStamp,
    is_activated: bool,
    is_finished: bool,
    active: Vec<NodeId>,
    max_active: usize,
    rng: StdRng,
}

impl Machine {
    /// Creates a new, empty machine counting time in `unit`.
    pub fn new(unit: TimeUnit) -> Machine {
        Machine {
            unit,
            nodes: BTreeMap::new(),
            next_node_id: 0,
            next_edge_id: 0,
            time: TimeStamp::zero(unit),
            is_activated: false,
            is_finished: false,
            active: Vec::with_capacity(DEFAULT_MAX_ACTIVE_NODES),
            max_active: DEFAULT_MAX_ACTIVE_NODES,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reseeds the machine's random source.
    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Sizes the active node table. Must be called off the real-time thread.
    pub fn set_max_active_nodes(&mut self, max: usize) {
        self.max_active = max.max(1);
        if self.active.capacity() < self.max_active {
            self.active.reserve(self.max_active - self.active.len());
        }
    }

    pub fn max_active_nodes(&self) -> usize {
        self.max_active
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn time(&self) -> TimeStamp {
        self.time
    }

    /// Whether the initial nodes have been entered since the last reset.
    pub fn is_activated(&self) -> bool {
        self.is_activated
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|node| node.edges().len()).sum()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// The ids of nodes flagged initial.
    pub fn initial_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.is_initial())
            .map(Node::id)
            .collect()
    }

    /// The ids of currently active nodes, in the order they were entered.
    pub fn active_nodes(&self) -> &[NodeId] {
        &self.active
    }

    /// Adds a new node with the given duration.
    pub fn add_node(&mut self, duration: TimeDuration) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.insert(id, Node::new(id, duration));
        id
    }

    /// Removes a node along with every edge that leads to it.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.active.retain(|active| *active != id);
        for other in self.nodes.values_mut() {
            other.remove_edges_to(id);
        }
        Some(node)
    }

    /// Connects `tail` to `head`. Returns None if either node is missing.
    pub fn add_edge(&mut self, tail: NodeId, head: NodeId, probability: f64) -> Option<EdgeId> {
        if !self.nodes.contains_key(&head) {
            return None;
        }
        let id = EdgeId(self.next_edge_id);
        let node = self.nodes.get_mut(&tail)?;
        node.push_edge(Edge::new(id, tail, head, probability));
        self.next_edge_id += 1;
        Some(id)
    }

    pub fn remove_edge(&mut self, tail: NodeId, edge: EdgeId) -> Option<Edge> {
        self.nodes.get_mut(&tail)?.remove_edge(edge)
    }

    pub fn find_edge(&self, id: EdgeId) -> Option<&Edge> {
        self.nodes.values().find_map(|node| node.edge(id))
    }

    /// Sets an edge's weight, renormalizing its tail if it is a selector.
    pub fn set_edge_probability(&self, id: EdgeId, probability: f64) -> bool {
        for node in self.nodes.values() {
            if let Some(edge) = node.edge(id) {
                edge.set_probability(probability);
                if node.is_selector() {
                    node.normalize_probabilities();
                }
                return true;
            }
        }
        false
    }

    /// Whether removing `id` would leave some initial node without any
    /// outgoing edge.
    pub fn removal_strands_initial(&self, id: NodeId) -> bool {
        self.nodes.values().any(|node| {
            node.id() != id
                && node.is_initial()
                && !node.edges().is_empty()
                && node.edges().iter().all(|edge| edge.head() == id)
        })
    }

    /// Picks a node uniformly at random.
    pub fn random_node(&mut self) -> Option<NodeId> {
        self.nodes.keys().copied().choose(&mut self.rng)
    }

    /// Picks an edge uniformly at random, returning its tail and id.
    pub fn random_edge(&mut self) -> Option<(NodeId, EdgeId)> {
        self.nodes
            .values()
            .flat_map(|node| node.edges().iter())
            .map(|edge| (edge.tail(), edge.id()))
            .choose(&mut self.rng)
    }

    /// Merges another machine's nodes into this one as a disjoint subgraph.
    pub fn append(&mut self, other: Machine) -> bool {
        if other.unit != self.unit {
            error!(
                unit = %self.unit,
                other = %other.unit,
                "Refusing to merge machines with different time units."
            );
            return false;
        }

        let mut ids = BTreeMap::new();
        for old in other.nodes.keys() {
            ids.insert(*old, NodeId(self.next_node_id));
            self.next_node_id += 1;
        }
        for (old, mut node) in other.nodes {
            let id = ids[&old];
            let mut copy = node.shell(id);
            for edge in node.take_edges() {
                let edge_id = EdgeId(self.next_edge_id);
                self.next_edge_id += 1;
                let head = ids[&edge.head()];
                copy.push_edge(edge.remap(edge_id, id, head));
            }
            self.nodes.insert(id, copy);
        }
        true
    }

    /// A copy whose edge weights are shared with this machine, so weight
    /// changes made here are seen by the copy.
    pub fn linked_copy(&self) -> Machine {
        self.copy_with(Edge::linked_clone)
    }

    fn copy_with(&self, clone_edge: fn(&Edge) -> Edge) -> Machine {
        let mut nodes = BTreeMap::new();
        for (id, node) in self.nodes.iter() {
            let mut copy = node.shell(*id);
            for edge in node.edges() {
                copy.push_edge(clone_edge(edge));
            }
            nodes.insert(*id, copy);
        }
        Machine {
            unit: self.unit,
            nodes,
            next_node_id: self.next_node_id,
            next_edge_id: self.next_edge_id,
            time: TimeStamp::zero(self.unit),
            is_activated: false,
            is_finished: false,
            active: Vec::with_capacity(self.max_active),
            max_active: self.max_active,
            rng: self.rng.clone(),
        }
    }

    /// Runs the machine over `slice`, executing actions against `sink`.
    ///
    /// Returns how far the cursor advanced. Anything less than the slice
    /// length means the machine finished inside the slice.
    pub fn run(&mut self, slice: &TimeSlice, sink: &mut dyn MidiSink) -> TimeDuration {
        let zero = TimeStamp::zero(self.unit);
        if slice.beat_unit() != self.unit {
            error!(
                machine = %self.unit,
                slice = %slice.beat_unit(),
                "Time slice unit does not match machine."
            );
            return zero;
        }

        let start = self.time;
        let end = slice.end_beats();

        if !self.is_activated {
            self.is_activated = true;
            let Machine {
                nodes,
                active,
                max_active,
                time,
                ..
            } = self;
            for node in nodes.values_mut().filter(|node| node.is_initial()) {
                if active.len() >= *max_active {
                    warn!(max = *max_active, "Active node table full.");
                    break;
                }
                node.enter(Some(&mut *sink), *time);
                active.push(node.id());
            }
            if self.active.is_empty() {
                self.is_finished = true;
                return zero;
            }
        }

        let mut transitions = 0;
        loop {
            let Some((index, exit_time)) = self.earliest_active() else {
                self.is_finished = true;
                break;
            };

            if exit_time >= end {
                self.time = end;
                break;
            }

            transitions += 1;
            if transitions > MAX_TRANSITIONS_PER_RUN {
                warn!(
                    transitions = MAX_TRANSITIONS_PER_RUN,
                    "Too many transitions in one window, deferring the rest."
                );
                self.time = end;
                break;
            }

            self.time = self.time.max(exit_time);
            self.exit_node(index, sink);
        }

        self.time.saturating_sub(start)
    }

    /// Exits every active node at `time` and rewinds the cursor so the next
    /// run starts over from the initial nodes.
    pub fn reset(&mut self, time: TimeStamp, sink: &mut dyn MidiSink) {
        let Machine { nodes, active, .. } = self;
        for id in active.iter() {
            if let Some(node) = nodes.get_mut(id) {
                node.exit(Some(&mut *sink), time);
            }
        }
        active.clear();
        self.time = TimeStamp::zero(self.unit);
        self.is_activated = false;
        self.is_finished = false;
    }

    /// The active node with the smallest exit time. Ties go to the node
    /// entered first.
    fn earliest_active(&self) -> Option<(usize, TimeStamp)> {
        let mut earliest: Option<(usize, TimeStamp)> = None;
        for (index, id) in self.active.iter().enumerate() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let exit_time = node.exit_time();
            match earliest {
                Some((_, best)) if exit_time >= best => {}
                _ => earliest = Some((index, exit_time)),
            }
        }
        earliest
    }

    fn exit_node(&mut self, index: usize, sink: &mut dyn MidiSink) {
        let id = self.active.remove(index);
        let time = self.time;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.exit(Some(&mut *sink), time);

        if node.is_selector() {
            let draw: f64 = self.rng.gen();
            let mut cumulative = 0.0;
            let mut chosen = None;
            for edge in node.edges() {
                cumulative += edge.probability();
                if draw < cumulative {
                    chosen = Some(edge.head());
                    break;
                }
            }
            if let Some(head) = chosen {
                self.enter_node(head, sink);
            }
        } else {
            for i in 0..node.edges().len() {
                let (head, probability) = match self.nodes.get(&id).map(|n| &n.edges()[i]) {
                    Some(edge) => (edge.head(), edge.probability()),
                    None => break,
                };
                let draw: f64 = self.rng.gen();
                if draw <= probability {
                    self.enter_node(head, sink);
                }
            }
        }
    }

    fn enter_node(&mut self, id: NodeId, sink: &mut dyn MidiSink) {
        let time = self.time;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.is_active() {
            return;
        }
        if self.active.len() >= self.max_active {
            warn!(node = %id, max = self.max_active, "Active node table full.");
            return;
        }
        node.enter(Some(sink), time);
        self.active.push(id);
    }
}

impl Clone for Machine {
    /// A fully independent copy, including edge weights.
    fn clone(&self) -> Machine {
        self.copy_with(Edge::deep_clone)
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("unit", &self.unit)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edge_count())
            .field("time", &self.time)
            .field("finished", &self.is_finished)
            .finish()
    }
}
