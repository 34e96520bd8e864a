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
use std::mem;

use tracing::{debug, warn};

use crate::{
    action::{ActionFactory, MidiAction, NoteEvent},
    machine::{Machine, NodeId},
    time::{quantize, quantize_sounding, TimeDuration, TimeStamp},
};

/// Grows a machine from a time ordered stream of MIDI events.
///
/// Every note becomes a node. Notes that follow one another are chained,
/// gaps between them become delay nodes, and overlapping notes branch out
/// from a common node and converge again once all of them have ended.
pub struct MachineBuilder {
    machine: Machine,
    quantization: TimeDuration,
    time: TimeStamp,
    initial_node: NodeId,
    connect_node: NodeId,
    connect_node_end_time: TimeStamp,
    active_nodes: Vec<NodeId>,
    poly_nodes: Vec<(TimeStamp, NodeId)>,
}

impl MachineBuilder {
    /// Creates a new builder that adds to `machine`.
    pub fn new(mut machine: Machine, quantization: TimeDuration) -> MachineBuilder {
        let zero = TimeStamp::zero(machine.unit());
        let initial_node = new_initial_node(&mut machine);
        MachineBuilder {
            machine,
            quantization,
            time: zero,
            initial_node,
            connect_node: initial_node,
            connect_node_end_time: zero,
            active_nodes: Vec::new(),
            poly_nodes: Vec::new(),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn time(&self) -> TimeStamp {
        self.time
    }

    /// Sets the time that event offsets are relative to.
    pub fn set_time(&mut self, time: TimeStamp) {
        self.time = time;
    }

    pub fn set_quantization(&mut self, quantization: TimeDuration) {
        self.quantization = quantization;
    }

    /// Consumes one event at `offset` past the current time. Events must
    /// arrive in time order. Anything other than notes is ignored.
    pub fn event(&mut self, offset: TimeDuration, event: &[u8]) {
        let t = self.time + offset;
        match NoteEvent::parse(event) {
            Some(NoteEvent::On { .. }) => self.note_on(t, event),
            Some(NoteEvent::Off { channel, note }) => self.note_off(t, channel, note, event),
            None => debug!(bytes = ?event, "Ignoring non-note event."),
        }
    }

    /// Closes every note that is still held at the current time.
    pub fn resolve(&mut self) {
        while let Some(&id) = self.active_nodes.first() {
            match self.held_note(id) {
                Some((channel, note)) => {
                    warn!(channel, note, time = %self.time, "Resolving stuck note.");
                    let off = ActionFactory::note_off_on_channel(channel, note);
                    self.note_off(self.time, channel, note, off.bytes());
                }
                None => {
                    self.active_nodes.remove(0);
                }
            }
        }
    }

    /// Starts a new, disjoint subgraph with its own initial node.
    pub fn reset(&mut self) {
        self.resolve();
        self.drop_bare_initial();
        let zero = TimeStamp::zero(self.machine.unit());
        self.initial_node = new_initial_node(&mut self.machine);
        self.connect_node = self.initial_node;
        self.connect_node_end_time = zero;
        self.time = zero;
        self.poly_nodes.clear();
    }

    /// Resolves any held notes and hands back the machine.
    pub fn finish(mut self) -> Machine {
        self.resolve();
        self.drop_bare_initial();
        self.machine
    }

    fn note_on(&mut self, t: TimeStamp, event: &[u8]) {
        let Some(action) = MidiAction::new(event) else {
            return;
        };
        let id = self.machine.add_node(TimeStamp::zero(self.machine.unit()));
        if let Some(node) = self.machine.node_mut(id) {
            node.set_enter_action(Some(action));
        }

        let (tail, tail_end) = match self.free_poly_node() {
            Some(poly) => poly,
            None => (self.connect_node, self.connect_node_end_time),
        };
        let (from, from_end) = self.connect_nodes(tail, tail_end, id, t);
        if tail == self.connect_node {
            self.connect_node = from;
            self.connect_node_end_time = from_end;
        }

        if let Some(node) = self.machine.node_mut(id) {
            node.enter(None, t);
        }
        self.active_nodes.push(id);
    }

    fn note_off(&mut self, t: TimeStamp, channel: u8, note: u8, event: &[u8]) {
        let position = self
            .active_nodes
            .iter()
            .position(|id| self.held_note(*id) == Some((channel, note)));
        let Some(position) = position else {
            debug!(channel, note, "Note off without a matching note on.");
            return;
        };
        let resolved = self.active_nodes.remove(position);

        let quantization = self.quantization;
        let Some(node) = self.machine.node_mut(resolved) else {
            return;
        };
        let enter_time = node.enter_time();
        node.set_exit_action(MidiAction::new(event));
        node.set_duration(quantize_sounding(quantization, t.saturating_sub(enter_time)));
        node.exit(None, t);
        let resolved_end = node.exit_time();

        if !self.active_nodes.is_empty() {
            self.poly_nodes.push((enter_time, resolved));
            return;
        }

        if !self.poly_nodes.is_empty() {
            let convergence = self.machine.add_node(TimeStamp::zero(self.machine.unit()));
            self.connect_nodes(resolved, resolved_end, convergence, t);
            for (poly_enter, poly) in mem::take(&mut self.poly_nodes) {
                let Some(node) = self.machine.node(poly) else {
                    continue;
                };
                if node.edges().is_empty() {
                    let poly_end = poly_enter + node.duration();
                    self.connect_nodes(poly, poly_end, convergence, t);
                }
            }
            self.connect_node = convergence;
            self.connect_node_end_time = t;
            return;
        }

        let resolved = self.collapse_into_connect_node(resolved);
        self.connect_node = resolved;
        self.connect_node_end_time = resolved_end;
    }

    /// Wires `tail` to `head`, bridging any gap between them with a delay.
    /// Returns the node later simultaneous notes should hang off, and when
    /// that node ends.
    fn connect_nodes(
        &mut self,
        tail: NodeId,
        tail_end: TimeStamp,
        head: NodeId,
        head_start: TimeStamp,
    ) -> (NodeId, TimeStamp) {
        let gap = head_start.saturating_sub(tail_end);
        let Some(tail_node) = self.machine.node_mut(tail) else {
            return (tail, tail_end);
        };

        if gap.is_zero() {
            self.machine.add_edge(tail, head, 1.0);
            return (tail, tail_end);
        }

        let quantized = quantize(self.quantization, gap);
        if tail_node.is_delay() && tail_node.edges().is_empty() {
            tail_node.set_duration(tail_node.duration() + quantized);
            self.machine.add_edge(tail, head, 1.0);
            return (tail, head_start);
        }

        let delay = self.machine.add_node(quantized);
        self.machine.add_edge(tail, delay, 1.0);
        self.machine.add_edge(delay, head, 1.0);
        (delay, head_start)
    }

    /// Folds `resolved` into the connect node when that node is nothing but
    /// a zero length hop to it. Returns the node that now plays the note.
    fn collapse_into_connect_node(&mut self, resolved: NodeId) -> NodeId {
        let Some(connect) = self.machine.node(self.connect_node) else {
            return resolved;
        };
        let redundant = connect.is_delay()
            && connect.duration().is_zero()
            && connect.edges().len() == 1
            && connect.edges()[0].head() == resolved;
        if !redundant {
            return resolved;
        }

        let Some(note) = self.machine.remove_node(resolved) else {
            return resolved;
        };
        let Some(connect) = self.machine.node_mut(self.connect_node) else {
            return resolved;
        };
        connect.take_edges();
        connect.set_enter_action(note.enter_action().copied());
        connect.set_exit_action(note.exit_action().copied());
        connect.set_duration(note.duration());
        for edge in note.edges() {
            self.machine.add_edge(self.connect_node, edge.head(), edge.probability());
        }
        self.connect_node
    }

    /// The channel and pitch a held node was started with.
    fn held_note(&self, id: NodeId) -> Option<(u8, u8)> {
        match self.machine.node(id)?.enter_action()?.note_event()? {
            NoteEvent::On { channel, note, .. } => Some((channel, note)),
            NoteEvent::Off { .. } => None,
        }
    }

    /// A finished polyphonic voice that nothing follows yet.
    fn free_poly_node(&self) -> Option<(NodeId, TimeStamp)> {
        self.poly_nodes.iter().find_map(|(enter, id)| {
            let node = self.machine.node(*id)?;
            node.edges()
                .is_empty()
                .then(|| (*id, *enter + node.duration()))
        })
    }

    fn drop_bare_initial(&mut self) {
        let bare = self.machine.node(self.initial_node).is_some_and(|node| {
            node.is_delay() && node.edges().is_empty()
        });
        if bare {
            self.machine.remove_node(self.initial_node);
        }
    }
}

fn new_initial_node(machine: &mut Machine) -> NodeId {
    let id = machine.add_node(TimeStamp::zero(machine.unit()));
    if let Some(node) = machine.node_mut(id) {
        node.set_initial(true);
    }
    id
}

#[cfg(test)]
mod test {
    use crate::{
        machine::Node,
        time::{TimeSlice, TimeUnit},
    };

    use super::*;

    fn unit() -> TimeUnit {
        TimeUnit::beats(480)
    }

    fn at(subticks: u32) -> TimeStamp {
        TimeStamp::new(unit(), 0, subticks)
    }

    fn builder(quantization: u32) -> MachineBuilder {
        MachineBuilder::new(Machine::new(unit()), at(quantization))
    }

    fn feed(builder: &mut MachineBuilder, events: &[(u32, [u8; 3])]) {
        for (time, bytes) in events {
            builder.set_time(at(*time));
            builder.event(at(0), bytes);
        }
    }

    fn notes(machine: &Machine) -> Vec<&Node> {
        machine.nodes().filter(|node| !node.is_delay()).collect()
    }

    fn reachable(machine: &Machine, target: NodeId) -> bool {
        let mut stack = machine.initial_nodes();
        let mut seen = Vec::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(node) = machine.node(id) {
                stack.extend(node.edges().iter().map(|edge| edge.head()));
            }
        }
        false
    }

    #[test]
    fn single_note() {
        let mut builder = builder(0);
        feed(&mut builder, &[(0, [0x90, 60, 64]), (480, [0x80, 60, 64])]);
        let machine = builder.finish();

        let notes = notes(&machine);
        assert_eq!(1, notes.len());
        assert_eq!(at(480), notes[0].duration());
        assert_eq!(Some(60), notes[0].pitch());
        assert!(reachable(&machine, notes[0].id()));
    }

    #[test]
    fn stuck_note_is_resolved() {
        let mut builder = builder(0);
        feed(&mut builder, &[(0, [0x90, 64, 100])]);
        builder.set_time(at(100));
        builder.resolve();
        let machine = builder.finish();

        assert_eq!(1, machine.node_count());
        let node = machine.nodes().next().expect("one node");
        assert_eq!(at(100), node.duration());
        assert_eq!(
            Some(NoteEvent::Off {
                channel: 0,
                note: 64
            }),
            node.exit_action().and_then(MidiAction::note_event)
        );
    }

    #[test]
    fn sequential_notes_chain() {
        let mut builder = builder(0);
        feed(
            &mut builder,
            &[
                (0, [0x90, 60, 64]),
                (240, [0x80, 60, 64]),
                (240, [0x90, 62, 64]),
                (480, [0x80, 62, 64]),
            ],
        );
        let machine = builder.finish();
        assert_eq!(2, machine.node_count());
        assert_eq!(1, machine.edge_count());
        let first = machine.node(machine.initial_nodes()[0]).expect("initial");
        assert_eq!(Some(60), first.pitch());
        let second = machine.node(first.edges()[0].head()).expect("second");
        assert_eq!(Some(62), second.pitch());
    }

    #[test]
    fn gaps_become_delays() {
        let mut builder = builder(0);
        feed(
            &mut builder,
            &[
                (100, [0x90, 60, 64]),
                (200, [0x80, 60, 64]),
                (500, [0x90, 62, 64]),
                (600, [0x80, 62, 64]),
            ],
        );
        let machine = builder.finish();
        assert_eq!(2, notes(&machine).len());

        // The leading gap extends the initial node, the inner gap gets its
        // own delay.
        let initial = machine.node(machine.initial_nodes()[0]).expect("initial");
        assert!(initial.is_delay());
        assert_eq!(at(100), initial.duration());
        let delays: Vec<&Node> = machine
            .nodes()
            .filter(|node| node.is_delay() && !node.is_initial())
            .collect();
        assert_eq!(1, delays.len());
        assert_eq!(at(300), delays[0].duration());
    }

    #[test]
    fn chords_branch_and_converge() {
        let mut builder = builder(0);
        feed(
            &mut builder,
            &[
                (0, [0x90, 60, 64]),
                (0, [0x90, 64, 64]),
                (480, [0x80, 60, 64]),
                (480, [0x80, 64, 64]),
                (480, [0x90, 67, 64]),
                (960, [0x80, 67, 64]),
            ],
        );
        let machine = builder.finish();
        assert_eq!(3, notes(&machine).len());

        // The convergence node folds into the note that follows the chord,
        // so both chord notes lead straight into it.
        let last = notes(&machine)
            .into_iter()
            .find(|node| node.pitch() == Some(67))
            .expect("67")
            .id();
        let chord: Vec<u8> = machine
            .nodes()
            .filter(|node| node.connected_to(last))
            .filter_map(Node::pitch)
            .collect();
        assert_eq!(2, chord.len());
        assert!(chord.contains(&60) && chord.contains(&64));

        // Playing it back sounds the chord together.
        let mut machine = machine;
        machine.seed(1);
        let mut slice = TimeSlice::new(480, 60.0, unit());
        slice.set_slice(
            TimeStamp::zero(slice.tick_unit()),
            TimeStamp::new(slice.tick_unit(), 480 * 4, 0),
        );
        let mut sink = crate::testutil::CaptureSink::default();
        machine.run(&slice, &mut sink);
        let ons: Vec<(TimeStamp, u8)> = sink
            .events
            .iter()
            .filter(|(_, bytes)| bytes[0] & 0xF0 == 0x90)
            .map(|(time, bytes)| (*time, bytes[1]))
            .collect();
        assert_eq!(vec![(at(0), 60), (at(0), 64), (at(480), 67)], ons);
    }

    #[test]
    fn zero_length_notes_are_quantized_up() {
        let mut builder = builder(120);
        feed(&mut builder, &[(0, [0x90, 60, 64]), (10, [0x80, 60, 64])]);
        let machine = builder.finish();
        assert_eq!(at(120), notes(&machine)[0].duration());
    }

    #[test]
    fn velocity_zero_note_on_ends_note() {
        let mut builder = builder(0);
        feed(&mut builder, &[(0, [0x91, 60, 64]), (240, [0x91, 60, 0])]);
        let machine = builder.finish();
        assert_eq!(at(240), notes(&machine)[0].duration());
    }

    #[test]
    fn reset_starts_disjoint_subgraph() {
        let mut builder = builder(0);
        feed(&mut builder, &[(0, [0x90, 60, 64]), (480, [0x80, 60, 64])]);
        builder.reset();
        feed(&mut builder, &[(0, [0x90, 72, 64]), (240, [0x80, 72, 64])]);
        let machine = builder.finish();
        assert_eq!(2, machine.initial_nodes().len());
        assert_eq!(0, machine.edge_count());
    }

    #[test]
    fn no_events_leaves_machine_empty() {
        let mut builder = builder(0);
        builder.event(at(0), &[0xB0, 7, 100]);
        assert!(builder.finish().is_empty());
    }
}
