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
use std::{
    collections::{BTreeMap, VecDeque},
    io::{Read, Seek},
    path::Path,
};

use rand::{rngs::StdRng, Rng};
use tracing::{debug, info};

use crate::{
    action::{ActionFactory, MidiSink, NoteEvent, NullSink},
    machine::{Machine, NodeId},
    smf::{SmfError, SmfReader},
    time::{TimeSlice, TimeStamp, TimeUnit},
};

/// The longest note pattern counted.
pub const DEFAULT_ORDER: usize = 3;

/// Length of each evaluation window, in beats.
const EVALUATION_WINDOW_BEATS: u32 = 2;

/// Evaluation gives up on machines that are still short of notes after this
/// many windows.
const MAX_EVALUATION_WINDOWS: usize = 512;

/// Counts of every note pattern up to some length in a stream of notes.
#[derive(Clone, Debug)]
pub struct NoteStats {
    order: usize,
    recent: VecDeque<u8>,
    patterns: BTreeMap<Vec<u8>, u32>,
    counts: [u32; 128],
    n_notes: usize,
    first_note: Option<u8>,
}

impl NoteStats {
    pub fn new(order: usize) -> NoteStats {
        let order = order.max(1);
        NoteStats {
            order,
            recent: VecDeque::with_capacity(order),
            patterns: BTreeMap::new(),
            counts: [0; 128],
            n_notes: 0,
            first_note: None,
        }
    }

    /// Counts a note, along with every pattern that ends on it.
    pub fn note(&mut self, note: u8) {
        let note = note & 0x7F;
        self.first_note.get_or_insert(note);
        if self.recent.len() == self.order {
            self.recent.pop_front();
        }
        self.recent.push_back(note);

        let recent = self.recent.make_contiguous();
        for start in 0..recent.len() {
            *self.patterns.entry(recent[start..].to_vec()).or_insert(0) += 1;
        }
        self.counts[usize::from(note)] += 1;
        self.n_notes += 1;
    }

    pub fn n_notes(&self) -> usize {
        self.n_notes
    }

    pub fn first_note(&self) -> Option<u8> {
        self.first_note
    }

    /// How often `note` was heard.
    pub fn count(&self, note: u8) -> u32 {
        self.counts[usize::from(note & 0x7F)]
    }

    /// How often `pattern` was heard.
    pub fn pattern_count(&self, pattern: &[u8]) -> u32 {
        self.patterns.get(pattern).copied().unwrap_or(0)
    }

    /// The distinct notes heard, lowest first.
    pub fn notes(&self) -> impl Iterator<Item = u8> + '_ {
        (0..128u8).filter(|note| self.counts[usize::from(*note)] > 0)
    }
}

impl MidiSink for NoteStats {
    fn write_event(&mut self, _time: TimeStamp, event: &[u8]) {
        if let Some(NoteEvent::On { note, .. }) = NoteEvent::parse(event) {
            self.note(note);
        }
    }
}

/// A target note sequence that machines are scored against.
#[derive(Clone, Debug)]
pub struct Problem {
    target: NoteStats,
    unit: TimeUnit,
}

impl Problem {
    /// Builds a problem from a sequence of pitches. Machines are evolved in
    /// `unit`.
    pub fn new(notes: &[u8], unit: TimeUnit) -> Problem {
        let mut target = NoteStats::new(DEFAULT_ORDER);
        for note in notes {
            target.note(*note);
        }
        Problem { target, unit }
    }

    /// Reads the target from the note ons of one track of a file. Tracks
    /// count from 1.
    pub fn from_smf(path: &Path, track: u16, unit: TimeUnit) -> Result<Problem, SmfError> {
        let mut reader = SmfReader::open(path)?;
        Problem::from_reader(&mut reader, track, unit)
    }

    pub fn from_reader<R: Read + Seek>(
        reader: &mut SmfReader<R>,
        track: u16,
        unit: TimeUnit,
    ) -> Result<Problem, SmfError> {
        reader.seek_to_track(track)?;
        let mut target = NoteStats::new(DEFAULT_ORDER);
        let zero = TimeStamp::zero(unit);
        while let Some(event) = reader.read_event()? {
            target.write_event(zero, &event.bytes);
        }
        if target.n_notes() == 0 {
            return Err(SmfError::NoMachineProduced);
        }
        info!(track, notes = target.n_notes(), "Read target notes.");
        Ok(Problem { target, unit })
    }

    pub fn target(&self) -> &NoteStats {
        &self.target
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Scores a machine by performing a copy of it until it has played as
    /// many notes as the target. Patterns shared with the target earn their
    /// length for every matching occurrence; patterns the target lacks, and
    /// target patterns never played, cost. Machines that play nothing get
    /// the lowest score.
    pub fn fitness(&self, machine: &Machine) -> f32 {
        let played = self.perform(machine);
        if played.n_notes() == 0 {
            return f32::MIN;
        }

        let order = played.order as f32;
        let distinct = played.patterns.len() as f32;
        let mut fitness = 0.0f32;
        for (pattern, count) in played.patterns.iter() {
            let length = pattern.len() as f32;
            match self.target.patterns.get(pattern) {
                Some(target) => fitness += (*count).min(*target) as f32 * length,
                None => {
                    let inverse = order - length + 1.0;
                    fitness -= *count as f32 / distinct * inverse.powi(3) * 4.0;
                }
            }
        }

        let target_notes = self.target.n_notes().max(1) as f32;
        for (pattern, count) in self.target.patterns.iter() {
            if !played.patterns.contains_key(pattern) {
                let inverse = order - pattern.len() as f32 + 1.0;
                fitness -= *count as f32 / target_notes * inverse;
            }
        }
        fitness
    }

    /// Plays a copy of `machine`, restarting it whenever it finishes.
    fn perform(&self, machine: &Machine) -> NoteStats {
        let mut played = NoteStats::new(self.target.order);
        let mut machine = machine.clone();
        machine.reset(TimeStamp::zero(self.unit), &mut NullSink);

        // One tick per pulse at 60 bpm.
        let mut slice = TimeSlice::new(self.unit.ppt(), 60.0, self.unit);
        let ticks = slice.tick_unit();
        let window = TimeStamp::new(ticks, EVALUATION_WINDOW_BEATS * self.unit.ppt(), 0);
        slice.set_slice(TimeStamp::zero(ticks), window);

        for _ in 0..MAX_EVALUATION_WINDOWS {
            machine.run(&slice, &mut played);
            if played.n_notes() >= self.target.n_notes() {
                break;
            }
            if machine.is_finished() {
                let end = machine.time();
                machine.reset(end, &mut played);
                if end.is_zero() {
                    break;
                }
                slice.set_start(TimeStamp::zero(ticks));
            } else {
                slice.set_start(slice.start_ticks() + window);
            }
        }
        debug!(notes = played.n_notes(), "Evaluated machine.");
        played
    }

    /// Builds a random machine over the target's notes: one selector node
    /// per distinct pitch, starting from the target's first note, chained so
    /// that every node is reachable.
    pub fn random_machine(&self, rng: &mut StdRng) -> Machine {
        let mut machine = Machine::new(self.unit);
        machine.seed(rng.gen());
        let duration = TimeStamp::new(self.unit, 0, self.unit.ppt() / 2);

        let mut initial = None;
        let mut unreachable: Vec<NodeId> = Vec::new();
        for note in self.target.notes() {
            let id = machine.add_node(duration);
            if let Some(node) = machine.node_mut(id) {
                node.set_enter_action(Some(ActionFactory::note_on(note)));
                node.set_exit_action(Some(ActionFactory::note_off(note)));
                node.set_selector(true);
                if initial.is_none() && Some(note) == self.target.first_note() {
                    node.set_initial(true);
                    initial = Some(id);
                    continue;
                }
            }
            unreachable.push(id);
        }

        let Some(mut current) = initial else {
            return machine;
        };
        let nodes = machine.node_ids();
        while !unreachable.is_empty() {
            let head = if rng.gen_bool(0.5) {
                nodes[rng.gen_range(0..nodes.len())]
            } else {
                unreachable[0]
            };
            let connected = machine
                .node(current)
                .map_or(true, |node| node.connected_to(head));
            if head == current || connected {
                continue;
            }
            machine.add_edge(current, head, 1.0);
            if let Some(node) = machine.node(current) {
                node.normalize_probabilities();
            }
            unreachable.retain(|id| *id != head);
            current = head;
        }
        machine
    }
}
