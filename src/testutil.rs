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
    thread,
    time::{Duration, SystemTime},
};

use crate::{
    action::{ActionFactory, MidiSink},
    machine::{Machine, NodeId},
    time::{TimeDuration, TimeStamp},
};

/// A sink that remembers everything written to it.
#[derive(Default)]
pub struct CaptureSink {
    pub events: Vec<(TimeStamp, Vec<u8>)>,
}

impl MidiSink for CaptureSink {
    fn write_event(&mut self, time: TimeStamp, event: &[u8]) {
        self.events.push((time, event.to_vec()));
    }
}

/// Adds a note node playing `pitch` for `duration`.
pub fn add_note(machine: &mut Machine, pitch: u8, duration: TimeDuration) -> NodeId {
    let id = machine.add_node(duration);
    if let Some(node) = machine.node_mut(id) {
        node.set_enter_action(Some(ActionFactory::note_on(pitch)));
        node.set_exit_action(Some(ActionFactory::note_off(pitch)));
    }
    id
}

/// A looping chain of notes, the first of which is initial.
pub fn note_loop(machine: &mut Machine, pitches: &[u8], duration: TimeDuration) -> Vec<NodeId> {
    let ids: Vec<NodeId> = pitches
        .iter()
        .map(|pitch| add_note(machine, *pitch, duration))
        .collect();
    if let Some(first) = ids.first().and_then(|id| machine.node_mut(*id)) {
        first.set_initial(true);
    }
    for (i, id) in ids.iter().enumerate() {
        machine.add_edge(*id, ids[(i + 1) % ids.len()], 1.0);
    }
    ids
}

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(mut predicate: F, error_msg: &str)
where
    F: FnMut() -> bool,
{
    let start = SystemTime::now();
    let tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(3);

    loop {
        let elapsed = match start.elapsed() {
            Ok(elapsed) => elapsed,
            Err(_) => panic!("System time error"),
        };
        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
    }
}
