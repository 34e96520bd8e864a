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
use tracing::{debug, info};

use crate::{
    action::{MidiAction, NoteEvent},
    machine::{Machine, NodeId},
    time::{quantize_sounding, TimeDuration, TimeStamp},
};

/// Teaches a single node a note played on the input.
///
/// The first note on sets the node's enter action, and the matching note
/// off sets its exit action and duration.
#[derive(Clone, Copy, Debug)]
pub struct LearnRequest {
    node: NodeId,
    quantization: TimeDuration,
    started: bool,
    start: TimeStamp,
    note: Option<(u8, u8)>,
    enter_action: Option<MidiAction>,
    exit_action: Option<MidiAction>,
    duration: Option<TimeDuration>,
}

impl LearnRequest {
    pub fn new(node: NodeId, quantization: TimeDuration) -> LearnRequest {
        LearnRequest {
            node,
            quantization,
            started: false,
            start: TimeStamp::zero(quantization.unit()),
            note: None,
            enter_action: None,
            exit_action: None,
            duration: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_complete(&self) -> bool {
        self.duration.is_some()
    }

    pub fn enter_action(&self) -> Option<&MidiAction> {
        self.enter_action.as_ref()
    }

    pub fn exit_action(&self) -> Option<&MidiAction> {
        self.exit_action.as_ref()
    }

    pub fn duration(&self) -> Option<TimeDuration> {
        self.duration
    }

    /// Feeds an input event heard at `time`. Returns true once the request
    /// is complete.
    pub fn event(&mut self, time: TimeStamp, event: &[u8]) -> bool {
        if self.is_complete() {
            return true;
        }
        match NoteEvent::parse(event) {
            Some(NoteEvent::On { channel, note, .. }) if !self.started => {
                self.enter_action = MidiAction::new(event);
                self.note = Some((channel, note));
                self.start = time;
                self.started = true;
                debug!(node = %self.node, note, "Learning note.");
            }
            Some(NoteEvent::Off { channel, note }) if self.note == Some((channel, note)) => {
                self.exit_action = MidiAction::new(event);
                self.duration = Some(quantize_sounding(
                    self.quantization,
                    time.saturating_sub(self.start),
                ));
            }
            _ => {}
        }
        self.is_complete()
    }

    /// Writes what was learned into the node. Returns false if the request
    /// is incomplete or the node no longer exists.
    pub fn apply(&self, machine: &mut Machine) -> bool {
        let Some(duration) = self.duration else {
            return false;
        };
        let Some(node) = machine.node_mut(self.node) else {
            return false;
        };
        node.set_enter_action(self.enter_action);
        node.set_exit_action(self.exit_action);
        node.set_duration(duration);
        info!(node = %self.node, duration = %duration, "Learned node.");
        true
    }
}
