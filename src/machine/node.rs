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
use std::fmt;

use crate::{
    action::{MidiAction, MidiSink},
    time::{TimeDuration, TimeStamp},
};

use super::edge::{Edge, EdgeId};

/// Identifies a node within its machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A state in the performance graph.
///
/// A node is active from the time it is entered until `enter_time + duration`,
/// at which point the machine exits it and considers its outgoing edges.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    duration: TimeDuration,
    enter_action: Option<MidiAction>,
    exit_action: Option<MidiAction>,
    is_initial: bool,
    is_selector: bool,
    is_active: bool,
    enter_time: TimeStamp,
    edges: Vec<Edge>,
}

impl Node {
    pub(crate) fn new(id: NodeId, duration: TimeDuration) -> Node {
        Node {
            id,
            duration,
            enter_action: None,
            exit_action: None,
            is_initial: false,
            is_selector: false,
            is_active: false,
            enter_time: TimeStamp::zero(duration.unit()),
            edges: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn duration(&self) -> TimeDuration {
        self.duration
    }

    pub fn set_duration(&mut self, duration: TimeDuration) {
        self.duration = duration;
    }

    pub fn enter_action(&self) -> Option<&MidiAction> {
        self.enter_action.as_ref()
    }

    pub fn set_enter_action(&mut self, action: Option<MidiAction>) {
        self.enter_action = action;
    }

    pub fn exit_action(&self) -> Option<&MidiAction> {
        self.exit_action.as_ref()
    }

    pub fn set_exit_action(&mut self, action: Option<MidiAction>) {
        self.exit_action = action;
    }

    /// A node that only waits: it carries no actions.
    pub fn is_delay(&self) -> bool {
        self.enter_action.is_none() && self.exit_action.is_none()
    }

    /// The pitch of the note this node plays, if it plays one.
    pub fn pitch(&self) -> Option<u8> {
        self.enter_action.as_ref().and_then(MidiAction::pitch)
    }

    /// Moves both of this node's note actions to a new pitch.
    pub fn set_pitch(&mut self, pitch: u8) -> bool {
        let mut changed = false;
        if let Some(action) = self.enter_action.as_mut() {
            changed |= action.set_pitch(pitch);
        }
        if let Some(action) = self.exit_action.as_mut() {
            changed |= action.set_pitch(pitch);
        }
        changed
    }

    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    pub fn set_initial(&mut self, initial: bool) {
        self.is_initial = initial;
    }

    pub fn is_selector(&self) -> bool {
        self.is_selector
    }

    /// Marks this node as a selector, normalizing its weights when set.
    pub fn set_selector(&mut self, selector: bool) {
        self.is_selector = selector;
        if selector {
            self.normalize_probabilities();
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn enter_time(&self) -> TimeStamp {
        self.enter_time
    }

    pub fn exit_time(&self) -> TimeStamp {
        self.enter_time + self.duration
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.id() == id)
    }

    /// Whether any outgoing edge leads to `head`.
    pub fn connected_to(&self, head: NodeId) -> bool {
        self.edges.iter().any(|edge| edge.head() == head)
    }

    /// Scales outgoing weights so they sum to one. Weights that are all zero
    /// become uniform.
    pub fn normalize_probabilities(&self) {
        if self.edges.is_empty() {
            return;
        }
        let sum: f64 = self.edges.iter().map(Edge::probability).sum();
        if sum > 0.0 {
            for edge in self.edges.iter() {
                edge.set_probability(edge.probability() / sum);
            }
        } else {
            let uniform = 1.0 / self.edges.len() as f64;
            for edge in self.edges.iter() {
                edge.set_probability(uniform);
            }
        }
    }

    pub(crate) fn enter(&mut self, sink: Option<&mut dyn MidiSink>, time: TimeStamp) {
        self.is_active = true;
        self.enter_time = time;
        if let (Some(action), Some(sink)) = (self.enter_action.as_ref(), sink) {
            action.execute(sink, time);
        }
    }

    pub(crate) fn exit(&mut self, sink: Option<&mut dyn MidiSink>, time: TimeStamp) {
        if let (Some(action), Some(sink)) = (self.exit_action.as_ref(), sink) {
            action.execute(sink, time);
        }
        self.is_active = false;
    }

    pub(crate) fn push_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
        if self.is_selector {
            self.normalize_probabilities();
        }
    }

    pub(crate) fn remove_edge(&mut self, id: EdgeId) -> Option<Edge> {
        let index = self.edges.iter().position(|edge| edge.id() == id)?;
        let edge = self.edges.remove(index);
        if self.is_selector {
            self.normalize_probabilities();
        }
        Some(edge)
    }

    /// Drops every edge leading to `head`, returning how many were removed.
    pub(crate) fn remove_edges_to(&mut self, head: NodeId) -> usize {
        let before = self.edges.len();
        self.edges.retain(|edge| edge.head() != head);
        let removed = before - self.edges.len();
        if removed > 0 && self.is_selector {
            self.normalize_probabilities();
        }
        removed
    }

    pub(crate) fn take_edges(&mut self) -> Vec<Edge> {
        std::mem::take(&mut self.edges)
    }

    /// Copies everything but the edges and transient state.
    pub(crate) fn shell(&self, id: NodeId) -> Node {
        Node {
            id,
            duration: self.duration,
            enter_action: self.enter_action,
            exit_action: self.exit_action,
            is_initial: self.is_initial,
            is_selector: self.is_selector,
            is_active: false,
            enter_time: TimeStamp::zero(self.duration.unit()),
            edges: Vec::new(),
        }
    }
}
