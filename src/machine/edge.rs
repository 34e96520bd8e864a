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
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use super::node::NodeId;

/// Identifies an edge within its machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub(crate) u32);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A transition weight. Written by a control thread and read by the real-time
/// thread; the value is stored as the bits of an f64 so readers always see a
/// complete value.
pub struct Probability(AtomicU64);

impl Probability {
    pub fn new(p: f64) -> Probability {
        Probability(AtomicU64::new(clamp(p).to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, p: f64) {
        self.0.store(clamp(p).to_bits(), Ordering::Release);
    }
}

impl fmt::Debug for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.load())
    }
}

fn clamp(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// A weighted transition from the node that owns it to `head`.
#[derive(Debug)]
pub struct Edge {
    id: EdgeId,
    tail: NodeId,
    head: NodeId,
    probability: Arc<Probability>,
}

impl Edge {
    pub(crate) fn new(id: EdgeId, tail: NodeId, head: NodeId, probability: f64) -> Edge {
        Edge {
            id,
            tail,
            head,
            probability: Arc::new(Probability::new(probability)),
        }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn tail(&self) -> NodeId {
        self.tail
    }

    pub fn head(&self) -> NodeId {
        self.head
    }

    pub fn probability(&self) -> f64 {
        self.probability.load()
    }

    /// Publishes a new weight. Copies made with a linked clone see it too.
    pub fn set_probability(&self, p: f64) {
        self.probability.store(p);
    }

    /// A copy with its own weight.
    pub(crate) fn deep_clone(&self) -> Edge {
        Edge::new(self.id, self.tail, self.head, self.probability())
    }

    /// A copy that shares this edge's weight.
    pub(crate) fn linked_clone(&self) -> Edge {
        Edge {
            id: self.id,
            tail: self.tail,
            head: self.head,
            probability: Arc::clone(&self.probability),
        }
    }

    /// Rewires this edge into another machine's id space.
    pub(crate) fn remap(self, id: EdgeId, tail: NodeId, head: NodeId) -> Edge {
        Edge {
            id,
            tail,
            head,
            probability: self.probability,
        }
    }
}
