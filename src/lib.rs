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
//! Machina, a generative MIDI performance engine.
//!
//! A [`machine::Machine`] is a graph of timed nodes joined by weighted
//! edges. Running it walks the graph and plays each node's MIDI. Machines
//! are learned from performances with [`builder::MachineBuilder`], played in
//! real time through [`driver::Driver`], rendered to and learned from
//! standard MIDI files by [`driver::SmfDriver`], and evolved with
//! [`mutation`] and [`evolver`].
pub mod action;
pub mod builder;
pub mod config;
pub mod driver;
pub mod evolver;
pub mod learn;
pub mod machine;
pub mod mutation;
pub mod recorder;
pub mod ringbuffer;
pub mod smf;
pub mod time;
#[cfg(test)]
mod testutil;
