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

use midly::{live::LiveEvent, MidiMessage};

use crate::time::TimeStamp;

/// The largest raw event an action can carry. Channel voice messages fit.
pub const MAX_ACTION_SIZE: usize = 3;

const NOTE_ON: u8 = 0x90;
const NOTE_OFF: u8 = 0x80;
const DEFAULT_VELOCITY: u8 = 0x40;

/// Something that accepts timestamped raw MIDI.
pub trait MidiSink {
    /// Writes a raw MIDI event at the given time. Sinks decide what to do
    /// with events they can't place; they never fail the caller.
    fn write_event(&mut self, time: TimeStamp, event: &[u8]);
}

/// A sink that drops everything.
pub struct NullSink;

impl MidiSink for NullSink {
    fn write_event(&mut self, _time: TimeStamp, _event: &[u8]) {}
}

/// A note on or off parsed out of raw bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteEvent {
    On { channel: u8, note: u8, velocity: u8 },
    Off { channel: u8, note: u8 },
}

impl NoteEvent {
    /// Classifies raw MIDI. A note on with zero velocity is an off.
    pub fn parse(bytes: &[u8]) -> Option<NoteEvent> {
        match LiveEvent::parse(bytes) {
            Ok(LiveEvent::Midi { channel, message }) => match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => Some(NoteEvent::On {
                    channel: channel.as_int(),
                    note: key.as_int(),
                    velocity: vel.as_int(),
                }),
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    Some(NoteEvent::Off {
                        channel: channel.as_int(),
                        note: key.as_int(),
                    })
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// A raw MIDI event stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiAction {
    len: u8,
    data: [u8; MAX_ACTION_SIZE],
}

impl MidiAction {
    /// Creates a new action from raw bytes. Returns None for empty events or
    /// events too large to store inline.
    pub fn new(bytes: &[u8]) -> Option<MidiAction> {
        if bytes.is_empty() || bytes.len() > MAX_ACTION_SIZE {
            return None;
        }
        let mut data = [0; MAX_ACTION_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(MidiAction {
            len: bytes.len() as u8,
            data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// The note event this action carries, if any.
    pub fn note_event(&self) -> Option<NoteEvent> {
        NoteEvent::parse(self.bytes())
    }

    /// The pitch of a note on or off.
    pub fn pitch(&self) -> Option<u8> {
        match self.note_event()? {
            NoteEvent::On { note, .. } | NoteEvent::Off { note, .. } => Some(note),
        }
    }

    /// The channel of a note on or off.
    pub fn channel(&self) -> Option<u8> {
        match self.note_event()? {
            NoteEvent::On { channel, .. } | NoteEvent::Off { channel, .. } => Some(channel),
        }
    }

    /// Rewrites the pitch of a note message. Other messages are untouched.
    pub fn set_pitch(&mut self, pitch: u8) -> bool {
        if self.pitch().is_none() {
            return false;
        }
        self.data[1] = pitch & 0x7F;
        true
    }

    /// Writes the event to `sink` at `time`.
    pub fn execute(&self, sink: &mut dyn MidiSink, time: TimeStamp) {
        sink.write_event(time, self.bytes());
    }
}

impl fmt::Debug for MidiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MidiAction({:02X?})", self.bytes())
    }
}

/// Constructors for the actions used by note nodes.
pub struct ActionFactory;

impl ActionFactory {
    /// A note on for the given pitch on the first channel.
    pub fn note_on(note: u8) -> MidiAction {
        MidiAction {
            len: 3,
            data: [NOTE_ON, note & 0x7F, DEFAULT_VELOCITY],
        }
    }

    /// A note off for the given pitch on the first channel.
    pub fn note_off(note: u8) -> MidiAction {
        ActionFactory::note_off_on_channel(0, note)
    }

    pub fn note_off_on_channel(channel: u8, note: u8) -> MidiAction {
        MidiAction {
            len: 3,
            data: [NOTE_OFF | (channel & 0x0F), note & 0x7F, DEFAULT_VELOCITY],
        }
    }
}
