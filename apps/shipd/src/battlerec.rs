//! Battle recording.
//!
//! While attached to a room and marked in progress, every forwarded
//! subcommand is appended as an ordered event so a battle can be replayed
//! to spectators later.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    GameCommand,
    CardGameCommand,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub data: Bytes,
}

#[derive(Debug, Default)]
pub struct BattleRecord {
    in_progress: bool,
    events: Vec<Event>,
}

impl BattleRecord {
    pub fn new() -> BattleRecord {
        BattleRecord::default()
    }

    pub fn set_in_progress(&mut self, on: bool) {
        self.in_progress = on;
    }

    pub fn battle_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn add_command(&mut self, kind: EventKind, data: Bytes) {
        if self.in_progress {
            self.events.push(Event { kind, data });
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }
}
