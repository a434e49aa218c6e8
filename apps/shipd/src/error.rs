//! App-wide error type for per-command handling.
//!
//! Severity drives what the dispatcher does with a failure: protocol
//! errors close the offending connection, state errors drop the single
//! action, internal errors quarantine the room.

use keystream::CipherError;
use shipproto::ProtoError;

#[derive(Debug)]
pub enum ShipError {
    Proto(ProtoError),
    Cipher(CipherError),
    RoomFull,
    NoSuchRoom(u32),
    NoSuchSlot(u8),
    NoSuchItem(u32),
    NoSuchEnemy(u16),
    NoSuchQuest(u32),
    InventoryFull,
    BankFull,
    InsufficientFunds,
    Unsupported(&'static str),
    /// Invariant violation; the room gets quarantined.
    Internal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Close the connection.
    Protocol,
    /// Drop the action, keep the session.
    State,
    /// Quarantine the room.
    Internal,
}

impl ShipError {
    pub fn severity(&self) -> Severity {
        match self {
            ShipError::Proto(_) | ShipError::Cipher(_) => Severity::Protocol,
            ShipError::Internal(_) => Severity::Internal,
            _ => Severity::State,
        }
    }
}

impl std::fmt::Display for ShipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShipError::Proto(e) => write!(f, "protocol: {e}"),
            ShipError::Cipher(e) => write!(f, "cipher: {e}"),
            ShipError::RoomFull => write!(f, "room is full"),
            ShipError::NoSuchRoom(id) => write!(f, "no room {id}"),
            ShipError::NoSuchSlot(s) => write!(f, "no client in slot {s}"),
            ShipError::NoSuchItem(id) => write!(f, "no item {id:08X}"),
            ShipError::NoSuchEnemy(id) => write!(f, "no enemy entry {id}"),
            ShipError::NoSuchQuest(id) => write!(f, "no quest {id}"),
            ShipError::InventoryFull => write!(f, "inventory is full"),
            ShipError::BankFull => write!(f, "bank is full"),
            ShipError::InsufficientFunds => write!(f, "insufficient meseta"),
            ShipError::Unsupported(s) => write!(f, "unsupported: {s}"),
            ShipError::Internal(s) => write!(f, "invariant violation: {s}"),
        }
    }
}

impl std::error::Error for ShipError {}

impl From<ProtoError> for ShipError {
    fn from(e: ProtoError) -> Self {
        ShipError::Proto(e)
    }
}

impl From<CipherError> for ShipError {
    fn from(e: CipherError) -> Self {
        ShipError::Cipher(e)
    }
}
