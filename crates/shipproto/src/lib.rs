//! `shipproto`: wire-protocol types shared by the ship server and proxy.
//!
//! Commands are carried in length-prefixed encrypted frames whose header
//! layout depends on the client dialect; game actions ride inside the
//! broadcast/private envelope commands as 1-byte-opcode subcommands.
//! Decoders here are pure byte transforms; anything that owns a socket or
//! a cipher lives in the server.

pub mod dialect;
pub mod frame;
pub mod handshake;
pub mod items;
pub mod quest;
pub mod subcmd;

pub use dialect::Dialect;
pub use frame::Frame;
pub use items::ItemData;

#[derive(Debug, Clone)]
pub enum ProtoError {
    TooShort { need: usize, got: usize },
    /// Frame header declares an impossible length.
    BadFrame(&'static str),
    /// Subcommand envelope size field disagrees with the buffer.
    BadSubcommand(&'static str),
    /// Quest filename does not match any known pattern.
    BadQuestName(&'static str),
    Unsupported(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::TooShort { need, got } => {
                write!(f, "message too short: need {need}, got {got}")
            }
            ProtoError::BadFrame(s) => write!(f, "bad frame: {s}"),
            ProtoError::BadSubcommand(s) => write!(f, "bad subcommand: {s}"),
            ProtoError::BadQuestName(s) => write!(f, "bad quest filename: {s}"),
            ProtoError::Unsupported(s) => write!(f, "unsupported: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}
