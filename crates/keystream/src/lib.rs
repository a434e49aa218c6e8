//! `keystream`: the per-dialect stream ciphers.
//!
//! All ciphers here are symmetric (encrypt and decrypt XOR the same
//! keystream against the data), except the V4 block cipher whose encrypt
//! and decrypt differ only in the order the round keys are applied.
//!
//! Every cipher supports a *peek* mode: generate keystream for a buffer
//! without advancing internal state. Peek is how the framing layer reads a
//! command header to learn the frame length before committing to consume
//! it. Stream ciphers can peek at most 4 bytes; the V4 ciphers at most
//! 0x100 bytes.

pub mod bb;
pub mod detect;
pub mod gc;
pub mod pc;

pub use bb::{BbCipher, BbSubtype, KeyFile};
pub use detect::{DetectorShared, MultiKeyDetector, MultiKeyImitator};
pub use gc::GcCipher;
pub use pc::PcCipher;

#[derive(Debug, Clone)]
pub enum CipherError {
    /// Buffer length is not a multiple of the cipher block/word size.
    BadLength { need_multiple: usize, got: usize },
    /// Peek-mode call exceeded the cipher's peek window.
    PeekTooLarge { limit: usize, got: usize },
    /// None of the candidate keys decrypted the first command correctly.
    NoMatchingKey,
    /// The first decrypt on a detector must cover exactly the expected
    /// plaintext, or candidates cannot be compared.
    FirstDataSizeMismatch { expected: usize, got: usize },
    /// The imitator was used before its detector committed to a key.
    PeerNotReady,
    /// A key file on disk is truncated or carries an unknown subtype tag.
    BadKeyFile(&'static str),
}

impl std::fmt::Display for CipherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CipherError::BadLength { need_multiple, got } => {
                write!(f, "buffer length must be a multiple of {need_multiple}, got {got}")
            }
            CipherError::PeekTooLarge { limit, got } => {
                write!(f, "peek window is {limit} bytes, got {got}")
            }
            CipherError::NoMatchingKey => {
                write!(f, "no registered private key matches this client")
            }
            CipherError::FirstDataSizeMismatch { expected, got } => {
                write!(f, "first decrypt must be exactly {expected} bytes, got {got}")
            }
            CipherError::PeerNotReady => {
                write!(f, "peer cipher cannot start before the detector commits")
            }
            CipherError::BadKeyFile(s) => write!(f, "bad key file: {s}"),
        }
    }
}

impl std::error::Error for CipherError {}

/// One installed cipher endpoint. Tagged enum rather than a trait object so
/// the per-word hot loops stay monomorphic.
#[derive(Debug)]
pub enum Cipher {
    Pc(PcCipher),
    Gc(GcCipher),
    Bb(BbCipher),
    Detector(MultiKeyDetector),
    Imitator(MultiKeyImitator),
}

impl Cipher {
    pub fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        match self {
            Cipher::Pc(c) => c.apply(data, advance),
            Cipher::Gc(c) => c.apply(data, advance),
            Cipher::Bb(c) => c.encrypt(data, advance),
            Cipher::Detector(c) => c.encrypt(data, advance),
            Cipher::Imitator(c) => c.encrypt(data, advance),
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        match self {
            Cipher::Pc(c) => c.apply(data, advance),
            Cipher::Gc(c) => c.apply(data, advance),
            Cipher::Bb(c) => c.decrypt(data, advance),
            Cipher::Detector(c) => c.decrypt(data, advance),
            Cipher::Imitator(c) => c.decrypt(data, advance),
        }
    }

    /// Frames must be padded to a multiple of this before encryption.
    pub fn alignment(&self) -> usize {
        match self {
            Cipher::Pc(_) | Cipher::Gc(_) => 4,
            Cipher::Bb(_) | Cipher::Detector(_) | Cipher::Imitator(_) => 8,
        }
    }
}
