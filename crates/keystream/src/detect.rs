//! Multi-key detection for V4 connections.
//!
//! A deployment carries several candidate private keys; which one a given
//! client uses is only learnable from its first encrypted command. The
//! detector peek-decrypts that command under each candidate until one
//! yields the expected plaintext, then locks in. The paired imitator
//! (the outbound direction) lazily builds its own cipher from whichever
//! key the detector committed to.

use std::sync::{Arc, OnceLock};

use crate::bb::{BbCipher, BbSubtype, KeyFile};
use crate::CipherError;

/// Shared slot the detector fills in and the imitator reads from.
#[derive(Debug, Default)]
pub struct DetectorShared {
    chosen: OnceLock<Chosen>,
}

#[derive(Debug)]
struct Chosen {
    key: Arc<KeyFile>,
    seed: Vec<u8>,
}

#[derive(Debug)]
pub struct MultiKeyDetector {
    candidates: Vec<Arc<KeyFile>>,
    expected_first: Vec<u8>,
    seed: Vec<u8>,
    shared: Arc<DetectorShared>,
    active: Option<BbCipher>,
}

impl MultiKeyDetector {
    pub fn new(
        candidates: Vec<Arc<KeyFile>>,
        expected_first: Vec<u8>,
        seed: Vec<u8>,
    ) -> Self {
        MultiKeyDetector {
            candidates,
            expected_first,
            seed,
            shared: Arc::new(DetectorShared::default()),
            active: None,
        }
    }

    /// Handle for pairing an imitator with this detector.
    pub fn shared(&self) -> Arc<DetectorShared> {
        self.shared.clone()
    }

    pub fn chosen_key(&self) -> Option<Arc<KeyFile>> {
        self.shared.chosen.get().map(|c| c.key.clone())
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    pub fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        match &mut self.active {
            Some(c) => c.encrypt(data, advance),
            None => Err(CipherError::PeerNotReady),
        }
    }

    pub fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        if self.active.is_none() {
            if data.len() != self.expected_first.len() {
                return Err(CipherError::FirstDataSizeMismatch {
                    expected: self.expected_first.len(),
                    got: data.len(),
                });
            }
            for key in &self.candidates {
                let mut trial = BbCipher::new(key, &self.seed)?;
                let mut probe = data.to_vec();
                trial.decrypt(&mut probe, false)?;
                if probe == self.expected_first {
                    let _ = self.shared.chosen.set(Chosen {
                        key: key.clone(),
                        seed: self.seed.clone(),
                    });
                    self.active = Some(trial);
                    break;
                }
            }
            if self.active.is_none() {
                return Err(CipherError::NoMatchingKey);
            }
        }
        self.active.as_mut().unwrap().decrypt(data, advance)
    }
}

#[derive(Debug)]
pub struct MultiKeyImitator {
    shared: Arc<DetectorShared>,
    seed: Vec<u8>,
    jsd1_use_detector_seed: bool,
    active: Option<BbCipher>,
}

impl MultiKeyImitator {
    /// `jsd1_use_detector_seed` covers the JSD1 quirk: that subvariant
    /// keys both directions from the client seed (each direction still
    /// keeps independent stream state afterwards).
    pub fn new(shared: Arc<DetectorShared>, seed: Vec<u8>, jsd1_use_detector_seed: bool) -> Self {
        MultiKeyImitator {
            shared,
            seed,
            jsd1_use_detector_seed,
            active: None,
        }
    }

    fn ensure(&mut self) -> Result<&mut BbCipher, CipherError> {
        if self.active.is_none() {
            let chosen = self.shared.chosen.get().ok_or(CipherError::PeerNotReady)?;
            let seed = if chosen.key.subtype == BbSubtype::Jsd1 && self.jsd1_use_detector_seed {
                &chosen.seed
            } else {
                &self.seed
            };
            self.active = Some(BbCipher::new(&chosen.key, seed)?);
        }
        Ok(self.active.as_mut().unwrap())
    }

    pub fn encrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        self.ensure()?.encrypt(data, advance)
    }

    pub fn decrypt(&mut self, data: &mut [u8], advance: bool) -> Result<(), CipherError> {
        self.ensure()?.decrypt(data, advance)
    }
}
