//! The framed channel: encrypted length-prefixed commands over a byte
//! stream.
//!
//! The channel does not own a socket. A reader task feeds raw bytes in
//! through `push`; outbound frames leave through an mpsc the writer task
//! drains. All cipher state stays here, on the state task, so peek and
//! advance calls are never interleaved from another task.
//!
//! Inbound reframing: peek the first `header_size` bytes through the
//! inbound cipher to learn the frame length, wait until that many bytes
//! are buffered, then advance-decrypt the whole frame and hand it up.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use keystream::Cipher;
use shipproto::frame::{decode_header, encode_header, Frame};
use shipproto::Dialect;

use crate::error::ShipError;

#[derive(Debug)]
pub struct Channel {
    pub dialect: Dialect,
    crypt_in: Option<Cipher>,
    crypt_out: Option<Cipher>,
    out: Option<mpsc::UnboundedSender<Bytes>>,
    buf: BytesMut,
    pending_total: Option<usize>,
}

impl Channel {
    pub fn new(dialect: Dialect, out: mpsc::UnboundedSender<Bytes>) -> Channel {
        Channel {
            dialect,
            crypt_in: None,
            crypt_out: None,
            out: Some(out),
            buf: BytesMut::with_capacity(4 * 1024),
            pending_total: None,
        }
    }

    /// Installed mid-stream, after the handshake command has gone out in
    /// the clear.
    pub fn set_cipher(&mut self, crypt_in: Cipher, crypt_out: Cipher) {
        self.crypt_in = Some(crypt_in);
        self.crypt_out = Some(crypt_out);
    }

    pub fn has_cipher(&self) -> bool {
        self.crypt_in.is_some()
    }

    pub fn connected(&self) -> bool {
        self.out.is_some()
    }

    /// Closes the write side; the writer task exits and the socket drops.
    /// Never re-opens.
    pub fn disconnect(&mut self) {
        self.out = None;
    }

    fn alignment(&self) -> usize {
        self.crypt_out
            .as_ref()
            .map(|c| c.alignment())
            .unwrap_or_else(|| self.dialect.cipher_alignment())
    }

    /// Send a command with an automatically built header.
    pub fn send(&mut self, opcode: u16, flag: u32, payload: &[u8]) -> Result<(), ShipError> {
        let hs = self.dialect.header_size();
        let total = round_up(hs + payload.len(), self.alignment());
        let mut buf = vec![0u8; total];
        encode_header(self.dialect, opcode, flag, total, &mut buf[..hs]);
        buf[hs..hs + payload.len()].copy_from_slice(payload);
        self.encrypt_and_write(buf)
    }

    /// Send bytes that already carry a header; only pads and encrypts.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), ShipError> {
        let mut buf = data.to_vec();
        buf.resize(round_up(buf.len(), self.alignment()), 0);
        self.encrypt_and_write(buf)
    }

    fn encrypt_and_write(&mut self, mut buf: Vec<u8>) -> Result<(), ShipError> {
        if let Some(c) = self.crypt_out.as_mut() {
            c.encrypt(&mut buf, true)?;
        }
        if let Some(out) = &self.out {
            // A closed writer means the peer is already gone; the session
            // teardown path handles it.
            let _ = out.send(Bytes::from(buf));
        }
        Ok(())
    }

    /// Feed raw socket bytes in; returns every complete frame they
    /// finish. `BadFrame` poisons the connection and the caller closes
    /// it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ShipError> {
        self.buf.extend_from_slice(data);
        let hs = self.dialect.header_size();
        let mut frames = Vec::new();

        loop {
            let total = match self.pending_total {
                Some(t) => t,
                None => {
                    if self.buf.len() < hs {
                        break;
                    }
                    let mut head = [0u8; 8];
                    head[..hs].copy_from_slice(&self.buf[..hs]);
                    if let Some(c) = self.crypt_in.as_mut() {
                        c.decrypt(&mut head[..hs], false)?;
                    }
                    let header = decode_header(self.dialect, &head[..hs])?;
                    self.pending_total = Some(header.total);
                    header.total
                }
            };

            if self.buf.len() < total {
                break;
            }
            let mut frame = self.buf.split_to(total).to_vec();
            self.pending_total = None;
            if let Some(c) = self.crypt_in.as_mut() {
                c.decrypt(&mut frame, true)?;
            }
            let header = decode_header(self.dialect, &frame[..hs])?;
            frames.push(Frame {
                opcode: header.opcode,
                flag: header.flag,
                payload: Bytes::from(frame).slice(hs..),
            });
        }
        Ok(frames)
    }
}

fn round_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Build one cleartext frame (header + payload + padding). The proxy uses
/// this to re-frame commands it forwards.
pub fn build_frame(dialect: Dialect, opcode: u16, flag: u32, payload: &[u8]) -> Vec<u8> {
    let hs = dialect.header_size();
    let total = round_up(hs + payload.len(), dialect.cipher_alignment());
    let mut buf = vec![0u8; total];
    encode_header(dialect, opcode, flag, total, &mut buf[..hs]);
    buf[hs..hs + payload.len()].copy_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystream::{GcCipher, PcCipher};
    use shipproto::ProtoError;

    fn pair(dialect: Dialect) -> (Channel, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channel::new(dialect, tx), rx)
    }

    #[test]
    fn cleartext_round_trip() {
        let (mut ch, mut rx) = pair(Dialect::V2);
        ch.send(0x17, 0, b"hello!").unwrap();
        let wire = rx.try_recv().unwrap();
        assert_eq!(wire.len(), 12); // 4 header + 6 payload + 2 pad

        let (mut peer, _rx2) = pair(Dialect::V2);
        let frames = peer.push(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, 0x17);
        assert_eq!(&frames[0].payload[..6], b"hello!");
    }

    #[test]
    fn v1_frame_shape_on_the_wire() {
        // opcode 0x05, flag 0, 6-byte payload => 12-byte encrypted frame
        // whose decrypted header reads {0x05, 0x00, 0x000C}.
        let (mut ch, mut rx) = pair(Dialect::V1);
        ch.set_cipher(
            Cipher::Pc(PcCipher::new(0x12345678)),
            Cipher::Pc(PcCipher::new(0x9ABCDEF0)),
        );
        ch.send(0x05, 0x00, &[1, 2, 3, 4, 5, 6]).unwrap();
        let wire = rx.try_recv().unwrap();
        assert_eq!(wire.len(), 12);

        let mut clear = wire.to_vec();
        PcCipher::new(0x9ABCDEF0).apply(&mut clear, true).unwrap();
        assert_eq!(&clear[..4], &[0x05, 0x00, 0x0C, 0x00]);
        assert_eq!(&clear[4..10], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn encrypted_frames_reassemble_across_partial_reads() {
        let (mut server, mut srx) = pair(Dialect::V2);
        server.set_cipher(
            Cipher::Gc(GcCipher::new(0x1111)),
            Cipher::Gc(GcCipher::new(0x2222)),
        );
        server.send(0x60, 3, &[0xAA; 20]).unwrap();
        server.send(0x62, 1, &[0xBB; 8]).unwrap();
        let mut wire = Vec::new();
        while let Ok(b) = srx.try_recv() {
            wire.extend_from_slice(&b);
        }

        let (mut client, _crx) = pair(Dialect::V2);
        client.set_cipher(
            Cipher::Gc(GcCipher::new(0x2222)),
            Cipher::Gc(GcCipher::new(0x1111)),
        );
        let mut frames = Vec::new();
        // Dribble the stream in 5-byte chunks.
        for chunk in wire.chunks(5) {
            frames.extend(client.push(chunk).unwrap());
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, 0x60);
        assert_eq!(frames[0].flag, 3);
        assert_eq!(&frames[0].payload[..20], &[0xAA; 20]);
        assert_eq!(frames[1].opcode, 0x62);
    }

    #[test]
    fn bad_declared_length_is_fatal() {
        let (mut ch, _rx) = pair(Dialect::V2);
        // Cleartext header declaring 2 bytes total.
        let wire = [0x60u8, 0x00, 0x02, 0x00];
        assert!(matches!(
            ch.push(&wire),
            Err(ShipError::Proto(ProtoError::BadFrame(_)))
        ));
    }

    #[test]
    fn send_raw_preserves_prebuilt_headers() {
        let (mut ch, mut rx) = pair(Dialect::V2);
        let frame = build_frame(Dialect::V2, 0x19, 0, &[7, 7, 7, 7]);
        ch.send_raw(&frame).unwrap();
        let wire = rx.try_recv().unwrap();
        let (mut peer, _r) = pair(Dialect::V2);
        let frames = peer.push(&wire).unwrap();
        assert_eq!(frames[0].opcode, 0x19);
        assert_eq!(&frames[0].payload[..4], &[7, 7, 7, 7]);
    }

    #[test]
    fn disconnect_drops_the_writer() {
        let (mut ch, mut rx) = pair(Dialect::V2);
        ch.disconnect();
        assert!(!ch.connected());
        ch.send(0x1D, 0, &[]).unwrap(); // silently dropped
        assert!(rx.try_recv().is_err());
    }
}
