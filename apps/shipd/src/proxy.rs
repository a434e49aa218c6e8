//! Transparent proxy mode.
//!
//! One inbound client is paired with one outbound connection to a real
//! server. Until the remote's server-init arrives, both directions are
//! cleartext; the init installs mirror-image ciphers (we decrypt with the
//! same keys both endpoints derived) and is passed through untouched.
//! After that every frame is decrypted, optionally rewritten or dropped,
//! re-encrypted, and forwarded. Frames can also be injected toward either
//! side. V4 sessions are not proxied.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use keystream::{Cipher, GcCipher, PcCipher};
use shipproto::frame::Frame;
use shipproto::handshake::{is_handshake_opcode, ServerInit};
use shipproto::Dialect;

use crate::channel::Channel;
use crate::error::ShipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDirection {
    /// Toward the real server.
    ToRemote,
    /// Toward the local client.
    ToClient,
}

/// Inspect/modify a frame before it is forwarded; `false` drops it.
pub type RewriteFn = Box<dyn FnMut(ProxyDirection, &mut Frame) -> bool + Send>;

pub struct ProxySession {
    client: Channel,
    remote: Channel,
    dialect: Dialect,
    handshake_done: bool,
    rewrite: Option<RewriteFn>,
}

impl ProxySession {
    pub fn new(
        dialect: Dialect,
        client_out: mpsc::UnboundedSender<Bytes>,
        remote_out: mpsc::UnboundedSender<Bytes>,
    ) -> Result<ProxySession, ShipError> {
        if dialect == Dialect::V4 {
            return Err(ShipError::Unsupported("v4 proxying"));
        }
        Ok(ProxySession {
            client: Channel::new(dialect, client_out),
            remote: Channel::new(dialect, remote_out),
            dialect,
            handshake_done: false,
            rewrite: Some(Box::new(|_, _| true)),
        })
    }

    pub fn set_rewrite(&mut self, f: RewriteFn) {
        self.rewrite = Some(f);
    }

    fn stream_cipher(&self, seed: u32) -> Cipher {
        match self.dialect {
            Dialect::V1 => Cipher::Pc(PcCipher::new(seed)),
            _ => Cipher::Gc(GcCipher::new(seed)),
        }
    }

    /// Bytes arriving from the real server.
    pub fn on_remote_data(&mut self, data: &[u8]) -> Result<(), ShipError> {
        let frames = self.remote.push(data)?;
        for frame in frames {
            if !self.handshake_done && is_handshake_opcode(frame.opcode) {
                let init = ServerInit::decode(&frame.payload)?;
                info!(
                    server_key = format_args!("{:08X}", init.server_key),
                    client_key = format_args!("{:08X}", init.client_key),
                    "proxy handshake observed"
                );
                // Pass the init through in the clear, then key all four
                // directions.
                self.client.send(frame.opcode, frame.flag, &frame.payload)?;
                self.remote.set_cipher(
                    self.stream_cipher(init.server_key),
                    self.stream_cipher(init.client_key),
                );
                self.client.set_cipher(
                    self.stream_cipher(init.client_key),
                    self.stream_cipher(init.server_key),
                );
                self.handshake_done = true;
                continue;
            }
            self.forward(ProxyDirection::ToClient, frame)?;
        }
        Ok(())
    }

    /// Bytes arriving from the local client.
    pub fn on_client_data(&mut self, data: &[u8]) -> Result<(), ShipError> {
        let frames = self.client.push(data)?;
        for frame in frames {
            self.forward(ProxyDirection::ToRemote, frame)?;
        }
        Ok(())
    }

    fn forward(&mut self, dir: ProxyDirection, mut frame: Frame) -> Result<(), ShipError> {
        if let Some(rewrite) = self.rewrite.as_mut() {
            if !rewrite(dir, &mut frame) {
                return Ok(());
            }
        }
        let chan = match dir {
            ProxyDirection::ToClient => &mut self.client,
            ProxyDirection::ToRemote => &mut self.remote,
        };
        chan.send(frame.opcode, frame.flag, &frame.payload)
    }

    /// Push an arbitrary frame toward either side.
    pub fn inject(
        &mut self,
        dir: ProxyDirection,
        opcode: u16,
        flag: u32,
        payload: &[u8],
    ) -> Result<(), ShipError> {
        let chan = match dir {
            ProxyDirection::ToClient => &mut self.client,
            ProxyDirection::ToRemote => &mut self.remote,
        };
        chan.send(opcode, flag, payload)
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
        self.remote.disconnect();
    }
}

pub enum ProxyEvent {
    Inject(ProxyDirection, u16, u32, Vec<u8>),
}

/// Drive one proxied client: connect out, then pump both sockets and the
/// inject queue until either side drops.
pub async fn run_proxy_session(
    dialect: Dialect,
    client_stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    mut events: mpsc::UnboundedReceiver<ProxyEvent>,
) -> anyhow::Result<()> {
    let remote_stream = TcpStream::connect(remote_addr).await?;
    info!(%remote_addr, "proxy session connected");

    let (mut client_rd, client_wr) = client_stream.into_split();
    let (mut remote_rd, remote_wr) = remote_stream.into_split();
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (remote_tx, remote_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_task(client_wr, client_rx));
    tokio::spawn(write_task(remote_wr, remote_rx));

    let mut session =
        ProxySession::new(dialect, client_tx, remote_tx).map_err(|e| anyhow::anyhow!("{e}"))?;

    let mut client_buf = [0u8; 4096];
    let mut remote_buf = [0u8; 4096];
    loop {
        tokio::select! {
            n = client_rd.read(&mut client_buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                if let Err(e) = session.on_client_data(&client_buf[..n]) {
                    warn!(err = %e, "client stream error");
                    break;
                }
            }
            n = remote_rd.read(&mut remote_buf) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                if let Err(e) = session.on_remote_data(&remote_buf[..n]) {
                    warn!(err = %e, "remote stream error");
                    break;
                }
            }
            ev = events.recv() => {
                match ev {
                    Some(ProxyEvent::Inject(dir, opcode, flag, payload)) => {
                        if let Err(e) = session.inject(dir, opcode, flag, &payload) {
                            warn!(err = %e, "inject failed");
                        }
                    }
                    None => break,
                }
            }
        }
    }
    session.disconnect();
    info!("proxy session ended");
    Ok(())
}

async fn write_task(
    mut wr: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(chunk) = rx.recv().await {
        if wr.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipproto::frame::decode_header;

    struct Wires {
        session: ProxySession,
        to_client: mpsc::UnboundedReceiver<Bytes>,
        to_remote: mpsc::UnboundedReceiver<Bytes>,
    }

    fn wires(dialect: Dialect) -> Wires {
        let (ctx, crx) = mpsc::unbounded_channel();
        let (rtx, rrx) = mpsc::unbounded_channel();
        Wires {
            session: ProxySession::new(dialect, ctx, rtx).unwrap(),
            to_client: crx,
            to_remote: rrx,
        }
    }

    /// A fake remote endpoint: one outbound cipher keyed by server_key,
    /// one inbound keyed by client_key.
    struct FakeRemote {
        out: Channel,
        inn: Channel,
        wire: mpsc::UnboundedReceiver<Bytes>,
        _sink: mpsc::UnboundedReceiver<Bytes>,
    }

    fn fake_remote(server_key: u32, client_key: u32) -> FakeRemote {
        let (tx, wire) = mpsc::unbounded_channel();
        let (tx2, sink) = mpsc::unbounded_channel();
        let mut out = Channel::new(Dialect::V2, tx);
        let mut inn = Channel::new(Dialect::V2, tx2);
        out.set_cipher(
            Cipher::Gc(GcCipher::new(0)),
            Cipher::Gc(GcCipher::new(server_key)),
        );
        inn.set_cipher(
            Cipher::Gc(GcCipher::new(client_key)),
            Cipher::Gc(GcCipher::new(0)),
        );
        FakeRemote { out, inn, wire, _sink: sink }
    }

    #[test]
    fn v4_is_refused() {
        let (ctx, _c) = mpsc::unbounded_channel();
        let (rtx, _r) = mpsc::unbounded_channel();
        assert!(ProxySession::new(Dialect::V4, ctx, rtx).is_err());
    }

    #[test]
    fn handshake_keys_both_sides_and_traffic_flows() {
        let mut w = wires(Dialect::V2);
        let (server_key, client_key) = (0x1234_5678, 0x9ABC_DEF0);

        // Remote sends the init in cleartext.
        let init = ServerInit {
            copyright: "Lobby Server".into(),
            server_key,
            client_key,
            after_message: String::new(),
        };
        let init_frame = crate::channel::build_frame(Dialect::V2, 0x02, 0, &init.encode());
        w.session.on_remote_data(&init_frame).unwrap();

        // Client got the init untouched (still cleartext).
        let to_client = w.to_client.try_recv().unwrap();
        let h = decode_header(Dialect::V2, &to_client).unwrap();
        assert_eq!(h.opcode, 0x02);
        assert_eq!(
            ServerInit::decode(&to_client[4..]).unwrap().server_key,
            server_key
        );

        // Encrypted traffic from the remote now reaches the client
        // re-encrypted under the same server key.
        let mut remote = fake_remote(server_key, client_key);
        remote.out.send(0x60, 2, &[9, 9, 9, 9]).unwrap();
        let enc = remote.wire.try_recv().unwrap();
        w.session.on_remote_data(&enc).unwrap();
        let mut forwarded = w.to_client.try_recv().unwrap().to_vec();
        GcCipher::new(server_key).apply(&mut forwarded, true).unwrap();
        assert_eq!(forwarded[0], 0x60);
        assert_eq!(&forwarded[4..8], &[9, 9, 9, 9]);

        // And client->remote traffic decrypts under the client key at
        // the remote. Build what a real client would put on the wire.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut real_client = Channel::new(Dialect::V2, tx);
        real_client.set_cipher(
            Cipher::Gc(GcCipher::new(server_key)),
            Cipher::Gc(GcCipher::new(client_key)),
        );
        real_client.send(0x62, 1, &[5, 5, 5, 5]).unwrap();
        let wire = rx.try_recv().unwrap();
        w.session.on_client_data(&wire).unwrap();

        let enc = w.to_remote.try_recv().unwrap();
        let frames = remote.inn.push(&enc).unwrap();
        assert_eq!(frames[0].opcode, 0x62);
        assert_eq!(&frames[0].payload[..4], &[5, 5, 5, 5]);
    }

    #[test]
    fn rewriter_can_drop_frames() {
        let mut w = wires(Dialect::V2);
        w.session.set_rewrite(Box::new(|_, frame| frame.opcode != 0x19));

        let keep = crate::channel::build_frame(Dialect::V2, 0x60, 0, &[1, 1, 1, 1]);
        let drop = crate::channel::build_frame(Dialect::V2, 0x19, 0, &[2, 2, 2, 2]);
        w.session.on_client_data(&keep).unwrap();
        w.session.on_client_data(&drop).unwrap();

        let forwarded = w.to_remote.try_recv().unwrap();
        assert_eq!(forwarded[0], 0x60);
        assert!(w.to_remote.try_recv().is_err());
    }

    #[test]
    fn inject_toward_either_side() {
        let mut w = wires(Dialect::V2);
        w.session
            .inject(ProxyDirection::ToClient, 0x1D, 0, &[])
            .unwrap();
        w.session
            .inject(ProxyDirection::ToRemote, 0x05, 0, &[])
            .unwrap();
        assert_eq!(w.to_client.try_recv().unwrap()[0], 0x1D);
        assert_eq!(w.to_remote.try_recv().unwrap()[0], 0x05);
    }
}
