#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use shipproto::Dialect;

mod battlerec;
mod cards;
mod channel;
mod config;
mod drops;
mod error;
mod levels;
mod player;
mod proxy;
mod quests;
mod rooms;
mod session;
mod ship;
mod subcmd;

use config::Config;
use session::SessionId;
use ship::{DirSaves, Ship, ShipEvent};

fn usage_and_exit() -> ! {
    eprintln!(
        "shipd (game server)\n\n\
USAGE:\n  shipd [--root DIR]\n\n\
ENV:\n  SHIPD_ROOT    data directory (default .); expects system/, quests/, ep3/ inside\n"
    );
    std::process::exit(2);
}

fn parse_root() -> PathBuf {
    let mut root = PathBuf::from(std::env::var("SHIPD_ROOT").unwrap_or_else(|_| ".".to_string()));
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--root" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                root = PathBuf::from(v);
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    root
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,shipd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let root = parse_root();
    let cfg = Config::load(&root).context("load configuration")?;

    let level_table = if cfg.levels_path().exists() {
        Arc::new(levels::LevelTable::load(&cfg.levels_path()).context("load level table")?)
    } else {
        info!("no level table file; using the flat default curve");
        Arc::new(levels::LevelTable::flat_default())
    };
    let rare_items = if cfg.rare_items_path().exists() {
        Some(Arc::new(
            drops::RareItemSet::load(&cfg.rare_items_path()).context("load rare item tables")?,
        ))
    } else {
        None
    };
    let quest_index =
        Arc::new(quests::QuestIndex::load(&cfg.quests_dir()).context("load quest index")?);
    info!(quests = quest_index.len(), "quest index ready");
    let card_index = if cfg.ep3_dir().join("card-definitions.mnr").exists() {
        let idx = cards::CardIndex::load(&cfg.ep3_dir(), cfg.file.ep3_behavior_flags)
            .context("load card index")?;
        info!(cards = idx.all_card_ids().len(), maps = idx.all_map_numbers().len(),
            "card index ready");
        Some(Arc::new(idx))
    } else {
        None
    };

    let saves_dir = root.join("players");
    std::fs::create_dir_all(&saves_dir).context("create players directory")?;

    let ship = Ship::new(
        &cfg,
        level_table,
        rare_items,
        Arc::new(drops::BasicCommonItems),
        quest_index,
        card_index,
        Box::new(DirSaves { dir: saves_dir }),
    );
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    // Bind everything before starting the state task so a bad port is a
    // startup failure, not a runtime surprise.
    let mut listeners = Vec::new();
    for (dialect, addr) in &cfg.listeners {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr} ({dialect})"))?;
        info!(%addr, %dialect, "listening");
        listeners.push((*dialect, listener));
    }
    let proxy_listener = match &cfg.file.proxy {
        Some(p) => {
            let dialect = Dialect::from_name(&p.dialect)
                .with_context(|| format!("unknown proxy dialect {:?}", p.dialect))?;
            anyhow::ensure!(dialect != Dialect::V4, "v4 proxying is not supported");
            let addr: SocketAddr = format!("{}:{}", cfg.file.bind_host, p.listen_port).parse()?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind proxy {addr}"))?;
            info!(%addr, remote = %p.remote, "proxy listening");
            Some((dialect, p.remote, listener))
        }
        None => None,
    };

    tokio::spawn(ship.run(events_rx));

    let sid_counter = Arc::new(AtomicU64::new(1));
    for (dialect, listener) in listeners {
        let events_tx = events_tx.clone();
        let sid_counter = sid_counter.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let sid = SessionId(sid_counter.fetch_add(1, Ordering::Relaxed));
                tokio::spawn(serve_connection(
                    sid,
                    stream,
                    peer,
                    dialect,
                    events_tx.clone(),
                ));
            }
        });
    }

    if let Some((dialect, remote, listener)) = proxy_listener {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        warn!(err = %e, "proxy accept failed");
                        continue;
                    }
                };
                info!(%peer, "proxy client connected");
                let (_inject_tx, inject_rx) = mpsc::unbounded_channel();
                tokio::spawn(async move {
                    if let Err(e) =
                        proxy::run_proxy_session(dialect, stream, remote, inject_rx).await
                    {
                        warn!(%peer, err = %e, "proxy session failed");
                    }
                });
            }
        });
    }

    // Run until interrupted.
    tokio::signal::ctrl_c().await.context("wait for shutdown")?;
    info!("shutting down");
    Ok(())
}

/// Per-connection plumbing: a writer task drains the session's outbound
/// queue; this task forwards inbound bytes to the state task.
async fn serve_connection(
    sid: SessionId,
    stream: TcpStream,
    peer: SocketAddr,
    dialect: Dialect,
    events: mpsc::UnboundedSender<ShipEvent>,
) {
    let (mut rd, wr) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let mut wr = wr;
        let mut rx = out_rx;
        while let Some(chunk) = rx.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    if events
        .send(ShipEvent::Accept {
            sid,
            addr: peer,
            dialect,
            out: out_tx,
        })
        .is_err()
    {
        return;
    }

    let mut buf = [0u8; 4096];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if events
                    .send(ShipEvent::Data(sid, Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return;
                }
            }
        }
    }
    let _ = events.send(ShipEvent::Closed(sid));
}
