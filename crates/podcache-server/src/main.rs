// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! PodCache server (`podcached`).
//!
//! Accepts RESP clients over TCP and serves `PING`, `SET`, `GET`,
//! `DEL`/`UNLINK`, `INCR`, `CLIENT`, and `QUIT` against a partitioned
//! two-tier cache: hot entries in memory, cold entries spilled to a
//! content-addressed directory tree that is cleaned up on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use podcache_resp::{parse_command, reply, Command, CommandKind, MAX_BULK_LEN};
use podcache_store::{PodCache, StoreError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MIB: usize = 1024 * 1024;
/// Socket read chunk size.
const READ_CHUNK: usize = 16 * 1024;
/// Receive-buffer bound: one maximal SET frame (1 MiB value) plus slack for
/// the key and framing.
const MAX_COMMAND_BYTES: usize = MAX_BULK_LEN + 16 * 1024;
/// Interval between periodic occupancy reports.
const STATUS_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "PodCache: two-tier RESP key/value cache server")]
struct Args {
    /// TCP listen port
    #[arg(
        long,
        env = "PODCACHE_SERVER_PORT",
        default_value_t = 6379,
        value_parser = clap::value_parser!(u16).range(1024..=65535)
    )]
    port: u16,

    /// Total cache capacity in MiB, split evenly across partitions
    #[arg(
        long,
        env = "PODCACHE_SIZE",
        default_value_t = 100,
        value_parser = clap::value_parser!(u64).range(1..=4096)
    )]
    size_mib: u64,

    /// Number of in-memory LRU partitions
    #[arg(
        long,
        env = "PODCACHE_PARTITIONS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=64)
    )]
    partitions: u16,

    /// Directory prefix for the disk tier's private namespace
    #[arg(long, env = "PODCACHE_FSROOT", default_value = "./")]
    fsroot: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("starting PodCache server");
    let cache = Arc::new(PodCache::new(
        usize::try_from(args.size_mib)? * MIB,
        usize::from(args.partitions),
        &args.fsroot,
    )?);

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "listening, ready to accept connections");

    let status = tokio::spawn(status_loop(Arc::clone(&cache)));
    serve(listener, cache, shutdown_signal()).await;
    // Await the aborted task so its cache handle is gone before we return;
    // the last handle to drop tears down the disk tier's base directory.
    status.abort();
    let _ = status.await;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            let _ = ctrl_c.await;
        }
    }
}

/// Accept loop: one task per client, until `shutdown` resolves.
async fn serve(listener: TcpListener, cache: Arc<PodCache>, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    let mut clients = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received, closing listener");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        let cache = Arc::clone(&cache);
                        clients.spawn(async move {
                            if let Err(err) = handle_client(stream, cache).await {
                                warn!(?err, %peer, "client handler error");
                            }
                            debug!(%peer, "client disconnected");
                        });
                    }
                    Err(err) => warn!(?err, "failed to accept connection"),
                }
            }
            // Reap finished handlers as we go.
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
    // Abort surviving connections; their Arc clones must go before the
    // caller can tear down the cache and its disk directory.
    clients.shutdown().await;
}

/// Per-connection loop: read, frame, dispatch, reply, in arrival order.
async fn handle_client(mut stream: TcpStream, cache: Arc<PodCache>) -> Result<()> {
    let mut read_buf = vec![0u8; READ_CHUNK];
    let mut acc: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&read_buf[..n]);
        if acc.len() > MAX_COMMAND_BYTES {
            warn!(buffered = acc.len(), "command buffer overflow, discarding");
            stream.write_all(&reply::error("command too large")).await?;
            acc.clear();
            continue;
        }

        // Drain as many complete commands as the buffer holds.
        loop {
            match parse_command(&acc) {
                Ok(Some((cmd, consumed))) => {
                    acc.drain(..consumed);
                    let (response, quit) = dispatch(&cmd, &cache);
                    stream.write_all(&response).await?;
                    if quit {
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%err, "malformed command, resetting buffer");
                    stream.write_all(&reply::error("protocol error")).await?;
                    acc.clear();
                    break;
                }
            }
        }
    }
}

/// Map one parsed command to its reply. The bool is the quit flag.
fn dispatch(cmd: &Command, cache: &PodCache) -> (Vec<u8>, bool) {
    match cmd.kind() {
        CommandKind::Ping => (reply::simple("PONG"), false),
        CommandKind::Quit => (reply::simple("BYE"), true),
        // Stub: enough for client-library handshakes.
        CommandKind::Client => (reply::simple("OK"), false),
        CommandKind::Set => match (cmd.arg(0), cmd.arg(1)) {
            (Some(key), Some(value)) => match cache.put(key, value) {
                Ok(partition) => {
                    debug!(partition, key_len = key.len(), value_len = value.len(), "SET");
                    (reply::simple("OK"), false)
                }
                Err(err) => {
                    warn!(%err, "SET failed");
                    (reply::error("failed to store value"), false)
                }
            },
            _ => (reply::error("wrong number of arguments"), false),
        },
        CommandKind::Get => match cmd.arg(0) {
            Some(key) => match cache.get(key) {
                Ok(value) => (reply::bulk(value.as_deref()), false),
                Err(err) => {
                    warn!(%err, "GET failed");
                    (reply::error("failed to read value"), false)
                }
            },
            None => (reply::error("wrong number of arguments"), false),
        },
        CommandKind::Del | CommandKind::Unlink => match cmd.arg(0) {
            Some(key) => match cache.evict(key) {
                Ok(removed) => (reply::integer(i64::from(removed)), false),
                Err(err) => {
                    warn!(%err, "DEL failed");
                    (reply::error("error"), false)
                }
            },
            None => (reply::error("wrong number of arguments"), false),
        },
        CommandKind::Incr => match cmd.arg(0) {
            Some(key) => match cache.incr(key) {
                Ok(value) => (reply::integer(value), false),
                Err(StoreError::NotAnInteger) => (
                    reply::error("value is not an integer or out of range"),
                    false,
                ),
                Err(err) => {
                    warn!(%err, "INCR failed");
                    (reply::error("failed to store value"), false)
                }
            },
            None => (reply::error("wrong number of arguments"), false),
        },
        CommandKind::Unknown => (reply::error("unknown command"), false),
    }
}

/// Periodic occupancy report for both tiers.
async fn status_loop(cache: Arc<PodCache>) {
    let mut interval = tokio::time::interval(STATUS_PERIOD);
    // interval() ticks immediately; skip the startup tick.
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = cache.stats();
        for (partition, p) in stats.partitions.iter().enumerate() {
            info!(
                partition,
                entries = p.entries,
                used_bytes = p.used_bytes,
                capacity = p.capacity,
                "partition status"
            );
        }
        info!(entries = stats.disk_entries, "disk tier status");
    }
}
