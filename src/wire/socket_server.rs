//! The one concrete transport this crate ships: a length-prefixed,
//! array-of-bulk-strings frame listener over TCP or a Unix socket (spec
//! §6.1 "native frames").
//!
//! Grounded verbatim on `socket_server.rs`'s accept-loop-and-spawn idiom —
//! same per-connection task spawn, same `metrics::counter!`/`gauge!` call
//! sites — reading `aol::decode_frame`'s wire format instead of a
//! length-prefixed protobuf envelope.

use crate::aol;
use crate::dispatcher::{self, Session};
use crate::server::Server;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

/// Maximum number of buffered bytes awaiting a complete frame before a
/// connection is dropped as abusive.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

pub struct NativeSocketServer {
    socket_path: PathBuf,
    listener: UnixListener,
}

impl NativeSocketServer {
    pub async fn start<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {:?}", socket_path))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating socket directory {:?}", parent))?;
        }

        let listener = UnixListener::bind(&socket_path).with_context(|| format!("binding socket {:?}", socket_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o660))
                .with_context(|| format!("setting permissions on {:?}", socket_path))?;
        }

        info!(path = ?socket_path, "native socket server listening");
        metrics::gauge!("wire.socket.server.started").set(1.0);

        Ok(Self { socket_path, listener })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `server.shutdown` fires.
    pub async fn accept_loop(self, server: Arc<Server>) {
        let mut connection_id = 0u64;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            connection_id += 1;
                            let id = connection_id;
                            server.counters.connections_accepted.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            metrics::gauge!("wire.socket.connections.active").increment(1.0);
                            metrics::counter!("wire.socket.connections.accepted_total").increment(1);

                            let server = server.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, server).await {
                                    error!(connection_id = id, error = %e, "connection error");
                                }
                                metrics::gauge!("wire.socket.connections.active").decrement(1.0);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                            metrics::counter!("wire.socket.errors.accept_total").increment(1);
                        }
                    }
                }
                _ = server.shutdown.cancelled() => break,
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, server: Arc<Server>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    let mut session = Session::default();

    loop {
        let mut chunk = [0u8; 4096];
        let n = reader.read(&mut chunk).await.context("reading from socket")?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_PENDING_BYTES {
            anyhow::bail!("frame buffer exceeded {MAX_PENDING_BYTES} bytes without completing");
        }

        loop {
            match aol::decode_frame(&buf) {
                Ok((args, consumed)) => {
                    buf.drain(..consumed);
                    metrics::counter!("wire.socket.frames.received_total").increment(1);
                    if args.first().is_some_and(|t| t.eq_ignore_ascii_case("AOF")) {
                        let pos: u64 = match args.get(1).and_then(|s| s.parse().ok()) {
                            Some(p) => p,
                            None => {
                                let err = serde_json::json!({ "ok": false, "err": "bad pos", "code": "syntax" });
                                let mut out = serde_json::to_vec(&err).context("encoding response")?;
                                out.push(b'\n');
                                write_half.write_all(&out).await.context("writing response")?;
                                continue;
                            }
                        };
                        return stream_aof(pos, write_half, server).await;
                    }
                    let response = dispatcher::execute(&server, &mut session, args).await;
                    let body = match response {
                        Ok(v) => v,
                        Err(e) => serde_json::json!({ "ok": false, "err": e.to_string(), "code": e.code() }),
                    };
                    let mut out = serde_json::to_vec(&body).context("encoding response")?;
                    out.push(b'\n');
                    write_half.write_all(&out).await.context("writing response")?;
                }
                Err(aol::DecodeError::Incomplete) => break,
                Err(aol::DecodeError::Malformed) => {
                    metrics::counter!("wire.socket.errors.malformed_total").increment(1);
                    buf.drain(..1);
                }
            }
        }
    }
}

/// Take over the connection as a live AOF follower (spec §4.2.4): send
/// everything from `pos` to the log's current end, then forward each
/// newly appended frame as `append()` broadcasts it. A frame written
/// between the catch-up read and the `subscribe()` call below could be
/// delivered twice; replaying an already-applied command is tolerated by
/// the dispatcher (see `CommandError::is_replay_tolerable`), so this is a
/// documented best-effort rather than an exactly-once guarantee.
async fn stream_aof(pos: u64, mut write_half: tokio::net::unix::OwnedWriteHalf, server: Arc<Server>) -> Result<()> {
    let mut rx = server.aol.subscribe();
    let catchup = server.aol.read_from(pos).await.context("reading AOF catch-up range")?;
    write_half.write_all(&catchup).await.context("writing AOF catch-up bytes")?;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(bytes) => {
                        write_half.write_all(&bytes).await.context("writing AOF tail frame")?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        metrics::counter!("wire.socket.aof_tail.lagged_total").increment(1);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = server.shutdown.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn starts_and_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terrane.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = NativeSocketServer::start(&path).await.unwrap();
        assert_eq!(server.socket_path(), path.as_path());
    }

    #[tokio::test]
    async fn roundtrips_one_command_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("config.json")).unwrap();
        let app = Server::open(config).await.unwrap();
        let socket_path = dir.path().join("terrane.sock");
        let listener = NativeSocketServer::start(&socket_path).await.unwrap();

        let app_for_accept = app.clone();
        tokio::spawn(listener.accept_loop(app_for_accept));

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(&aol::encode_frame(&["PING".to_string()])).await.unwrap();

        let mut resp = [0u8; 256];
        let n = client.read(&mut resp).await.unwrap();
        let text = String::from_utf8_lossy(&resp[..n]);
        assert!(text.contains("\"pong\":true"));
    }
}
