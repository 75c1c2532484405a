//! Admin server: accepts the inbound varnishd management connection,
//! performs the challenge/response handshake, and runs the serialized RPC
//! loop described in the component design for the admin server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{AdminResponse, CodecError};

const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const CALLER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("admin server did not authenticate: status {0}")]
    AuthFailed(i16),
    #[error("operation timed out")]
    Timeout,
    #[error("admin server shut down before replying")]
    Closed,
}

struct Request {
    line: String,
    reply: oneshot::Sender<AdminResponse>,
}

/// Cloneable front for issuing RPCs and awaiting the first-connection latch.
#[derive(Clone)]
pub struct AdminHandle {
    req_tx: mpsc::Sender<Request>,
    connected: watch::Receiver<bool>,
}

impl AdminHandle {
    /// Issue a command and await its reply, bounded by the 30s caller-side timeout.
    pub async fn exec(&self, line: impl Into<String>) -> Result<AdminResponse, AdminError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let req = Request {
            line: line.into(),
            reply: reply_tx,
        };
        self.req_tx.send(req).await.map_err(|_| AdminError::Closed)?;
        tokio::time::timeout(CALLER_TIMEOUT, reply_rx)
            .await
            .map_err(|_| AdminError::Timeout)?
            .map_err(|_| AdminError::Closed)
    }

    /// Resolves once the first inbound connection has authenticated. Never
    /// re-arms on later reconnects (first-event latch, see design notes).
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.clone();
        if *rx.borrow() {
            return;
        }
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct AdminServer {
    listener: TcpListener,
    secret: String,
    req_rx: mpsc::Receiver<Request>,
    connected_tx: watch::Sender<bool>,
    connected_fired: Arc<AtomicBool>,
}

impl AdminServer {
    pub async fn bind(addr: &str, secret: String) -> Result<(Self, AdminHandle), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let (req_tx, req_rx) = mpsc::channel(1);
        let (connected_tx, connected_rx) = watch::channel(false);
        let handle = AdminHandle {
            req_tx,
            connected: connected_rx,
        };
        let server = AdminServer {
            listener,
            secret,
            req_rx,
            connected_tx,
            connected_fired: Arc::new(AtomicBool::new(false)),
        };
        Ok((server, handle))
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` is cancelled. Exactly one
    /// connection is served at a time.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "chaperone::admin", "admin server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            info!(target: "chaperone::admin", %peer, "varnishd connected");
                            self.serve_connection(stream).await;
                        }
                        Err(err) => {
                            warn!(target: "chaperone::admin", %err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn serve_connection(&mut self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let handshake = tokio::time::timeout(AUTH_TIMEOUT, async {
            let challenge_resp = AdminResponse::read_from(&mut reader).await?;
            if challenge_resp.status != 107 {
                return Err(AdminError::AuthFailed(challenge_resp.status));
            }
            let challenge = challenge_resp
                .payload
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();

            let hash = auth_hash(&challenge, &self.secret);
            write_half
                .write_all(format!("auth {hash}\n").as_bytes())
                .await
                .map_err(CodecError::from)?;
            write_half.flush().await.map_err(CodecError::from)?;

            let auth_resp = AdminResponse::read_from(&mut reader).await?;
            if auth_resp.status != 200 {
                return Err(AdminError::AuthFailed(auth_resp.status));
            }
            Ok(auth_resp)
        })
        .await;

        let banner = match handshake {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                warn!(target: "chaperone::admin", %err, "handshake failed, dropping connection");
                return;
            }
            Err(_) => {
                warn!(target: "chaperone::admin", "handshake timed out, dropping connection");
                return;
            }
        };

        let (env_lines, version) = parse_banner(&banner.payload);
        info!(target: "chaperone::admin", ?env_lines, ?version, "authenticated");

        if self.connected_fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            let _ = self.connected_tx.send(true);
        }

        loop {
            let Some(req) = self.req_rx.recv().await else {
                return;
            };

            let result = tokio::time::timeout(COMMAND_TIMEOUT, async {
                write_half
                    .write_all(crate::codec::encode_command(&req.line).as_slice())
                    .await
                    .map_err(CodecError::from)?;
                write_half.flush().await.map_err(CodecError::from)?;
                AdminResponse::read_from(&mut reader).await
            })
            .await;

            let response = match result {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => AdminResponse::comms_error(err.to_string()),
                Err(_) => AdminResponse::comms_error("command timed out"),
            };

            let disconnected = response.status == 400;
            let _ = req.reply.send(response);

            if disconnected {
                // Mid-RPC disconnect: the in-flight caller already got its
                // synthesized error. Loop back to accept a fresh connection.
                return;
            }
        }
    }
}

fn auth_hash(challenge: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(b"\n");
    hasher.update(secret.as_bytes());
    hasher.update(challenge.as_bytes());
    hasher.update(b"\n");
    hex::encode(hasher.finalize())
}

fn env_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+(,[^,\r\n]+)+$").unwrap())
}

fn version_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"varnish-[^\r\n]+").unwrap())
}

fn parse_banner(payload: &str) -> (Vec<String>, Option<String>) {
    let env_lines = payload
        .lines()
        .filter(|l| env_line_regex().is_match(l))
        .map(|l| l.to_string())
        .collect();
    let version = payload
        .lines()
        .find_map(|l| version_line_regex().find(l).map(|m| m.as_str().to_string()));
    (env_lines, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn auth_hash_matches_reference_construction() {
        let hash = auth_hash("abc123", "topsecret");
        let mut hasher = Sha256::new();
        hasher.update(b"abc123\ntopsecretabc123\n");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(hash, expected);
    }

    #[test]
    fn parses_banner_env_and_version_lines() {
        let payload = "varnish-plus 6.0.11\nCLI,1,1\nsome other line\n";
        let (env_lines, version) = parse_banner(payload);
        assert_eq!(env_lines, vec!["CLI,1,1".to_string()]);
        assert_eq!(version.as_deref(), Some("varnish-plus 6.0.11"));
    }

    #[tokio::test]
    async fn full_handshake_then_ping_round_trip() {
        let (server, handle) = AdminServer::bind("127.0.0.1:0", "s3cr3t".to_string())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let shutdown_for_server = shutdown.clone();
        let server_task = tokio::spawn(server.run(shutdown_for_server));

        let mock = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (rd, mut wr) = stream.into_split();
            let mut rd = BufReader::new(rd);
            AdminResponse::new(107, "abc123\n").write_to(&mut wr).await.unwrap();

            let mut auth_line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut rd, &mut auth_line).await.unwrap();
            assert!(auth_line.starts_with("auth "));

            AdminResponse::new(200, "varnish-plus 6.0.11\n").write_to(&mut wr).await.unwrap();

            let mut cmd_line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut rd, &mut cmd_line).await.unwrap();
            assert_eq!(cmd_line, "ping\n");

            AdminResponse::new(200, "PONG").write_to(&mut wr).await.unwrap();
        });

        handle.wait_connected().await;
        let resp = handle.exec("ping").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.payload, "PONG");

        shutdown.cancel();
        let _ = server_task.await;
        let _ = mock.await;
    }
}
