//! UDP Query Server
//!
//! Owns the socket. Every datagram goes through the [`QueryDispatcher`] and
//! the reply, if any, is sent back to the source address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::QueryDispatcher;

/// Receive buffer. Larger than any valid request.
const RECV_BUFFER_SIZE: usize = 2048;

/// Query server errors.
#[derive(Debug, Error)]
pub enum QueryServerError {
    /// Failed to bind to address.
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket failure while serving.
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request counters.
#[derive(Debug, Default)]
pub struct QueryStats {
    received: AtomicU64,
    answered: AtomicU64,
}

impl QueryStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn answered(&self) -> u64 {
        self.answered.load(Ordering::Relaxed)
    }

    /// Datagrams that got no reply.
    pub fn dropped(&self) -> u64 {
        self.received().saturating_sub(self.answered())
    }
}

/// UDP front end for the query protocol.
pub struct QueryServer {
    dispatcher: Arc<QueryDispatcher>,
    stats: Arc<QueryStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueryServer {
    pub fn new(dispatcher: Arc<QueryDispatcher>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            dispatcher,
            stats: Arc::new(QueryStats::default()),
            shutdown_tx,
        }
    }

    /// Bind a socket for [`QueryServer::serve`].
    pub async fn bind(addr: SocketAddr) -> Result<UdpSocket, QueryServerError> {
        UdpSocket::bind(addr)
            .await
            .map_err(|source| QueryServerError::BindFailed { addr, source })
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn run(&self, addr: SocketAddr) -> Result<(), QueryServerError> {
        let socket = Self::bind(addr).await?;
        self.serve(socket).await
    }

    /// Serve on an already-bound socket until shutdown.
    #[instrument(skip(self, socket))]
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), QueryServerError> {
        let local_addr = socket.local_addr()?;
        info!("Query server listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            self.stats.received.fetch_add(1, Ordering::Relaxed);
                            if let Some(reply) = self.dispatcher.handle(&buf[..len], from) {
                                match socket.send_to(&reply, from).await {
                                    Ok(_) => {
                                        self.stats.answered.fetch_add(1, Ordering::Relaxed);
                                    }
                                    Err(e) => debug!("Reply to {} failed: {}", from, e),
                                }
                            }
                        }
                        // ICMP port-unreachable from an earlier reply surfaces here on some platforms.
                        Err(e) => warn!("Receive error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!(
            received = self.stats.received(),
            answered = self.stats.answered(),
            "Query server stopped"
        );
        Ok(())
    }

    /// Stop serving.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> &Arc<QueryStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessValidator, ChallengeCodec};
    use crate::protocol::request::encode_challenge_request;
    use crate::protocol::{decode_response, QueryRequest, QueryType};
    use crate::provider::{LocalServer, ServerIdentity};
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn server() -> Arc<QueryServer> {
        let local = LocalServer::new(ServerIdentity {
            name: "Test Server".to_string(),
            ..Default::default()
        });
        local.player_joined(Uuid::new_v4(), "alice");
        let dispatcher = QueryDispatcher::new(
            ChallengeCodec::random().unwrap(),
            AccessValidator::default(),
            Arc::new(local),
        );
        Arc::new(QueryServer::new(Arc::new(dispatcher)))
    }

    async fn exchange(client: &UdpSocket, request: &[u8]) -> Vec<u8> {
        client.send(request).await.unwrap();
        let mut buf = [0u8; 2048];
        let len = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..len].to_vec()
    }

    #[tokio::test]
    async fn test_challenge_round_trip() {
        let server = server();
        let socket = QueryServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn({
            let server = server.clone();
            async move { server.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        let challenge = exchange(&client, &encode_challenge_request()).await;
        assert_eq!(challenge.len(), 48);
        let mut token = [0u8; 32];
        token.copy_from_slice(&challenge[9..41]);

        let reply = exchange(&client, &QueryRequest::new(QueryType::Basic, token, 77).encode()).await;
        let decoded = decode_response(&reply).unwrap();
        assert_eq!(decoded.request_id, 77);
        let info = decoded.server_info.unwrap();
        assert_eq!(info.name, "Test Server");
        assert_eq!(info.player_count, 1);

        // Unanswered garbage still counts as received.
        client.send(b"nonsense").await.unwrap();
        let probe = exchange(&client, &encode_challenge_request()).await;
        assert_eq!(probe.len(), 48);

        server.shutdown();
        timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.stats().received(), 4);
        assert_eq!(server.stats().answered(), 3);
        assert_eq!(server.stats().dropped(), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let socket = QueryServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let err = QueryServer::bind(addr).await.unwrap_err();
        assert!(matches!(err, QueryServerError::BindFailed { .. }));
    }
}
