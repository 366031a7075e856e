//! Modbus TCP listener: accept loop plus per-connection framed readers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::protocol::mbap::{MbapHeader, HEADER_LEN};
use crate::shutdown::{self, ShutdownRx};
use crate::slave::SlaveEngine;

/// A running Modbus TCP slave endpoint. Dropping the handle does not stop
/// the server; call [`TcpSlaveServer::stop`] (or signal the shutdown
/// channel it was started with) and await it.
pub struct TcpSlaveServer {
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl TcpSlaveServer {
    /// Bind and start accepting connections. The accept loop and every
    /// connection worker observe `shutdown`.
    pub async fn bind(
        address: &str,
        engine: Arc<SlaveEngine>,
        shutdown: ShutdownRx,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let accept_task = tokio::spawn(accept_loop(listener, engine, shutdown));
        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop (and its connection workers) to finish.
    /// Returns once the shutdown signal has been observed everywhere.
    pub async fn stop(self) {
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(listener: TcpListener, engine: Arc<SlaveEngine>, mut shutdown: ShutdownRx) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if shutdown::is_shutdown(&shutdown) {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted modbus tcp connection");
                        connections.spawn(handle_connection(
                            stream,
                            engine.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        // Accept errors during shutdown are expected; any
                        // other transient failure just keeps the loop going.
                        debug!("accept error: {}", e);
                    }
                }
            }
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(mut stream: TcpStream, engine: Arc<SlaveEngine>, mut shutdown: ShutdownRx) {
    let mut header = [0u8; HEADER_LEN];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if shutdown::is_shutdown(&shutdown) {
                    return;
                }
            }
            read = stream.read_exact(&mut header) => {
                if read.is_err() {
                    return;
                }
                let request = MbapHeader::parse(&header);
                let pdu_len = request.pdu_len();
                if pdu_len == 0 {
                    continue;
                }
                let mut pdu = vec![0u8; pdu_len];
                if stream.read_exact(&mut pdu).await.is_err() {
                    return;
                }

                let response = engine.handle_pdu(&pdu);
                let response_header = request.response(response.len());

                let mut frame = Vec::with_capacity(HEADER_LEN + response.len());
                frame.extend_from_slice(&response_header.encode());
                frame.extend_from_slice(&response);
                if stream.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}
