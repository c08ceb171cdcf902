//! TCP listener for accepting client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::backend::Backend;
use crate::server::session::Session;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Name reported to clients at login.
    pub server_name: String,
    /// Base URL for channel logos, empty disables them.
    pub picons_url: String,
    /// Tuner acquisition timeout handed to live streams.
    pub stream_timeout_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 34892)),
            server_name: "pvrd".to_string(),
            picons_url: String::new(),
            stream_timeout_secs: 3,
        }
    }
}

/// The main server that listens for connections and spawns sessions.
pub struct Server {
    config: Arc<ServerConfig>,
    backend: Backend,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig, backend: Backend) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            backend,
            shutdown_tx,
        }
    }

    /// Broadcast a shutdown signal to all running sessions.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the server, accepting connections until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        info!("Server listening on {}", self.config.listen_addr);

        let mut connection_count = 0u64;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            connection_count += 1;
                            let session_id = connection_count;

                            info!("[Session {}] New connection from {}", session_id, addr);

                            let backend = self.backend.clone();
                            let config = Arc::clone(&self.config);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    socket,
                                    addr,
                                    session_id,
                                    backend,
                                    config,
                                    shutdown_rx,
                                )
                                .await
                                {
                                    error!("[Session {}] Connection error: {}", session_id, e);
                                }
                                info!("[Session {}] Connection closed", session_id);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = wait_for_shutdown(self.shutdown_tx.subscribe()) => {
                    info!("Listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn wait_for_shutdown(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

/// Handle a single client connection.
async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    session_id: u64,
    backend: Backend,
    config: Arc<ServerConfig>,
    shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    // Disable Nagle's algorithm for lower latency
    socket.set_nodelay(true)?;

    let mut session = Session::new(session_id, addr, socket, backend, config, shutdown_rx);
    session.run().await
}
