//! Client session handling.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use pvrd_protocol::{decode_header, opcode, packet_from_frame, Packet, HEADER_SIZE};

use crate::backend::Backend;
use crate::server::dispatch::{self, Outcome};
use crate::server::filter::{FilterSettings, GroupCatalogs};
use crate::server::listener::ServerConfig;
use crate::server::playback::Playback;
use crate::server::status;
use crate::server::streaming::LiveStream;

/// Session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for login.
    Connected,
    /// Login accepted, ready for any opcode.
    LoggedIn,
    /// Session is tearing down.
    Closing,
}

/// FIFO of packets awaiting transmission. Producers on other tasks
/// (status forwarder, stream delivery) only ever append here; the
/// session task is the sole consumer.
#[derive(Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Packet>>,
}

impl OutboundQueue {
    pub fn push(&self, packet: Packet) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(packet);
    }

    pub fn pop(&self) -> Option<Packet> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Put a packet back at the head after a failed send.
    pub fn requeue_front(&self, packet: Packet) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(packet);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Session state shared with off-task producers. The outbound queue
/// and the live-streamer slot sit behind independent locks so queueing
/// a packet never contends with a retune.
pub struct SessionShared {
    pub id: u64,
    pub queue: OutboundQueue,
    pub filter: Mutex<FilterSettings>,
    pub streamer: Mutex<Option<LiveStream>>,
    status_enabled: AtomicBool,
    version: AtomicU16,
    compression: AtomicU8,
    channel_count: AtomicU32,
    lang_stream_type: AtomicU8,
}

impl SessionShared {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            queue: OutboundQueue::default(),
            filter: Mutex::new(FilterSettings::default()),
            streamer: Mutex::new(None),
            status_enabled: AtomicBool::new(false),
            version: AtomicU16::new(0),
            compression: AtomicU8::new(0),
            channel_count: AtomicU32::new(0),
            lang_stream_type: AtomicU8::new(0),
        }
    }

    pub fn version(&self) -> u16 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn set_version(&self, v: u16) {
        self.version.store(v, Ordering::SeqCst);
    }

    pub fn compression(&self) -> u8 {
        self.compression.load(Ordering::SeqCst)
    }

    pub fn set_compression(&self, level: u8) {
        self.compression.store(level.min(9), Ordering::SeqCst);
    }

    pub fn status_enabled(&self) -> bool {
        self.status_enabled.load(Ordering::SeqCst)
    }

    pub fn set_status_enabled(&self, on: bool) {
        self.status_enabled.store(on, Ordering::SeqCst);
    }

    pub fn channel_count(&self) -> u32 {
        self.channel_count.load(Ordering::SeqCst)
    }

    pub fn set_channel_count(&self, count: u32) {
        self.channel_count.store(count, Ordering::SeqCst);
    }

    pub fn lang_stream_type(&self) -> u8 {
        self.lang_stream_type.load(Ordering::SeqCst)
    }

    pub fn set_lang_stream_type(&self, t: u8) {
        self.lang_stream_type.store(t, Ordering::SeqCst);
    }

    /// Tear down the live streamer, if any. Safe to call repeatedly.
    pub fn close_streamer(&self) {
        let mut slot = self.streamer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.take().is_some() {
            info!("[Session {}] live stream closed", self.id);
        }
    }
}

/// A client session.
pub struct Session {
    id: u64,
    #[allow(dead_code)]
    addr: SocketAddr,
    socket: TcpStream,
    read_buf: BytesMut,
    state: SessionState,
    backend: Backend,
    config: Arc<ServerConfig>,
    shared: Arc<SessionShared>,
    /// Open recording playback, at most one.
    playback: Option<Playback>,
    /// Group catalogs from the last groups-count request.
    groups: GroupCatalogs,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Session {
    pub fn new(
        id: u64,
        addr: SocketAddr,
        socket: TcpStream,
        backend: Backend,
        config: Arc<ServerConfig>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            addr,
            socket,
            read_buf: BytesMut::with_capacity(65536),
            state: SessionState::Connected,
            backend,
            config,
            shared: Arc::new(SessionShared::new(id)),
            playback: None,
            groups: GroupCatalogs::default(),
            shutdown_rx,
        }
    }

    /// Run the session until the peer disconnects, a protocol error
    /// occurs or the server shuts down.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let forwarder = status::spawn_forwarder(
            self.backend.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.config),
        );

        loop {
            if let Err(e) = self.flush_queue().await {
                debug!("[Session {}] send failed: {}", self.id, e);
                break;
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("[Session {}] server shutdown", self.id);
                    break;
                }
                result = tokio::time::timeout(
                    Duration::from_secs(1),
                    Self::read_packet(&mut self.socket, &mut self.read_buf, self.id),
                ) => {
                    match result {
                        // idle tick: a running scan is the only polled push
                        Err(_) => {
                            if self.backend.scanner.is_scanning() {
                                status::queue_scan_status(&self.backend, &self.shared);
                            }
                        }
                        Ok(Ok(Some(req))) => {
                            if !self.process(req) {
                                break;
                            }
                        }
                        Ok(Ok(None)) => {
                            info!("[Session {}] peer closed connection", self.id);
                            break;
                        }
                        Ok(Err(e)) => {
                            error!("[Session {}] read error: {}", self.id, e);
                            break;
                        }
                    }
                }
            }
        }

        forwarder.abort();
        self.cleanup().await;
        Ok(())
    }

    /// Dispatch one request; false ends the session.
    fn process(&mut self, mut req: Packet) -> bool {
        if self.state == SessionState::Connected && req.opcode != opcode::LOGIN {
            warn!(
                "[Session {}] opcode {} before login, closing connection",
                self.id, req.opcode
            );
            return false;
        }

        let mut ctx = dispatch::HandlerContext {
            backend: &self.backend,
            shared: &self.shared,
            config: &self.config,
            playback: &mut self.playback,
            groups: &mut self.groups,
            state: &mut self.state,
        };

        match dispatch::handle(&mut ctx, &mut req) {
            Outcome::Reply(resp) => {
                self.shared.queue.push(resp);
                true
            }
            Outcome::None => true,
            Outcome::Close => false,
        }
    }

    /// Drain the outbound queue in FIFO order. A failed send puts the
    /// packet back at the head and surfaces the error.
    async fn flush_queue(&mut self) -> std::io::Result<()> {
        while let Some(packet) = self.shared.queue.pop() {
            let frame = packet.frame();
            if let Err(e) = self.socket.write_all(&frame).await {
                self.shared.queue.requeue_front(packet);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Read bytes until one complete frame is decoded. `None` on a
    /// clean peer close; partial frames stay in the buffer across
    /// calls, so cancelling the read never loses data.
    async fn read_packet(
        socket: &mut TcpStream,
        read_buf: &mut BytesMut,
        session_id: u64,
    ) -> std::io::Result<Option<Packet>> {
        loop {
            if read_buf.len() >= HEADER_SIZE {
                match decode_header(read_buf) {
                    Ok(Some(header)) => {
                        let total = HEADER_SIZE + header.payload_len as usize;
                        if read_buf.len() >= total {
                            let _ = read_buf.split_to(HEADER_SIZE);
                            let payload = read_buf.split_to(header.payload_len as usize);
                            return match packet_from_frame(&header, &payload) {
                                Ok(packet) => Ok(Some(packet)),
                                Err(e) => {
                                    error!(
                                        "[Session {}] malformed frame: {}",
                                        session_id, e
                                    );
                                    Err(std::io::Error::new(
                                        std::io::ErrorKind::InvalidData,
                                        e.to_string(),
                                    ))
                                }
                            };
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("[Session {}] protocol error: {}", session_id, e);
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            e.to_string(),
                        ));
                    }
                }
            }

            let n = socket.read_buf(read_buf).await?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    async fn cleanup(&mut self) {
        self.state = SessionState::Closing;
        self.shared.close_streamer();
        self.playback = None;
        let _ = self.socket.shutdown().await;
        let undelivered = self.shared.queue.len();
        if undelivered > 0 {
            debug!(
                "[Session {}] dropping {} undelivered packets",
                self.id, undelivered
            );
        }
        self.shared.queue.clear();
        debug!("[Session {}] cleaned up", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvrd_protocol::{PacketClass, StatusCode, PROTOCOL_VERSION};
    use tokio::net::TcpListener;

    use crate::backend::memory;

    #[test]
    fn queue_is_fifo_and_requeue_goes_first() {
        let queue = OutboundQueue::default();
        for op in [1u32, 2, 3] {
            queue.push(Packet::new(op, PacketClass::RequestResponse));
        }

        let first = queue.pop().unwrap();
        assert_eq!(first.opcode, 1);
        queue.requeue_front(first);

        let again = queue.pop().unwrap();
        assert_eq!(again.opcode, 1);
        assert_eq!(queue.pop().unwrap().opcode, 2);
        assert_eq!(queue.pop().unwrap().opcode, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn streamer_close_is_idempotent() {
        let shared = SessionShared::new(1);
        shared.close_streamer();
        shared.close_streamer();
        assert!(shared
            .streamer
            .lock()
            .unwrap()
            .is_none());
    }

    async fn spawn_session() -> (
        TcpStream,
        tokio::task::JoinHandle<()>,
        broadcast::Sender<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, peer) = listener.accept().await.unwrap();

        let backend = memory::build(None, false);
        let config = Arc::new(ServerConfig::default());
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut session = Session::new(1, peer, socket, backend, config, rx);
            let _ = session.run().await;
        });
        (client, handle, tx)
    }

    fn login_frame(version: u16) -> bytes::Bytes {
        let mut req = Packet::new(opcode::LOGIN, PacketClass::RequestResponse);
        req.uid = 1;
        req.version = version;
        req.put_u8(0); // no compression
        req.put_string("test client");
        req.frame()
    }

    #[tokio::test]
    async fn unsupported_login_version_closes_connection() {
        let (mut client, handle, _shutdown_tx) = spawn_session().await;
        client.write_all(&login_frame(3)).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn login_before_anything_else_is_enforced() {
        let (mut client, handle, _shutdown_tx) = spawn_session().await;

        let mut req = Packet::new(opcode::GET_TIME, PacketClass::RequestResponse);
        req.uid = 1;
        req.version = PROTOCOL_VERSION;
        client.write_all(&req.frame()).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn login_reply_carries_clock_and_server_identity() {
        let (mut client, handle, _shutdown_tx) = spawn_session().await;
        client.write_all(&login_frame(5)).await.unwrap();

        let mut buf = BytesMut::new();
        let resp = loop {
            if buf.len() >= HEADER_SIZE {
                if let Some(header) = decode_header(&buf).unwrap() {
                    let total = HEADER_SIZE + header.payload_len as usize;
                    if buf.len() >= total {
                        let _ = buf.split_to(HEADER_SIZE);
                        let payload = buf.split_to(header.payload_len as usize);
                        break packet_from_frame(&header, &payload).unwrap();
                    }
                }
            }
            let n = client.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before login reply");
        };

        let mut resp = resp;
        assert_eq!(resp.opcode, opcode::LOGIN);
        assert_eq!(resp.version, 5);
        assert!(resp.get_u32().unwrap() > 0); // wall clock
        resp.get_s32().unwrap(); // utc offset
        assert!(!resp.get_string().unwrap().is_empty()); // server name
        assert!(!resp.get_string().unwrap().is_empty()); // server version

        // session stays alive for a follow-up request
        let mut req = Packet::new(opcode::ENABLE_STATUS_INTERFACE, PacketClass::RequestResponse);
        req.uid = 2;
        req.version = 5;
        req.put_u8(1);
        client.write_all(&req.frame()).await.unwrap();

        let mut buf = BytesMut::new();
        let mut resp = loop {
            if buf.len() >= HEADER_SIZE {
                if let Some(header) = decode_header(&buf).unwrap() {
                    let total = HEADER_SIZE + header.payload_len as usize;
                    if buf.len() >= total {
                        let _ = buf.split_to(HEADER_SIZE);
                        let payload = buf.split_to(header.payload_len as usize);
                        break packet_from_frame(&header, &payload).unwrap();
                    }
                }
            }
            let n = client.read_buf(&mut buf).await.unwrap();
            assert!(n > 0);
        };
        assert_eq!(resp.opcode, opcode::ENABLE_STATUS_INTERFACE);
        assert_eq!(resp.get_u32().unwrap(), StatusCode::Ok as u32);

        drop(client);
        handle.await.unwrap();
    }
}
