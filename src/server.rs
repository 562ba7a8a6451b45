// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Accept loop, reverse/repeater outbound dialing, and the session registry.
//!
//! `VncServer` is the host-facing handle described in the embedder API: the
//! embedder constructs one, feeds it pixels and input forwarding, and the
//! server spawns one task per client session, each bound to the shared
//! [`Framebuffer`] and an `mpsc` channel that funnels [`ServerEvent`]s back
//! out. `VncServer` is cheap to clone — every field is an `Arc` or a plain
//! `Clone` type — so the accept loop and the embedder's own task can each
//! hold a copy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};

use crate::client::{ClientEvent, VncClient};
use crate::error::{Result, VncError};
use crate::events::ServerEvent;
use crate::framebuffer::{DirtyRegion, Framebuffer};
use crate::protocol::RfbVersion;
use crate::repeater;

/// Configuration recognized at server start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on. `0` selects an OS-assigned port.
    pub port: u16,
    /// Interface address to bind. Empty binds all interfaces.
    pub interface: String,
    /// Desktop name sent to clients in `ServerInit`.
    pub desktop_name: String,
    /// VNC password. `None`/empty disables `VncAuth` and offers security
    /// type `None` only.
    pub password: Option<String>,
    /// Maximum number of concurrent clients. `None` is unlimited.
    pub max_clients: Option<usize>,
    /// Highest RFB version this server advertises at `AwaitVersion`.
    /// A handshake negotiates down to the client's own version when it
    /// reports an older one.
    pub protocol_version: RfbVersion,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            interface: String::new(),
            desktop_name: "rustvncserver".to_string(),
            password: None,
            max_clients: None,
            protocol_version: RfbVersion::default(),
        }
    }
}

/// Maximum time a session may spend in the version/security/init handshake
/// before the server gives up and closes the connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound listening socket's opaque handle, returned by `start`. `VncServer`
/// itself plays this role (see module docs), so this type exists only to
/// give callers a `start(..) -> handle` / `stop(handle)` naming to hold onto
/// — it is a transparent alias callers can ignore in favor of calling
/// methods on `VncServer` directly.
pub type ServerHandle = VncServer;

/// Manages the RFB server's listener, outbound reverse/repeater dials, and
/// the registry of active client sessions.
#[derive(Clone)]
pub struct VncServer {
    framebuffer: Framebuffer,
    interface: String,
    protocol_version: RfbVersion,
    desktop_name: Arc<StdMutex<String>>,
    password: Arc<StdMutex<Option<String>>>,
    max_clients: Option<usize>,
    clients: Arc<RwLock<Vec<Arc<VncClient>>>>,
    next_client_id: Arc<AtomicUsize>,
    cut_text_tx: broadcast::Sender<String>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: Arc<StdMutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>>,
    running: Arc<AtomicBool>,
    listener_shutdown: Arc<Notify>,
}

impl VncServer {
    /// Creates a server with the given framebuffer dimensions and default
    /// configuration (no password, unlimited clients, desktop name
    /// "rustvncserver").
    #[must_use]
    pub fn new(width: u16, height: u16) -> Self {
        Self::with_config(Framebuffer::new(width, height), ServerConfig::default())
    }

    /// Creates a server from an explicit [`ServerConfig`] and framebuffer.
    #[must_use]
    pub fn with_config(framebuffer: Framebuffer, config: ServerConfig) -> Self {
        let (cut_text_tx, _) = broadcast::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            framebuffer,
            interface: config.interface,
            protocol_version: config.protocol_version,
            desktop_name: Arc::new(StdMutex::new(config.desktop_name)),
            password: Arc::new(StdMutex::new(config.password)),
            max_clients: config.max_clients,
            clients: Arc::new(RwLock::new(Vec::new())),
            next_client_id: Arc::new(AtomicUsize::new(1)),
            cut_text_tx,
            event_tx,
            event_rx: Arc::new(StdMutex::new(Some(event_rx))),
            running: Arc::new(AtomicBool::new(false)),
            listener_shutdown: Arc::new(Notify::new()),
        }
    }

    /// Takes ownership of the channel that carries [`ServerEvent`]s to the
    /// embedder. Returns `None` if already taken (by this or a cloned
    /// handle — the channel has exactly one consumer).
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    /// Sets or clears the VNC password. An empty or `None` password
    /// disables `VncAuth` for all subsequently accepted connections.
    pub fn set_password(&self, password: Option<String>) {
        let password = password.filter(|p| !p.is_empty());
        *self.password.lock().unwrap() = password;
    }

    /// Returns `true` once `listen` has bound its socket and is accepting
    /// connections.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Writes a rectangle of canonical RGBA32 pixels into the framebuffer
    /// and marks it dirty for every session, in the background. `data` must
    /// be exactly `w * h * 4` bytes; a mismatched length is logged and
    /// dropped rather than panicking the caller, since this is commonly
    /// invoked from a capture callback that cannot itself be async.
    pub fn update_framebuffer(&self, data: &[u8], x: u16, y: u16, w: u16, h: u16) {
        let framebuffer = self.framebuffer.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            if let Err(e) = framebuffer.write_rect(&data, x, y, w, h).await {
                error!("update_framebuffer failed: {e}");
            }
        });
    }

    /// Resizes the framebuffer in place and resets every active session's
    /// persistent compression streams, since their dictionaries no longer
    /// describe a valid pixel stream shape.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::ResizeFailure`] if `width` or `height` is zero.
    pub async fn new_framebuffer(&self, width: u16, height: u16) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(VncError::ResizeFailure(
                "framebuffer dimensions must be non-zero".to_string(),
            ));
        }

        self.framebuffer.resize(width, height).await;

        let clients = self.clients.read().await;
        for client in clients.iter() {
            client.reset_compression_streams().await;
        }

        Ok(())
    }

    /// Schedules a CopyRect for every active session: applies the copy to
    /// the framebuffer immediately, then queues a CopyRect record per
    /// client so it is emitted ahead of that client's next batch of
    /// dirty-region updates.
    pub async fn schedule_copy_rect(&self, region: DirtyRegion, dx: i16, dy: i16) {
        let dst_x = (region.x as i32 + dx as i32).max(0) as u16;
        let dst_y = (region.y as i32 + dy as i32).max(0) as u16;

        if let Err(e) = self.framebuffer.copy_region(region, dst_x, dst_y).await {
            warn!("schedule_copy_rect: framebuffer copy failed: {e}");
            return;
        }

        let dest_region = DirtyRegion::new(dst_x, dst_y, region.width, region.height);
        let clients = self.clients.read().await;
        for client in clients.iter() {
            client.schedule_copy_region(dest_region, dx, dy).await;
        }
    }

    /// Broadcasts clipboard text to every connected client via
    /// `ServerCutText`.
    pub fn broadcast_cut_text(&self, text: String) {
        // No receivers yet (no clients connected) is not an error.
        let _ = self.cut_text_tx.send(text);
    }

    /// Binds `port` on the configured interface and accepts connections
    /// until `stop` is called. Each accepted connection is handed the
    /// standard server-initiated handshake on its own task.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Io`] if the bind fails.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let bind_addr = if self.interface.is_empty() {
            format!("0.0.0.0:{port}")
        } else {
            format!("{}:{port}", self.interface)
        };

        let listener = TcpListener::bind(&bind_addr).await?;
        info!("VNC server listening on {bind_addr}");
        self.running.store(true, Ordering::Release);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept failed: {e}");
                            continue;
                        }
                    };

                    if let Some(max) = self.max_clients {
                        if self.clients.read().await.len() >= max {
                            warn!("rejecting connection from {addr}: max_clients ({max}) reached");
                            drop(stream);
                            continue;
                        }
                    }

                    // Handshake failures are already reported via `ServerEvent::ClientDisconnected`
                    // inside spawn_session; an inbound accept loop has no caller to propagate to.
                    let _ = self.spawn_session(stream, Some(addr), None, None).await;
                }

                () = self.listener_shutdown.notified() => {
                    self.running.store(false, Ordering::Release);
                    info!("VNC server stopping accept loop");
                    return Ok(());
                }
            }
        }
    }

    /// Signals the accept loop to stop and asks every active session to
    /// close. Each session completes any in-flight write before dropping;
    /// sessions that don't respond within the timeout are abandoned rather
    /// than awaited indefinitely.
    pub async fn stop(&self) {
        self.listener_shutdown.notify_one();

        let clients = self.clients.read().await;
        for client in clients.iter() {
            client.get_shutdown_handle().notify_one();
        }
        drop(clients);

        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    /// Dials a listening viewer and runs the standard server-initiated
    /// handshake as if the viewer had dialled in.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Io`] if the dial fails, or the handshake's own
    /// error (`HandshakeTimeout`, `Unsupported`, `AuthenticationFailed`, or
    /// `Io`) if the handshake itself fails.
    pub async fn connect_reverse(&self, host: &str, port: u16) -> Result<usize> {
        let stream = repeater::dial_reverse(host, port).await?;
        self.spawn_session(stream, None, Some((host.to_string(), port)), None).await
    }

    /// Dials a repeater, writes the 250-byte NUL-padded ASCII id string,
    /// then proceeds with the standard handshake.
    ///
    /// # Errors
    ///
    /// Returns [`VncError::Io`] if the dial or id write fails, or the
    /// handshake's own error (`HandshakeTimeout`, `Unsupported`,
    /// `AuthenticationFailed`, or `Io`) if the handshake itself fails.
    pub async fn connect_repeater(&self, host: &str, port: u16, id: &str) -> Result<usize> {
        let stream = repeater::dial_repeater(host, port, id).await?;
        self.spawn_session(stream, None, Some((host.to_string(), port)), Some(id.to_string()))
            .await
    }

    /// Completes the handshake on `stream`, registers the new session's
    /// dirty-region handle with the framebuffer, and spawns its message
    /// loop. Returns the assigned client id, or the handshake's error if it
    /// never reached `Running`.
    async fn spawn_session(
        &self,
        stream: TcpStream,
        peer_addr: Option<SocketAddr>,
        repeater_dial: Option<(String, u16)>,
        repeater_id: Option<String>,
    ) -> Result<usize> {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let desktop_name = self.desktop_name.lock().unwrap().clone();
        let password = self.password.lock().unwrap().clone();
        let (client_event_tx, client_event_rx) = mpsc::unbounded_channel();
        let cut_text_rx = self.cut_text_tx.subscribe();
        let framebuffer = self.framebuffer.clone();

        let resolved_addr = peer_addr.or_else(|| stream.peer_addr().ok());
        let address = resolved_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            VncClient::new(
                client_id,
                stream,
                framebuffer.clone(),
                desktop_name,
                password,
                client_event_tx,
                cut_text_rx,
                self.protocol_version,
            ),
        )
        .await;

        let client = match handshake {
            Ok(Ok(mut client)) => {
                let dest_port = repeater_dial.map(|(_, port)| port);
                match repeater_id {
                    Some(id) => client.set_repeater_metadata(id, dest_port),
                    None => client.set_connection_metadata(dest_port),
                }
                Arc::new(client)
            }
            Ok(Err(e)) => {
                warn!("handshake with {address} failed: {e}");
                let _ = self
                    .event_tx
                    .send(ServerEvent::ClientDisconnected { id: client_id, reason: e.to_string() });
                return Err(e);
            }
            Err(_) => {
                warn!("handshake with {address} timed out");
                let _ = self.event_tx.send(ServerEvent::ClientDisconnected {
                    id: client_id,
                    reason: VncError::HandshakeTimeout.to_string(),
                });
                return Err(VncError::HandshakeTimeout);
            }
        };

        framebuffer.register_client(client.get_receiver_handle()).await;
        self.clients.write().await.push(client.clone());

        let _ = self.event_tx.send(ServerEvent::ClientConnected {
            id: client_id,
            address: resolved_addr.unwrap_or_else(|| ([0, 0, 0, 0], 0).into()),
        });

        self.spawn_event_forwarder(client_id, client_event_rx);
        self.spawn_message_loop(client);

        Ok(client_id)
    }

    /// Relays per-client input/clipboard events onto the server-wide
    /// `ServerEvent` channel, tagging them with `client_id`.
    fn spawn_event_forwarder(&self, client_id: usize, mut client_event_rx: mpsc::UnboundedReceiver<ClientEvent>) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = client_event_rx.recv().await {
                let forwarded = match event {
                    ClientEvent::KeyPress { down, key } => {
                        Some(ServerEvent::KeyEvent { client_id, key, pressed: down })
                    }
                    ClientEvent::PointerMove { x, y, button_mask } => {
                        Some(ServerEvent::PointerEvent { client_id, x, y, button_mask })
                    }
                    ClientEvent::CutText { text } => {
                        Some(ServerEvent::ClipboardReceived { client_id, text })
                    }
                    ClientEvent::Disconnected => None,
                };
                if let Some(event) = forwarded {
                    let _ = event_tx.send(event);
                }
            }
        });
    }

    /// Runs the session's message loop to completion, then unregisters it
    /// from the framebuffer and registry and emits `ClientDisconnected`.
    fn spawn_message_loop(&self, client: Arc<VncClient>) {
        let clients = self.clients.clone();
        let framebuffer = self.framebuffer.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let client_id = client.get_client_id();
            let result = client.handle_messages().await;

            framebuffer.unregister_client(&client.get_receiver_handle()).await;
            clients.write().await.retain(|c| c.get_client_id() != client_id);

            let reason = match result {
                Ok(()) => "client closed connection".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = event_tx.send(ServerEvent::ClientDisconnected { id: client_id, reason });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn new_server_is_not_active_until_listen() {
        let server = VncServer::new(640, 480);
        assert!(!server.is_active());
    }

    #[tokio::test]
    async fn set_password_empty_string_disables_auth() {
        let server = VncServer::new(64, 64);
        server.set_password(Some(String::new()));
        assert!(server.password.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn listen_binds_and_becomes_active() {
        let server = VncServer::new(8, 8);
        let server_task = server.clone();
        tokio::spawn(async move {
            let _ = server_task.listen(0).await;
        });

        for _ in 0..50 {
            if server.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.is_active());

        server.stop().await;
    }

    #[tokio::test]
    async fn connect_reverse_completes_none_auth_handshake() {
        let server = VncServer::new(16, 16);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client_id = server.connect_reverse(&addr.ip().to_string(), addr.port()).await.unwrap();
        assert_eq!(client_id, 1);

        let mut viewer_stream = accept_task.await.unwrap();
        let mut version = [0u8; 12];
        viewer_stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.008\n");
        viewer_stream.write_all(b"RFB 003.008\n").await.unwrap();

        let mut sec_types = [0u8; 2];
        viewer_stream.read_exact(&mut sec_types).await.unwrap();
        assert_eq!(sec_types, [1, 1]); // one type offered: None
        viewer_stream.write_all(&[1]).await.unwrap(); // choose None

        let mut sec_result = [0u8; 4];
        viewer_stream.read_exact(&mut sec_result).await.unwrap();
        assert_eq!(sec_result, [0, 0, 0, 0]);

        viewer_stream.write_all(&[1]).await.unwrap(); // ClientInit: shared

        let mut server_init_head = [0u8; 4];
        viewer_stream.read_exact(&mut server_init_head).await.unwrap();
        assert_eq!(u16::from_be_bytes([server_init_head[0], server_init_head[1]]), 16);
        assert_eq!(u16::from_be_bytes([server_init_head[2], server_init_head[3]]), 16);
    }

    #[tokio::test]
    async fn connect_reverse_honors_configured_protocol_version() {
        let config = ServerConfig { protocol_version: RfbVersion::V3_3, ..ServerConfig::default() };
        let server = VncServer::with_config(Framebuffer::new(16, 16), config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client_id = server.connect_reverse(&addr.ip().to_string(), addr.port()).await.unwrap();
        assert_eq!(client_id, 1);

        let mut viewer_stream = accept_task.await.unwrap();
        let mut version = [0u8; 12];
        viewer_stream.read_exact(&mut version).await.unwrap();
        assert_eq!(&version, b"RFB 003.003\n");
        viewer_stream.write_all(b"RFB 003.003\n").await.unwrap();

        // 3.3: a bare 4-byte security type, no count/list.
        let mut sec_type = [0u8; 4];
        viewer_stream.read_exact(&mut sec_type).await.unwrap();
        assert_eq!(u32::from_be_bytes(sec_type), 1); // SECURITY_TYPE_NONE
    }

    #[tokio::test]
    async fn connect_reverse_propagates_handshake_failure() {
        let server = VncServer::new(16, 16);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut version = [0u8; 12];
            stream.read_exact(&mut version).await.unwrap();
            stream.write_all(b"RFB 002.000\n").await.unwrap();
        });

        let err = server
            .connect_reverse(&addr.ip().to_string(), addr.port())
            .await
            .unwrap_err();
        assert!(matches!(err, VncError::Unsupported(_)));
        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_cut_text_with_no_clients_does_not_error() {
        let server = VncServer::new(4, 4);
        server.broadcast_cut_text("hello".to_string());
    }

    #[tokio::test]
    async fn new_framebuffer_rejects_zero_dimensions() {
        let server = VncServer::new(4, 4);
        let err = server.new_framebuffer(0, 10).await.unwrap_err();
        assert!(matches!(err, VncError::ResizeFailure(_)));
    }

    #[tokio::test]
    async fn take_event_receiver_is_single_consumer() {
        let server = VncServer::new(4, 4);
        assert!(server.take_event_receiver().is_some());
        assert!(server.take_event_receiver().is_none());
        // A clone shares the same underlying Option.
        let server2 = VncServer::new(4, 4);
        let clone = server2.clone();
        assert!(server2.take_event_receiver().is_some());
        assert!(clone.take_event_receiver().is_none());
    }
}
