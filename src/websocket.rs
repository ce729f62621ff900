//! # WebSocket Transport
//!
//! Each audio connection is an actix actor. The actor only does I/O: text frames
//! are classified and answered inline, binary frames are queued on the worker
//! pool, and everything the workers produce comes back through the
//! [`ConnectionHub`] as [`OutboundText`] messages.
//!
//! ## Connection Lifecycle:
//! 1. **Upgrade**: `GET /` or `GET /ws`; the actor gets a fresh [`ConnectionId`]
//! 2. **Open**: recognizer construction runs on the blocking pool, never on the
//!    arbiter; the peer receives `ready` once it finishes. Text frames received
//!    meanwhile are held by the gateway and replayed after `ready`; audio is dropped
//! 3. **Stream**: one binary frame per audio chunk, plus `metadata`/`ping` text
//! 4. **Close**: the hub forgets the connection, then the session is closed once
//!    the open step has finished, so an early disconnect cannot leave an orphan
//!
//! ## Keepalive:
//! The server pings every 30 seconds and drops peers silent for 60 seconds.

use crate::error::SendError;
use crate::relay::{Gateway, Transport};
use crate::session::ConnectionId;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::rt::task::{self, JoinHandle};
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest accepted frame; audio chunks are normally a few KiB.
const MAX_FRAME_SIZE: usize = 1 << 20;

/// A text frame to push to one connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct OutboundText(pub String);

/// Live connections, addressable from any thread.
#[derive(Default)]
pub struct ConnectionHub {
    peers: RwLock<HashMap<ConnectionId, Recipient<OutboundText>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, connection: ConnectionId, recipient: Recipient<OutboundText>) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection, recipient);
    }

    /// Forget a connection. Returns whether it was attached.
    pub fn detach(&self, connection: ConnectionId) -> bool {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Transport for ConnectionHub {
    fn send_text(&self, connection: ConnectionId, text: String) -> Result<(), SendError> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        match peers.get(&connection) {
            Some(recipient) if recipient.connected() => {
                recipient.do_send(OutboundText(text));
                Ok(())
            }
            _ => Err(SendError::Disconnected(connection.get())),
        }
    }
}

/// Actor behind one audio WebSocket.
pub struct AsrSocket {
    connection: ConnectionId,
    gateway: Arc<Gateway>,
    hub: Arc<ConnectionHub>,
    heartbeat: Instant,
    opening: Option<JoinHandle<()>>,
}

impl AsrSocket {
    pub fn new(connection: ConnectionId, gateway: Arc<Gateway>, hub: Arc<ConnectionHub>) -> Self {
        Self {
            connection,
            gateway,
            hub,
            heartbeat: Instant::now(),
            opening: None,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                warn!(connection = %act.connection, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for AsrSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(connection = %self.connection, "WebSocket connection started");
        self.hub.attach(self.connection, ctx.address().recipient());
        self.start_heartbeat(ctx);

        // Registered before any frame is handled, so early control text is held.
        self.gateway.begin_open(self.connection);
        let gateway = Arc::clone(&self.gateway);
        let connection = self.connection;
        self.opening = Some(task::spawn_blocking(move || {
            if let Err(err) = gateway.open_session(connection) {
                error!(connection = %connection, error = %err, "Session could not be opened");
            }
        }));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.hub.detach(self.connection);

        let gateway = Arc::clone(&self.gateway);
        let connection = self.connection;
        let opening = self.opening.take();
        actix_web::rt::spawn(async move {
            if let Some(opening) = opening {
                if let Err(err) = opening.await {
                    error!(connection = %connection, error = %err, "Session open task failed");
                }
            }
            let closing = task::spawn_blocking(move || gateway.close_session(connection));
            if let Err(err) = closing.await {
                error!(connection = %connection, error = %err, "Session close task failed");
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AsrSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.heartbeat = Instant::now();
                self.gateway.handle_audio(self.connection, data);
            }
            Ok(ws::Message::Text(text)) => {
                self.heartbeat = Instant::now();
                self.gateway.handle_text(self.connection, &text);
            }
            Ok(ws::Message::Ping(data)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.connection, reason = ?reason, "WebSocket close requested by peer");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.connection, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection = %self.connection, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundText> for AsrSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// Upgrade an HTTP request to an audio WebSocket.
pub async fn audio_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let connection = ConnectionId::next();
    debug!(
        connection = %connection,
        peer = ?req.connection_info().peer_addr(),
        "WebSocket upgrade requested"
    );

    let socket = AsrSocket::new(
        connection,
        Arc::clone(&state.gateway),
        Arc::clone(&state.hub),
    );
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collector(Arc<Mutex<Vec<String>>>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<OutboundText> for Collector {
        type Result = ();

        fn handle(&mut self, msg: OutboundText, _ctx: &mut Self::Context) {
            self.0.lock().unwrap().push(msg.0);
        }
    }

    #[actix_web::test]
    async fn test_hub_delivers_to_attached_connection() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector(Arc::clone(&seen)).start();
        let hub = ConnectionHub::new();
        let conn = ConnectionId::next();
        hub.attach(conn, addr.recipient());

        hub.send_text(conn, "hello".into()).unwrap();
        actix_web::rt::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(hub.len(), 1);
    }

    #[actix_web::test]
    async fn test_hub_rejects_detached_connection() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector(Arc::clone(&seen)).start();
        let hub = ConnectionHub::new();
        let conn = ConnectionId::next();
        hub.attach(conn, addr.recipient());

        assert!(hub.detach(conn));
        assert!(!hub.detach(conn));
        assert_eq!(
            hub.send_text(conn, "late".into()),
            Err(SendError::Disconnected(conn.get()))
        );
    }

    #[test]
    fn test_unknown_connection_is_disconnected() {
        let hub = ConnectionHub::new();
        let conn = ConnectionId::next();
        assert_eq!(
            hub.send_text(conn, "{}".into()),
            Err(SendError::Disconnected(conn.get()))
        );
    }
}
