//! WebSocket Game Server
//!
//! The process-level coordinator: accepts connections, authenticates them,
//! routes inbound events, forms matches from the queue, and drives each
//! match's countdown and tick loop. One spawned task per connection, one per
//! match; the matchmaking queue and the match registry are the only state
//! shared across them.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::engine::events::{EngineEvent, EventBus};
use crate::engine::queue::MatchmakingQueue;
use crate::network::auth::{JwtValidator, TokenValidator};
use crate::network::protocol::{ClientMessage, ErrorCode, PlayerBrief, ServerMessage};
use crate::network::session::{
    generate_match_id, MatchPhase, MatchRegistry, MatchSession, ReconnectError,
};
use crate::network::transport::Outbox;

/// How long a finished match's history stays queryable for in-flight
/// reconnects before the session is deregistered.
const ENDED_MATCH_RETENTION: Duration = Duration::from_secs(5);

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Bound identity (after auth or first identifying event).
    player_id: Option<String>,
    /// Display name.
    username: Option<String>,
    /// Identity came from a validated token.
    authenticated: bool,
    /// Connection time.
    #[allow(dead_code)]
    connected_at: Instant,
    /// Outbound handle for this connection.
    outbox: Outbox,
}

type ClientMap = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// The game server.
pub struct GameServer {
    /// Engine configuration.
    config: EngineConfig,
    /// Live matches.
    registry: Arc<MatchRegistry>,
    /// Connected clients.
    clients: ClientMap,
    /// Matchmaking queue.
    queue: Arc<RwLock<MatchmakingQueue>>,
    /// Embedder-facing event surface.
    events: EventBus,
    /// Token validator, present when auth is enabled.
    validator: Option<Arc<dyn TokenValidator>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server with the bundled JWT validator (when auth is on).
    pub fn new(config: EngineConfig) -> Self {
        let validator: Option<Arc<dyn TokenValidator>> = if config.auth.enabled {
            Some(Arc::new(JwtValidator::new(config.auth.clone())))
        } else {
            None
        };
        Self::with_validator(config, validator)
    }

    /// Create a server with a custom token validator.
    pub fn with_validator(
        config: EngineConfig,
        validator: Option<Arc<dyn TokenValidator>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry: Arc::new(MatchRegistry::new()),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            queue: Arc::new(RwLock::new(MatchmakingQueue::new())),
            events: EventBus::new(),
            validator,
            shutdown_tx,
        }
    }

    /// The embedder-facing event surface.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("phalanx listening on {}", self.config.bind_addr);
        info!(
            tick_rate = self.config.tick_rate,
            game_mode = %self.config.game_mode.preset_name(),
            auth = self.config.auth.enabled,
            "engine configured"
        );

        let matchmaking_handle = tokio::spawn(Self::run_matchmaking_loop(
            self.queue.clone(),
            self.registry.clone(),
            self.clients.clone(),
            self.events.clone(),
            self.config.clone(),
            self.shutdown_tx.clone(),
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.end_all_matches("server-shutdown").await;
        matchmaking_handle.abort();

        Ok(())
    }

    /// Signal shutdown to every loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// End a match on the embedder's verdict (reason `completed`).
    pub async fn complete_match(&self, match_id: &str) -> bool {
        let Some(session) = self.registry.get(match_id).await else {
            return false;
        };
        let ended = session.write().await.end("completed");
        if ended {
            self.events.emit(EngineEvent::MatchEnded {
                match_id: match_id.to_string(),
                reason: "completed".into(),
            });
        }
        ended
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active match count.
    pub async fn match_count(&self) -> usize {
        self.registry.count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.queue.read().await.len()
    }

    async fn end_all_matches(&self, reason: &str) {
        for session in self.registry.all().await {
            let (ended, match_id) = {
                let mut s = session.write().await;
                (s.end(reason), s.id.clone())
            };
            if ended {
                self.events.emit(EngineEvent::MatchEnded {
                    match_id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let registry = self.registry.clone();
        let queue = self.queue.clone();
        let events = self.events.clone();
        let config = self.config.clone();
        let validator = self.validator.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let cors = config.cors.clone();
            let check_origin = move |req: &Request, response: Response| {
                let origin = req
                    .headers()
                    .get("origin")
                    .and_then(|v| v.to_str().ok());
                if cors.allows(origin) {
                    Ok(response)
                } else {
                    let mut forbidden = ErrorResponse::new(Some("origin not allowed".into()));
                    *forbidden.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
                    Err(forbidden)
                }
            };

            let ws_stream = match accept_hdr_async(stream, check_origin).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (outbox, mut outbox_rx) = Outbox::channel();

            // Dedicated sender task: the only place socket writes happen.
            let sender_task = tokio::spawn(async move {
                while let Some(message) = outbox_rx.recv().await {
                    let text = match message.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    player_id: None,
                    username: None,
                    authenticated: false,
                    connected_at: Instant::now(),
                    outbox: outbox.clone(),
                });
            }

            // Auth handshake: first frame must be `hello`, within the
            // connection deadline.
            let authenticated = if config.auth.enabled {
                Self::handle_auth_handshake(
                    addr,
                    &mut ws_receiver,
                    &clients,
                    &validator,
                    &config,
                    &outbox,
                )
                .await
            } else {
                true
            };

            if authenticated {
                Self::read_loop(
                    addr,
                    &mut ws_receiver,
                    &clients,
                    &registry,
                    &queue,
                    &events,
                    &outbox,
                    shutdown_rx,
                )
                .await;
            } else {
                // Let the sender task flush the auth-error frame before the
                // connection is torn down.
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            // Make sure the outbox is observably closed before the
            // disconnect bookkeeping runs.
            sender_task.abort();
            let _ = sender_task.await;

            Self::cleanup_connection(addr, &clients, &registry, &queue, &events).await;
            debug!("client {} cleaned up", addr);
        });
    }

    /// Require and process the `hello` handshake. Returns whether the
    /// connection may proceed.
    async fn handle_auth_handshake(
        addr: SocketAddr,
        ws_receiver: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        clients: &ClientMap,
        validator: &Option<Arc<dyn TokenValidator>>,
        config: &EngineConfig,
        outbox: &Outbox,
    ) -> bool {
        let deadline = Duration::from_millis(config.connection_timeout_ms);
        let frame = match tokio::time::timeout(deadline, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(_) => {
                let _ = outbox.emit(ServerMessage::AuthError {
                    message: "expected hello handshake".into(),
                });
                return false;
            }
            Err(_) => {
                debug!("auth handshake timed out for {}", addr);
                let _ = outbox.emit(ServerMessage::AuthError {
                    message: "handshake timeout".into(),
                });
                return false;
            }
        };

        let hello = match ClientMessage::from_json(&frame) {
            Ok(ClientMessage::Hello { auth_token, player_id, username }) => {
                (auth_token, player_id, username)
            }
            _ => {
                let _ = outbox.emit(ServerMessage::AuthError {
                    message: "expected hello handshake".into(),
                });
                return false;
            }
        };

        let (auth_token, claimed_id, claimed_name) = hello;
        let identity = match (auth_token, validator) {
            (Some(token), Some(validator)) => match validator.validate(&token).await {
                Ok(verdict) => Some((verdict.player_id, verdict.username, true)),
                Err(e) => {
                    debug!("token rejected for {}: {}", addr, e);
                    let _ = outbox.emit(ServerMessage::AuthError { message: e.to_string() });
                    None
                }
            },
            (None, _) if config.auth.allow_anonymous => claimed_id.map(|id| {
                let name = claimed_name.unwrap_or_else(|| id.clone());
                (id, name, false)
            }),
            _ => {
                let _ = outbox.emit(ServerMessage::AuthError {
                    message: "auth token required".into(),
                });
                None
            }
        };

        let Some((player_id, username, authenticated)) = identity else {
            return false;
        };

        {
            let mut clients = clients.write().await;
            if let Some(client) = clients.get_mut(&addr) {
                client.player_id = Some(player_id.clone());
                client.username = Some(username);
                client.authenticated = authenticated;
            }
        }

        let _ = outbox.emit(ServerMessage::Welcome {
            player_id,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        });
        true
    }

    /// Inbound frame loop for one connection.
    #[allow(clippy::too_many_arguments)]
    async fn read_loop(
        addr: SocketAddr,
        ws_receiver: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        clients: &ClientMap,
        registry: &Arc<MatchRegistry>,
        queue: &Arc<RwLock<MatchmakingQueue>>,
        events: &EventBus,
        outbox: &Outbox,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            // Any inbound traffic counts as activity, parseable
                            // or not.
                            Self::touch_activity(addr, clients, registry).await;

                            let message = match ClientMessage::from_json(&text) {
                                Ok(m) => m,
                                Err(e) => {
                                    debug!("invalid message from {}: {}", addr, e);
                                    let _ = outbox.emit(ServerMessage::Error {
                                        code: ErrorCode::InvalidMessage,
                                        message: "invalid message format".into(),
                                    });
                                    continue;
                                }
                            };

                            Self::handle_client_message(
                                addr, message, clients, registry, queue, events, outbox,
                            )
                            .await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            Self::touch_activity(addr, clients, registry).await;
                            let _ = outbox.emit(ServerMessage::Error {
                                code: ErrorCode::InvalidMessage,
                                message: "binary frames not supported".into(),
                            });
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("websocket error for {}: {}", addr, e);
                            break;
                        }
                        _ => {}
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }

    /// Refresh the liveness timestamp for whichever player this connection
    /// is bound to.
    async fn touch_activity(addr: SocketAddr, clients: &ClientMap, registry: &Arc<MatchRegistry>) {
        let player_id = clients
            .read()
            .await
            .get(&addr)
            .and_then(|c| c.player_id.clone());
        if let Some(player_id) = player_id {
            if let Some(session) = registry.get_for_player(&player_id).await {
                session.write().await.touch_activity(&player_id, Instant::now());
            }
        }
    }

    /// Resolve this connection's identity for an inbound event. An
    /// authenticated binding always wins; otherwise the client-supplied id
    /// is bound to the connection on first use.
    async fn resolve_identity(
        addr: SocketAddr,
        clients: &ClientMap,
        claimed: Option<(&str, Option<&str>)>,
    ) -> Option<(String, String)> {
        let mut clients = clients.write().await;
        let client = clients.get_mut(&addr)?;

        if let Some(bound) = &client.player_id {
            if client.authenticated {
                let username = client.username.clone().unwrap_or_else(|| bound.clone());
                return Some((bound.clone(), username));
            }
        }

        match claimed {
            Some((player_id, username)) => {
                let username = username
                    .map(String::from)
                    .or_else(|| client.username.clone())
                    .unwrap_or_else(|| player_id.to_string());
                client.player_id = Some(player_id.to_string());
                client.username = Some(username.clone());
                Some((player_id.to_string(), username))
            }
            None => {
                let player_id = client.player_id.clone()?;
                let username = client.username.clone().unwrap_or_else(|| player_id.clone());
                Some((player_id, username))
            }
        }
    }

    /// Handle a parsed client message.
    #[allow(clippy::too_many_arguments)]
    async fn handle_client_message(
        addr: SocketAddr,
        message: ClientMessage,
        clients: &ClientMap,
        registry: &Arc<MatchRegistry>,
        queue: &Arc<RwLock<MatchmakingQueue>>,
        events: &EventBus,
        outbox: &Outbox,
    ) {
        match message {
            ClientMessage::Hello { player_id, username, .. } => {
                // Auth-enabled servers consume `hello` during the handshake;
                // here it only binds an identity for anonymous setups.
                let claimed = player_id.as_deref().map(|id| (id, username.as_deref()));
                if let Some((player_id, _)) =
                    Self::resolve_identity(addr, clients, claimed).await
                {
                    let _ = outbox.emit(ServerMessage::Welcome {
                        player_id,
                        server_version: env!("CARGO_PKG_VERSION").to_string(),
                    });
                }
            }

            ClientMessage::QueueJoin { player_id, username } => {
                let Some((player_id, username)) = Self::resolve_identity(
                    addr,
                    clients,
                    Some((player_id.as_str(), Some(username.as_str()))),
                )
                .await
                else {
                    return;
                };

                let joined = queue.write().await.join(player_id.as_str(), username.as_str());
                match joined {
                    Ok(status) => {
                        debug!(player_id = %player_id, position = status.position, "queued");
                        let _ = outbox.emit(ServerMessage::QueueStatus {
                            position: status.position,
                            queue_size: status.queue_size,
                        });
                    }
                    Err(e) => {
                        let _ = outbox.emit(ServerMessage::QueueError {
                            message: e.to_string(),
                        });
                    }
                }
            }

            ClientMessage::QueueLeave { player_id } => {
                if let Some((player_id, _)) =
                    Self::resolve_identity(addr, clients, Some((player_id.as_str(), None))).await
                {
                    // Absent entries leave silently.
                    queue.write().await.leave(&player_id);
                }
            }

            ClientMessage::SubmitCommands { tick, commands } => {
                let Some((player_id, _)) = Self::resolve_identity(addr, clients, None).await
                else {
                    let _ = outbox.emit(ServerMessage::SubmitCommandsAck {
                        tick,
                        accepted: false,
                        reason: Some("wrong-match".into()),
                    });
                    return;
                };

                let Some(session) = registry.get_for_player(&player_id).await else {
                    let _ = outbox.emit(ServerMessage::SubmitCommandsAck {
                        tick,
                        accepted: false,
                        reason: Some("wrong-match".into()),
                    });
                    return;
                };

                let verdict = session
                    .write()
                    .await
                    .submit_commands(&player_id, tick, commands);
                let ack = match verdict {
                    Ok(()) => ServerMessage::SubmitCommandsAck {
                        tick,
                        accepted: true,
                        reason: None,
                    },
                    Err(rejected) => ServerMessage::SubmitCommandsAck {
                        tick,
                        accepted: false,
                        reason: Some(rejected.as_reason().into()),
                    },
                };
                let _ = outbox.emit(ack);
            }

            ClientMessage::ReconnectMatch { player_id, match_id } => {
                Self::handle_reconnect(
                    addr, player_id, match_id, clients, registry, events, outbox,
                )
                .await;
            }

            ClientMessage::StateHash { tick, hash } => {
                let Some((player_id, _)) = Self::resolve_identity(addr, clients, None).await
                else {
                    return;
                };
                if let Some(session) = registry.get_for_player(&player_id).await {
                    session.write().await.submit_hash(&player_id, tick, hash);
                }
            }

            ClientMessage::Ping { timestamp } => {
                let _ = outbox.emit(ServerMessage::Pong {
                    timestamp,
                    server_time_ms: Utc::now().timestamp_millis(),
                });
            }
        }
    }

    /// Validate and perform a reconnect for a fresh connection.
    async fn handle_reconnect(
        addr: SocketAddr,
        claimed_player_id: String,
        match_id: String,
        clients: &ClientMap,
        registry: &Arc<MatchRegistry>,
        events: &EventBus,
        outbox: &Outbox,
    ) {
        let Some((player_id, _)) = Self::resolve_identity(
            addr,
            clients,
            Some((claimed_player_id.as_str(), None)),
        )
        .await
        else {
            return;
        };

        let Some(session) = registry.get(&match_id).await else {
            let _ = outbox.emit(ServerMessage::ReconnectStatus {
                success: false,
                reason: Some(ReconnectError::MatchNotFound.to_string()),
            });
            return;
        };

        let rejoined = {
            let mut session = session.write().await;
            match session.reconnect(&player_id, outbox.clone(), Instant::now()) {
                Ok(snapshot) => {
                    info!(match_id = %snapshot.match_id, player_id = %player_id, "player reconnected");

                    let _ = outbox.emit(ServerMessage::ReconnectStatus {
                        success: true,
                        reason: None,
                    });
                    let rejoined_match = snapshot.match_id.clone();
                    let _ = outbox.emit(ServerMessage::ReconnectState {
                        match_id: snapshot.match_id,
                        current_tick: snapshot.current_tick,
                        seed: snapshot.seed,
                        team_assignment: snapshot.team_assignment,
                        tick_commands_history: snapshot.history,
                    });

                    session.broadcast_except(
                        &player_id,
                        &ServerMessage::PlayerReconnected {
                            player_id: player_id.clone(),
                            match_id: rejoined_match.clone(),
                        },
                    );
                    Some(rejoined_match)
                }
                Err(e) => {
                    let _ = outbox.emit(ServerMessage::ReconnectStatus {
                        success: false,
                        reason: Some(e.to_string()),
                    });
                    None
                }
            }
        };

        if let Some(match_id) = rejoined {
            events.emit(EngineEvent::PlayerReconnected { match_id, player_id });
        }
    }

    /// Post-disconnect bookkeeping for one connection.
    async fn cleanup_connection(
        addr: SocketAddr,
        clients: &ClientMap,
        registry: &Arc<MatchRegistry>,
        queue: &Arc<RwLock<MatchmakingQueue>>,
        events: &EventBus,
    ) {
        let player_id = {
            let mut clients = clients.write().await;
            clients.remove(&addr).and_then(|c| c.player_id)
        };
        let Some(player_id) = player_id else {
            return;
        };

        queue.write().await.leave(&player_id);

        if let Some(session) = registry.get_for_player(&player_id).await {
            let dropped_from = {
                let mut s = session.write().await;
                if s.phase() != MatchPhase::Ended && s.drop_closed_transport(&player_id) {
                    let match_id = s.id.clone();
                    info!(match_id = %match_id, player_id = %player_id, "player disconnected mid-match");
                    s.broadcast(&ServerMessage::PlayerDisconnected {
                        player_id: player_id.clone(),
                        match_id: match_id.clone(),
                    });
                    Some(match_id)
                } else {
                    None
                }
            };
            if let Some(match_id) = dropped_from {
                events.emit(EngineEvent::PlayerDisconnected { match_id, player_id });
            }
        }
    }

    // =========================================================================
    // MATCHMAKING
    // =========================================================================

    /// Periodic formation task.
    async fn run_matchmaking_loop(
        queue: Arc<RwLock<MatchmakingQueue>>,
        registry: Arc<MatchRegistry>,
        clients: ClientMap,
        events: EventBus,
        config: EngineConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) {
        let mut ticker = interval(Duration::from_millis(config.matchmaking_interval_ms.max(1)));
        let mut shutdown_rx = shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            Self::try_form_matches(&queue, &registry, &clients, &events, &config, &shutdown_tx)
                .await;
        }
    }

    /// Form as many matches as the queue allows right now. Returns how many
    /// were created.
    async fn try_form_matches(
        queue: &Arc<RwLock<MatchmakingQueue>>,
        registry: &Arc<MatchRegistry>,
        clients: &ClientMap,
        events: &EventBus,
        config: &EngineConfig,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> usize {
        let match_size = config.game_mode.match_size();
        if match_size == 0 {
            return 0;
        }

        // Snapshot reachable players once per pass; the queue's formation
        // policy drops anyone who vanished.
        let reachable: BTreeMap<String, Outbox> = {
            let clients = clients.read().await;
            clients
                .values()
                .filter_map(|c| {
                    let player_id = c.player_id.clone()?;
                    (!c.outbox.is_closed()).then(|| (player_id, c.outbox.clone()))
                })
                .collect()
        };

        let mut formed_count = 0;
        loop {
            let formed = queue
                .write()
                .await
                .form_match(match_size, |id| reachable.contains_key(id));
            let Some(formed) = formed else { break };

            let match_id = generate_match_id();
            let seed: u32 = rand::random();

            let players: Vec<(String, String, Outbox)> = formed
                .iter()
                .filter_map(|p| {
                    let outbox = reachable.get(&p.player_id)?.clone();
                    Some((p.player_id.clone(), p.username.clone(), outbox))
                })
                .collect();
            if players.len() < match_size {
                // A connection vanished inside the formation window; the
                // remaining players go back in the queue.
                let mut q = queue.write().await;
                for (player_id, username, _) in players {
                    let _ = q.join(player_id, username);
                }
                continue;
            }

            let session = MatchSession::new(
                match_id.clone(),
                config,
                seed,
                players,
                Instant::now(),
            );
            let session = registry.insert(session).await;

            info!(
                match_id = %match_id,
                game_mode = %config.game_mode.preset_name(),
                players = formed.len(),
                "match formed"
            );

            // `match-found` with each recipient's own team perspective.
            {
                let mut s = session.write().await;
                let briefs: Vec<(String, String, u32)> = s
                    .slots()
                    .iter()
                    .map(|slot| (slot.player_id.clone(), slot.username.clone(), slot.team_id))
                    .collect();

                for (player_id, _, team_id) in &briefs {
                    let teammates: Vec<PlayerBrief> = briefs
                        .iter()
                        .filter(|(id, _, team)| team == team_id && id != player_id)
                        .map(|(id, name, _)| PlayerBrief {
                            player_id: id.clone(),
                            username: name.clone(),
                        })
                        .collect();
                    let opponents: Vec<PlayerBrief> = briefs
                        .iter()
                        .filter(|(_, _, team)| team != team_id)
                        .map(|(id, name, _)| PlayerBrief {
                            player_id: id.clone(),
                            username: name.clone(),
                        })
                        .collect();

                    s.emit_to(player_id, ServerMessage::MatchFound {
                        match_id: match_id.clone(),
                        player_id: player_id.clone(),
                        team_id: *team_id,
                        teammates,
                        opponents,
                        game_mode: config.game_mode.preset_name(),
                        seed,
                    });
                }
            }

            events.emit(EngineEvent::MatchCreated {
                match_id: match_id.clone(),
                game_mode: config.game_mode,
                player_ids: formed.iter().map(|p| p.player_id.clone()).collect(),
            });

            // Drive the match to completion on its own task; a panic inside
            // the loop aborts only this match.
            let loop_session = session.clone();
            let loop_registry = registry.clone();
            let loop_events = events.clone();
            let loop_config = config.clone();
            let loop_shutdown = shutdown_tx.subscribe();
            let watchdog_session = session.clone();
            let watchdog_events = events.clone();
            let watchdog_registry = registry.clone();

            let handle = tokio::spawn(async move {
                Self::run_match_loop(
                    loop_session,
                    loop_registry,
                    loop_events,
                    loop_config,
                    loop_shutdown,
                )
                .await;
            });
            tokio::spawn(async move {
                if handle.await.is_err() {
                    let (ended, match_id) = {
                        let mut s = watchdog_session.write().await;
                        (s.end("internal-error"), s.id.clone())
                    };
                    error!(match_id = %match_id, "match loop panicked");
                    if ended {
                        watchdog_events.emit(EngineEvent::MatchEnded {
                            match_id: match_id.clone(),
                            reason: "internal-error".into(),
                        });
                    }
                    watchdog_registry.remove(&match_id).await;
                }
            });

            formed_count += 1;
        }

        formed_count
    }

    // =========================================================================
    // MATCH LOOP
    // =========================================================================

    /// Countdown, then the fixed-cadence tick loop, then teardown.
    async fn run_match_loop(
        session: Arc<RwLock<MatchSession>>,
        registry: Arc<MatchRegistry>,
        events: EventBus,
        config: EngineConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let match_id = session.read().await.id.clone();

        // Phase 1: countdown, one marker per second down to zero.
        for remaining in (0..=config.countdown_seconds).rev() {
            let ended_early = {
                let mut s = session.write().await;
                if s.phase() == MatchPhase::Ended {
                    true
                } else {
                    s.broadcast(&ServerMessage::Countdown { seconds: remaining });
                    false
                }
            };
            if ended_early {
                registry.remove(&match_id).await;
                return;
            }
            if remaining > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown_rx.recv() => {}
                }
            }
        }

        // Transition edge: exactly one game-start per slot, then ticks.
        let ended_early = {
            let mut s = session.write().await;
            if s.phase() == MatchPhase::Ended {
                true
            } else {
                s.begin_running(Instant::now());
                false
            }
        };
        if ended_early {
            registry.remove(&match_id).await;
            return;
        }
        {
            let mut s = session.write().await;

            let seed = s.seed();
            let tick_rate = s.tick_rate();
            let players = s.slot_infos();
            let recipients: Vec<(String, u32)> = s
                .slots()
                .iter()
                .map(|slot| (slot.player_id.clone(), slot.team_id))
                .collect();
            for (player_id, team_id) in recipients {
                s.emit_to(&player_id, ServerMessage::GameStart {
                    match_id: match_id.clone(),
                    seed,
                    tick_rate,
                    players: players.clone(),
                    your_team_id: team_id,
                });
            }
        }
        events.emit(EngineEvent::MatchStarted {
            match_id: match_id.clone(),
            seed: session.read().await.seed(),
        });
        info!(match_id = %match_id, "match running");

        // Phase 2: the tick loop. One tick per firing; missed firings are
        // skipped, never bursted (clients interpolate).
        let mut ticker = interval(config.tick_duration());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            let outcome = {
                let mut s = session.write().await;
                s.run_tick(Instant::now(), Utc::now().timestamp_millis())
            };
            let Some(outcome) = outcome else {
                // Ended externally (embedder verdict or shutdown sweep).
                break;
            };

            for (player_id, ms) in outcome.lagging {
                events.emit(EngineEvent::PlayerLagging {
                    match_id: match_id.clone(),
                    player_id,
                    ms_since_last_message: ms,
                });
            }
            for (player_id, ms) in outcome.timed_out {
                events.emit(EngineEvent::PlayerTimeout {
                    match_id: match_id.clone(),
                    player_id,
                    ms_since_last_message: ms,
                });
            }
            for player_id in outcome.disconnected {
                events.emit(EngineEvent::PlayerDisconnected {
                    match_id: match_id.clone(),
                    player_id,
                });
            }
            if outcome.first_desync {
                if let Some(report) = outcome.desyncs.first() {
                    warn!(match_id = %match_id, tick = report.tick, "desync detected");
                    events.emit(EngineEvent::DesyncDetected {
                        match_id: match_id.clone(),
                        tick: report.tick,
                        hashes: report.hashes.clone(),
                    });
                }
            }

            if outcome.all_disconnected {
                let ended = session.write().await.end("all-disconnected");
                if ended {
                    events.emit(EngineEvent::MatchEnded {
                        match_id: match_id.clone(),
                        reason: "all-disconnected".into(),
                    });
                }
                break;
            }
        }

        // Phase 3: teardown. The shutdown sweep ends sessions itself; any
        // other exit path that left the match running ends it here.
        let ended_now = {
            let mut s = session.write().await;
            s.phase() != MatchPhase::Ended && s.end("server-shutdown")
        };
        if ended_now {
            events.emit(EngineEvent::MatchEnded {
                match_id: match_id.clone(),
                reason: "server-shutdown".into(),
            });
        }

        // Keep the history around briefly for in-flight reconnects.
        tokio::time::sleep(ENDED_MATCH_RETENTION).await;
        registry.remove(&match_id).await;
    }
}
