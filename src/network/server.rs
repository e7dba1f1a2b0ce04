//! WebSocket Round Server
//!
//! Async WebSocket server for player and observer connections.
//! Handles authentication, bet and cash-out requests, and wires each
//! connection into the broadcast fanout.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, broadcast, watch};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::config::{self, ConfigError};
use crate::core::amount::{Amount, Multiplier};
use crate::game::engine::EngineWatch;
use crate::game::settlement::{SettlementCoordinator, WagerId};
use crate::game::state::{RoundPhase, RoundSnapshot};
use crate::network::auth::{authenticate, AuthConfig};
use crate::network::broadcast::{BroadcastFanout, Frame};
use crate::network::protocol::{
    amount_from_wire, crash_point_label, multiplier_from_wire, AuthResult, BetPlaced,
    CashedOut, ClientMessage, ErrorCode, ServerError, ServerMessage, SyncState,
};
use crate::store::AccountId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Idle connections are dropped after this long without a message.
    pub idle_timeout: Duration,
    /// How often idle connections are swept.
    pub cleanup_interval: Duration,
    /// Per-connection outbound buffer; a full buffer evicts the client.
    pub outbound_buffer: usize,
    /// Balance for accounts the in-memory store has not seen.
    pub starting_balance: Amount,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            outbound_buffer: 256,
            starting_balance: Amount::ZERO,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = config::parse::<u16, _>(&lookup, "PORT")? {
            config.bind_addr.set_port(port);
        }
        if let Some(addr) = config::parse::<SocketAddr, _>(&lookup, "CRASH_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(n) = config::parse::<usize, _>(&lookup, "CRASH_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }
        if let Some(secs) = config::parse::<u64, _>(&lookup, "CRASH_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = config::parse::<usize, _>(&lookup, "CRASH_OUTBOUND_BUFFER")? {
            config.outbound_buffer = n;
        }
        if let Some(units) = config::parse::<f64, _>(&lookup, "CRASH_STARTING_BALANCE")? {
            config.starting_balance = config::units_to_amount(units, "CRASH_STARTING_BALANCE")?;
        }

        if config.outbound_buffer == 0 || config.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "connection limit and outbound buffer must be positive".into(),
            ));
        }
        Ok(config)
    }
}

/// Round server errors.
#[derive(Debug, thiserror::Error)]
pub enum CrashServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// Connected client state.
struct ConnectedClient {
    /// Account (after auth).
    account: Option<AccountId>,
    /// Token carried the admin role.
    privileged: bool,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;

/// State shared by every connection task.
#[derive(Clone)]
struct Shared {
    clients: Clients,
    settlement: Arc<SettlementCoordinator>,
    fanout: Arc<BroadcastFanout>,
    snapshot: watch::Receiver<RoundSnapshot>,
    upcoming: watch::Receiver<Vec<Multiplier>>,
    auth: Arc<AuthConfig>,
    version: String,
}

/// The round server.
pub struct CrashServer {
    /// Server configuration.
    config: ServerConfig,
    /// Connection-shared state.
    shared: Shared,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl CrashServer {
    /// Create a new server over a running engine.
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        settlement: Arc<SettlementCoordinator>,
        fanout: Arc<BroadcastFanout>,
        watch: EngineWatch,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Shared {
                clients: Arc::new(RwLock::new(BTreeMap::new())),
                settlement,
                fanout,
                snapshot: watch.snapshot,
                upcoming: watch.upcoming,
                auth: Arc::new(auth),
                version: config.version.clone(),
            },
            config,
            shutdown_tx,
        }
    }

    /// Subscribe to the server's shutdown signal.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), CrashServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Round server listening on {}", self.config.bind_addr);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) {
        let cleanup_clients = self.shared.clients.clone();
        let cleanup_fanout = self.shared.fanout.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_every = self.config.cleanup_interval;

        // Spawn cleanup task
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_fanout, idle_timeout, cleanup_every).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.shared.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let buffer = self.config.outbound_buffer;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(buffer);

            // Register client
            {
                let mut clients = shared.clients.write().await;
                clients.insert(addr, ConnectedClient {
                    account: None,
                    privileged: false,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                });
            }
            let kick = shared.fanout.subscribe(addr, frame_tx.clone());

            // Spawn frame writer task
            let sender_task = tokio::spawn(async move {
                while let Some(frame) = frame_rx.recv().await {
                    let msg = match frame {
                        Frame::Text(text) => Message::Text(text.to_string()),
                        Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
                    };
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let reply = |msg: ServerMessage| {
                let frame_tx = frame_tx.clone();
                async move {
                    if let Some(frame) = Frame::message(&msg) {
                        let _ = frame_tx.send(frame).await;
                    }
                }
            };

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        reply(ServerMessage::error(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };

                                // Update activity
                                {
                                    let mut clients = shared.clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                let response = Self::handle_client_message(addr, client_msg, &shared).await;
                                if let Some(response) = response {
                                    reply(response).await;
                                }
                            }
                            Some(Ok(Message::Ping(_))) => {
                                // tungstenite answers pings itself; count it as activity
                                let mut clients = shared.clients.write().await;
                                if let Some(client) = clients.get_mut(&addr) {
                                    client.last_activity = Instant::now();
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = kick.notified() => {
                        warn!("Client {} dropped: too slow or idle", addr);
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        reply(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup: let the writer drain what is queued, then stop it
            shared.fanout.unsubscribe(&addr);
            drop(reply);
            drop(frame_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Writer for {} did not drain in time", addr);
            }

            // Remove client
            {
                let mut clients = shared.clients.write().await;
                if let Some(client) = clients.remove(&addr) {
                    debug!(
                        "Client {} ({}) was connected for {:?}",
                        addr,
                        client.account.map(|a| a.short()).unwrap_or_else(|| "anonymous".into()),
                        client.connected_at.elapsed()
                    );
                }
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message; returns the direct reply, if any.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        shared: &Shared,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Auth { token } => Some(Self::handle_auth(addr, &token, shared).await),
            ClientMessage::PlaceBet { stake, auto_cash_out } => {
                Some(Self::handle_place_bet(addr, stake, auto_cash_out, shared).await)
            }
            ClientMessage::CashOut { wager_id } => {
                Some(Self::handle_cash_out(addr, wager_id, shared).await)
            }
            ClientMessage::GetBalance => Some(Self::handle_get_balance(addr, shared).await),
            ClientMessage::SyncRequest => {
                let snapshot = shared.snapshot.borrow().clone();
                Some(ServerMessage::Sync(SyncState::from(&snapshot)))
            }
            ClientMessage::WatchPrivileged => Some(Self::handle_watch_privileged(addr, shared).await),
            ClientMessage::BinaryTicks { enabled } => {
                shared.fanout.set_binary_ticks(&addr, enabled);
                None
            }
            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong {
                timestamp,
                server_time: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64,
            }),
        }
    }

    /// Handle authentication.
    async fn handle_auth(addr: SocketAddr, token: &str, shared: &Shared) -> ServerMessage {
        let identity = match authenticate(token, &shared.auth) {
            Ok(identity) => identity,
            Err(e) => {
                debug!("Auth failed for {}: {}", addr, e);
                return ServerMessage::AuthResult(AuthResult {
                    success: false,
                    account: None,
                    privileged: false,
                    error: Some(format!("{:?}: {}", e.code(), e)),
                    server_version: shared.version.clone(),
                });
            }
        };

        {
            let mut clients = shared.clients.write().await;
            if let Some(client) = clients.get_mut(&addr) {
                client.account = Some(identity.account);
                client.privileged = identity.privileged;
            }
        }
        shared.fanout.set_account(&addr, identity.account);

        debug!("Client {} authenticated as {}", addr, identity.account.short());

        ServerMessage::AuthResult(AuthResult {
            success: true,
            account: Some(identity.account.to_string()),
            privileged: identity.privileged,
            error: None,
            server_version: shared.version.clone(),
        })
    }

    /// Account of an authenticated client.
    async fn account_of(addr: SocketAddr, shared: &Shared) -> Result<AccountId, ServerMessage> {
        let clients = shared.clients.read().await;
        clients
            .get(&addr)
            .and_then(|c| c.account)
            .ok_or_else(|| ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first"))
    }

    /// Handle bet placement.
    async fn handle_place_bet(
        addr: SocketAddr,
        stake: f64,
        auto_cash_out: Option<f64>,
        shared: &Shared,
    ) -> ServerMessage {
        let account = match Self::account_of(addr, shared).await {
            Ok(account) => account,
            Err(reply) => return reply,
        };

        let Some(stake) = amount_from_wire(stake) else {
            return ServerMessage::error(ErrorCode::InvalidInput, "stake must be a non-negative number");
        };
        let target = match auto_cash_out.map(multiplier_from_wire) {
            None => None,
            Some(Some(target)) => Some(target),
            Some(None) => {
                return ServerMessage::error(ErrorCode::InvalidInput, "auto_cash_out must be a positive number");
            }
        };

        match shared.settlement.place_bet(account, stake, target).await {
            Ok(placed) => ServerMessage::BetPlaced(BetPlaced {
                wager_id: placed.wager.id,
                round_id: placed.wager.round_id,
                stake: placed.wager.stake.to_float(),
                auto_cash_out: placed.wager.auto_cash_out.map(Multiplier::as_f64),
                balance: placed.balance.to_float(),
            }),
            Err(e) => {
                debug!("Bet from {} rejected: {}", account.short(), e);
                ServerMessage::Error(ServerError::from(&e))
            }
        }
    }

    /// Handle manual cash-out at the live multiplier.
    async fn handle_cash_out(addr: SocketAddr, wager_id: WagerId, shared: &Shared) -> ServerMessage {
        let account = match Self::account_of(addr, shared).await {
            Ok(account) => account,
            Err(reply) => return reply,
        };

        let observed = {
            let snapshot = shared.snapshot.borrow();
            match (snapshot.phase, snapshot.multiplier) {
                (RoundPhase::Running, Some(m)) => Multiplier::from_f64_floor(m),
                _ => Multiplier::ONE,
            }
        };

        match shared.settlement.manual_cash_out(account, wager_id, observed).await {
            Ok(settlement) => ServerMessage::CashedOut(CashedOut {
                wager_id,
                multiplier: settlement
                    .wager
                    .settled_multiplier
                    .unwrap_or_default()
                    .as_f64(),
                payout: settlement.payout.to_float(),
                balance: settlement.balance.to_float(),
            }),
            Err(e) => {
                debug!("Cash-out {} from {} rejected: {}", wager_id, account.short(), e);
                ServerMessage::Error(ServerError::from(&e))
            }
        }
    }

    /// Handle balance query.
    async fn handle_get_balance(addr: SocketAddr, shared: &Shared) -> ServerMessage {
        let account = match Self::account_of(addr, shared).await {
            Ok(account) => account,
            Err(reply) => return reply,
        };

        match shared.settlement.balance(account).await {
            Ok(balance) => ServerMessage::Balance { balance: balance.to_float() },
            Err(e) => ServerMessage::Error(ServerError::from(&e)),
        }
    }

    /// Handle a request to join the privileged audience.
    async fn handle_watch_privileged(addr: SocketAddr, shared: &Shared) -> ServerMessage {
        let privileged = {
            let clients = shared.clients.read().await;
            clients.get(&addr).map(|c| c.privileged).unwrap_or(false)
        };

        if !privileged {
            return ServerMessage::error(ErrorCode::Forbidden, "Admin role required");
        }

        shared.fanout.set_privileged(&addr, true);
        info!("Client {} joined the privileged audience", addr);

        let round_id = shared.snapshot.borrow().round_id;
        let upcoming = shared.upcoming.borrow().clone();
        ServerMessage::UpcomingCrashPoints {
            round_id,
            upcoming: upcoming.into_iter().map(crash_point_label).collect(),
            timestamp: Utc::now(),
        }
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(
        clients: Clients,
        fanout: Arc<BroadcastFanout>,
        idle_timeout: Duration,
        every: Duration,
    ) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            // Cleanup idle connections
            let now = Instant::now();
            let to_remove: Vec<_> = {
                let clients = clients.read().await;
                clients.iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect()
            };

            for addr in to_remove {
                // The connection task removes its own entry once it exits.
                fanout.evict(&addr);
                info!("Removed idle client {}", addr);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.shared.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use crate::config::EngineConfig;
    use crate::game::crash_point::ScriptedCrashPoints;
    use crate::game::engine::RoundEngine;
    use crate::network::auth::TokenClaims;
    use crate::store::InMemoryAccountStore;

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    type Ws = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >;

    fn token(sub: &str, role: Option<&str>) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let claims = TokenClaims {
            sub: sub.into(),
            exp: now + 3600,
            iss: None,
            role: role.map(Into::into),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    /// Server plus a slow-moving engine, bound to an ephemeral port.
    async fn start() -> (Arc<CrashServer>, SocketAddr) {
        start_with(
            EngineConfig {
                countdown_duration: Duration::from_secs(30),
                ..EngineConfig::default()
            },
            vec![Multiplier(300), Multiplier(150)],
        )
        .await
    }

    async fn start_with(engine_config: EngineConfig, points: Vec<Multiplier>) -> (Arc<CrashServer>, SocketAddr) {
        let store = Arc::new(InMemoryAccountStore::new(Amount::from_units(100)));
        let settlement = Arc::new(SettlementCoordinator::from_config(store, &engine_config));
        let fanout = Arc::new(BroadcastFanout::new());
        let engine = RoundEngine::new(
            engine_config,
            Box::new(ScriptedCrashPoints::new(points)),
            settlement.clone(),
            fanout.clone(),
        );
        let mut watch = engine.watch();

        let auth = AuthConfig {
            secret: Some(SECRET.into()),
            ..Default::default()
        };
        let server = Arc::new(CrashServer::new(
            ServerConfig::default(),
            auth,
            settlement,
            fanout,
            engine.watch(),
        ));

        tokio::spawn(engine.run(server.shutdown_signal()));
        watch
            .snapshot
            .wait_for(|s| s.phase == RoundPhase::Countdown)
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        (server, addr)
    }

    async fn connect(addr: SocketAddr) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Ws, msg: &ClientMessage) {
        ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
    }

    /// Next JSON message matching `pick`, skipping round broadcasts.
    async fn expect<T>(ws: &mut Ws, pick: impl Fn(ServerMessage) -> Option<T>) -> T {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let msg = ServerMessage::from_json(&text).unwrap();
                        if let Some(found) = pick(msg) {
                            return found;
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended: {:?}", other),
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.starting_balance, Amount::ZERO);
    }

    #[test]
    fn test_server_config_from_lookup() {
        let config = ServerConfig::from_lookup(|key| match key {
            "PORT" => Some("9001".into()),
            "CRASH_STARTING_BALANCE" => Some("250".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9001);
        assert_eq!(config.starting_balance, Amount::from_units(250));

        let result = ServerConfig::from_lookup(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(matches!(result, Err(ConfigError::Unparseable { .. })));
    }

    #[tokio::test]
    async fn test_sync_without_auth() {
        let (server, addr) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, &ClientMessage::SyncRequest).await;
        let sync = expect(&mut ws, |m| match m {
            ServerMessage::Sync(sync) => Some(sync),
            _ => None,
        })
        .await;
        assert_eq!(sync.round_id, 1);
        assert_eq!(sync.phase, RoundPhase::Countdown);
        assert_eq!(sync.multiplier, None);

        assert_eq!(server.connection_count().await, 1);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_bet_requires_auth() {
        let (server, addr) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, &ClientMessage::PlaceBet { stake: 10.0, auto_cash_out: None }).await;
        let error = expect(&mut ws, |m| match m {
            ServerMessage::Error(e) => Some(e),
            _ => None,
        })
        .await;
        assert_eq!(error.code, ErrorCode::NotAuthenticated);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_auth_bet_and_balance() {
        let (server, addr) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, &ClientMessage::Auth { token: token("player-1", None) }).await;
        let auth = expect(&mut ws, |m| match m {
            ServerMessage::AuthResult(r) => Some(r),
            _ => None,
        })
        .await;
        assert!(auth.success);
        assert!(!auth.privileged);

        send(&mut ws, &ClientMessage::PlaceBet { stake: 10.0, auto_cash_out: Some(2.0) }).await;
        let placed = expect(&mut ws, |m| match m {
            ServerMessage::BetPlaced(b) => Some(b),
            _ => None,
        })
        .await;
        assert_eq!(placed.round_id, 1);
        assert_eq!(placed.balance, 90.0);

        // Target below the minimum is rejected at placement
        send(&mut ws, &ClientMessage::PlaceBet { stake: 10.0, auto_cash_out: Some(1.5) }).await;
        let error = expect(&mut ws, |m| match m {
            ServerMessage::Error(e) => Some(e),
            _ => None,
        })
        .await;
        assert_eq!(error.code, ErrorCode::InvalidTarget);

        send(&mut ws, &ClientMessage::GetBalance).await;
        let balance = expect(&mut ws, |m| match m {
            ServerMessage::Balance { balance } => Some(balance),
            _ => None,
        })
        .await;
        assert_eq!(balance, 90.0);

        // Not running yet
        send(&mut ws, &ClientMessage::CashOut { wager_id: placed.wager_id }).await;
        let error = expect(&mut ws, |m| match m {
            ServerMessage::Error(e) => Some(e),
            _ => None,
        })
        .await;
        assert_eq!(error.code, ErrorCode::InvalidPhase);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_privileged_requires_admin_role() {
        let (server, addr) = start().await;

        let mut player = connect(addr).await;
        send(&mut player, &ClientMessage::Auth { token: token("player-2", None) }).await;
        expect(&mut player, |m| matches!(m, ServerMessage::AuthResult(_)).then_some(())).await;
        send(&mut player, &ClientMessage::WatchPrivileged).await;
        let error = expect(&mut player, |m| match m {
            ServerMessage::Error(e) => Some(e),
            _ => None,
        })
        .await;
        assert_eq!(error.code, ErrorCode::Forbidden);

        let mut admin = connect(addr).await;
        send(&mut admin, &ClientMessage::Auth { token: token("ops", Some("admin")) }).await;
        let auth = expect(&mut admin, |m| match m {
            ServerMessage::AuthResult(r) => Some(r),
            _ => None,
        })
        .await;
        assert!(auth.privileged);

        send(&mut admin, &ClientMessage::WatchPrivileged).await;
        let upcoming = expect(&mut admin, |m| match m {
            ServerMessage::UpcomingCrashPoints { upcoming, .. } => Some(upcoming),
            _ => None,
        })
        .await;
        // Round 1 took 3.00; the script then repeats its last value
        assert_eq!(upcoming.first().map(String::as_str), Some("1.50"));
        assert!(!upcoming.iter().any(|p| p == "3.00"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let (server, addr) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, &ClientMessage::Auth { token: "garbage".into() }).await;
        let auth = expect(&mut ws, |m| match m {
            ServerMessage::AuthResult(r) => Some(r),
            _ => None,
        })
        .await;
        assert!(!auth.success);
        assert!(auth.account.is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_live_round_cash_out_and_balance_push() {
        let engine_config = EngineConfig {
            countdown_duration: Duration::from_millis(1_500),
            tick_interval: Duration::from_millis(20),
            growth_rate: 1.0,
            ..EngineConfig::default()
        };
        let (server, addr) = start_with(engine_config, vec![Multiplier(300)]).await;

        let mut alice = connect(addr).await;
        let mut bob = connect(addr).await;
        for (ws, sub) in [(&mut alice, "alice"), (&mut bob, "bob")] {
            send(ws, &ClientMessage::Auth { token: token(sub, None) }).await;
            let auth = expect(ws, |m| match m {
                ServerMessage::AuthResult(r) => Some(r),
                _ => None,
            })
            .await;
            assert!(auth.success);
        }

        send(&mut alice, &ClientMessage::PlaceBet { stake: 10.0, auto_cash_out: None }).await;
        let manual = expect(&mut alice, |m| match m {
            ServerMessage::BetPlaced(b) => Some(b),
            _ => None,
        })
        .await;
        send(&mut alice, &ClientMessage::PlaceBet { stake: 10.0, auto_cash_out: Some(2.0) }).await;
        let auto = expect(&mut alice, |m| match m {
            ServerMessage::BetPlaced(b) => Some(b),
            _ => None,
        })
        .await;
        assert_eq!(auto.balance, 80.0);

        // Wait for the clock to climb a little, then cash out by hand
        let climbed = expect(&mut alice, |m| match m {
            ServerMessage::MultiplierUpdate { multiplier, .. } if multiplier >= 1.1 => Some(multiplier),
            _ => None,
        })
        .await;
        send(&mut alice, &ClientMessage::CashOut { wager_id: manual.wager_id }).await;

        // Ticks ahead of the reply in the stream bound the settled multiplier
        let (cashed, last_seen) = tokio::time::timeout(Duration::from_secs(5), async {
            let mut last_seen = climbed;
            loop {
                let Some(Ok(Message::Text(text))) = alice.next().await else {
                    continue;
                };
                match ServerMessage::from_json(&text).unwrap() {
                    ServerMessage::MultiplierUpdate { multiplier, .. } => last_seen = multiplier,
                    ServerMessage::CashedOut(cashed) => return (cashed, last_seen),
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(cashed.wager_id, manual.wager_id);
        assert!(cashed.multiplier > 1.0);
        assert!(cashed.multiplier <= last_seen);
        assert!((cashed.payout - 10.0 * cashed.multiplier).abs() < 1e-6);
        assert!((cashed.balance - (80.0 + cashed.payout)).abs() < 1e-6);

        // The auto target pays its owner, and only its owner
        let pushed = expect(&mut alice, |m| match m {
            ServerMessage::BalanceUpdated(update) => Some(update),
            _ => None,
        })
        .await;
        assert_eq!(pushed.wager_id, auto.wager_id);
        assert_eq!(pushed.multiplier, 2.0);
        assert_eq!(pushed.payout, 20.0);
        assert!((pushed.balance - (cashed.balance + 20.0)).abs() < 1e-6);

        let crash_point = expect(&mut bob, |m| match m {
            ServerMessage::BalanceUpdated(_) => panic!("balance push reached another account"),
            ServerMessage::RoundEnded { crash_point, .. } => Some(crash_point),
            _ => None,
        })
        .await;
        assert_eq!(crash_point, "3.00");

        // A second cash-out on the settled wager is refused
        send(&mut alice, &ClientMessage::CashOut { wager_id: manual.wager_id }).await;
        let error = expect(&mut alice, |m| match m {
            ServerMessage::Error(e) => Some(e),
            _ => None,
        })
        .await;
        assert!(matches!(error.code, ErrorCode::AlreadySettled | ErrorCode::InvalidPhase));

        server.shutdown();
    }
}
