//! Engine Configuration
//!
//! Runtime configuration for the match coordinator: transport binding,
//! game-mode presets, tick cadence, and the liveness/replay thresholds that
//! drive the per-match state machines. Everything is expressed in ticks or
//! milliseconds; conversion helpers live here so the rest of the crate never
//! repeats the arithmetic.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default simulation tick rate (ticks per second).
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Team composition for a match.
///
/// The three standard presets parse from their conventional names; anything
/// else goes through [`GameMode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Two players, one per team.
    Duel,
    /// Four players in two teams of two.
    Doubles,
    /// Six players in two teams of three.
    Trios,
    /// Arbitrary composition.
    Custom {
        /// Number of teams.
        team_count: u32,
        /// Players per team.
        team_size: u32,
    },
}

impl GameMode {
    /// Parse a mode from its wire name (`1v1`, `2v2`, `3v3`).
    pub fn from_preset(name: &str) -> Option<Self> {
        match name {
            "1v1" => Some(GameMode::Duel),
            "2v2" => Some(GameMode::Doubles),
            "3v3" => Some(GameMode::Trios),
            _ => None,
        }
    }

    /// Wire name for the mode.
    pub fn preset_name(&self) -> String {
        match self {
            GameMode::Duel => "1v1".into(),
            GameMode::Doubles => "2v2".into(),
            GameMode::Trios => "3v3".into(),
            GameMode::Custom { team_count, team_size } => {
                format!("custom-{}x{}", team_count, team_size)
            }
        }
    }

    /// Number of teams.
    pub fn team_count(&self) -> u32 {
        match self {
            GameMode::Duel | GameMode::Doubles | GameMode::Trios => 2,
            GameMode::Custom { team_count, .. } => *team_count,
        }
    }

    /// Players per team.
    pub fn team_size(&self) -> u32 {
        match self {
            GameMode::Duel => 1,
            GameMode::Doubles => 2,
            GameMode::Trios => 3,
            GameMode::Custom { team_size, .. } => *team_size,
        }
    }

    /// Total players required to form a match.
    pub fn match_size(&self) -> usize {
        (self.team_count() * self.team_size()) as usize
    }
}

impl Default for GameMode {
    fn default() -> Self {
        GameMode::Duel
    }
}

/// Allowed browser origins for the WebSocket handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Exact `Origin` header value to accept. `None` accepts any origin.
    pub origin: Option<String>,
    /// Whether credentialed requests are expected (informational; the
    /// handshake itself carries no cookies we inspect).
    pub credentials: bool,
}

impl CorsConfig {
    /// Check an `Origin` header value against the configured policy.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        match (&self.origin, origin) {
            (None, _) => true,
            (Some(allowed), Some(actual)) => allowed == actual,
            (Some(_), None) => false,
        }
    }
}

/// Token-validation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Require an auth handshake on every new connection.
    pub enabled: bool,
    /// Accept tokenless connections, trusting the client-supplied identity.
    pub allow_anonymous: bool,
    /// Expected audience for Google-issued ID tokens.
    pub google_client_id: Option<String>,
    /// HS256 shared secret (simple deployments and tests).
    pub secret: Option<String>,
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bind address for the WebSocket listener.
    pub bind_addr: SocketAddr,
    /// Browser origin policy.
    pub cors: CorsConfig,
    /// Ticks per second for every match.
    pub tick_rate: u32,
    /// Match composition.
    pub game_mode: GameMode,
    /// Countdown length before a match starts.
    pub countdown_seconds: u32,
    /// Cadence of the matchmaking formation task.
    pub matchmaking_interval_ms: u64,
    /// Silence threshold (in ticks) before a player is reported lagging.
    pub timeout_ticks: u32,
    /// Silence threshold (in ticks) before a player is timed out.
    pub disconnect_ticks: u32,
    /// How far ahead of the current tick commands may be submitted.
    pub max_future_ticks: u32,
    /// Broadcast ticks retained for reconnect replay.
    pub reconnect_history_ticks: u32,
    /// Grace (in ticks) before a partially-reported hash tick is compared,
    /// and the bound on retained hash entries.
    pub hash_window_ticks: u32,
    /// Deadline for the connection handshake (and auth, when enabled).
    pub connection_timeout_ms: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Token validation.
    pub auth: AuthSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9030".parse().expect("static addr"),
            cors: CorsConfig::default(),
            tick_rate: DEFAULT_TICK_RATE,
            game_mode: GameMode::default(),
            countdown_seconds: 3,
            matchmaking_interval_ms: 1000,
            timeout_ticks: 20,
            disconnect_ticks: 60,
            max_future_ticks: 200,
            reconnect_history_ticks: 300,
            hash_window_ticks: 60,
            connection_timeout_ms: 10_000,
            max_connections: 1000,
            auth: AuthSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PHALANX_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.bind_addr = SocketAddr::new(config.bind_addr.ip(), port);
            }
        }
        if let Ok(origin) = std::env::var("PHALANX_CORS_ORIGIN") {
            config.cors.origin = Some(origin);
        }
        if let Some(rate) = env_u32("PHALANX_TICK_RATE") {
            config.tick_rate = rate.max(1);
        }
        if let Ok(mode) = std::env::var("PHALANX_GAME_MODE") {
            if let Some(mode) = GameMode::from_preset(&mode) {
                config.game_mode = mode;
            }
        }
        if let Some(v) = env_u32("PHALANX_COUNTDOWN_SECONDS") {
            config.countdown_seconds = v;
        }
        if let Some(v) = env_u32("PHALANX_MATCHMAKING_INTERVAL_MS") {
            config.matchmaking_interval_ms = v as u64;
        }
        if let Some(v) = env_u32("PHALANX_TIMEOUT_TICKS") {
            config.timeout_ticks = v;
        }
        if let Some(v) = env_u32("PHALANX_DISCONNECT_TICKS") {
            config.disconnect_ticks = v;
        }
        if let Some(v) = env_u32("PHALANX_MAX_FUTURE_TICKS") {
            config.max_future_ticks = v;
        }
        if let Some(v) = env_u32("PHALANX_RECONNECT_HISTORY_TICKS") {
            config.reconnect_history_ticks = v;
        }
        if let Some(v) = env_u32("PHALANX_HASH_WINDOW_TICKS") {
            config.hash_window_ticks = v;
        }
        if let Some(v) = env_u32("PHALANX_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout_ms = v as u64;
        }

        config.auth.enabled = env_flag("PHALANX_AUTH_ENABLED");
        config.auth.allow_anonymous = env_flag("PHALANX_AUTH_ALLOW_ANONYMOUS");
        config.auth.google_client_id = std::env::var("PHALANX_AUTH_GOOGLE_CLIENT_ID").ok();
        config.auth.secret = std::env::var("PHALANX_AUTH_SECRET").ok();

        config
    }

    /// Length of one tick.
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }

    /// One tick in whole milliseconds (threshold arithmetic).
    pub fn tick_duration_ms(&self) -> u64 {
        1000 / self.tick_rate.max(1) as u64
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}
