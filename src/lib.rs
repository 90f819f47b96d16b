//! # Phalanx Engine
//!
//! Game-agnostic deterministic lockstep match coordinator.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PHALANX SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs       - Presets, thresholds, env loading          │
//! │                                                              │
//! │  engine/         - Ordering & liveness core (no I/O)         │
//! │  ├── command.rs  - Command buffer, acceptance window         │
//! │  ├── queue.rs    - FIFO matchmaking queue                    │
//! │  ├── activity.rs - Lagging/timeout state machine             │
//! │  ├── history.rs  - Broadcast window for reconnect replay     │
//! │  ├── desync.rs   - State-hash comparison                     │
//! │  └── events.rs   - Embedder event surface                    │
//! │                                                              │
//! │  network/        - Transport & coordination (async)          │
//! │  ├── protocol.rs - Tagged JSON wire events                   │
//! │  ├── transport.rs- Per-client non-blocking outbox            │
//! │  ├── auth.rs     - Pluggable token validation                │
//! │  ├── session.rs  - Per-match state + registry                │
//! │  └── server.rs   - Accept/route/matchmake/tick loops         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lockstep Guarantee
//!
//! The server never simulates the game. It guarantees that every client of
//! a match receives the **identical** ordered command batch for every tick:
//! player ids ascending, per-player submission order preserved, stamped
//! server-side. Given that stream and the forwarded seed, deterministic
//! clients reach identical states; the desync oracle reports when they
//! don't.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod network;

// Re-export commonly used types
pub use config::{AuthSettings, CorsConfig, EngineConfig, GameMode, DEFAULT_TICK_RATE};
pub use engine::command::{Command, CommandBuffer, CommandRejected, Tick};
pub use engine::events::{EngineEvent, EventBus, Subscription};
pub use engine::queue::{MatchmakingQueue, QueueStatus};
pub use network::server::{GameServer, GameServerError};
pub use network::session::{MatchId, MatchRegistry, MatchSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
