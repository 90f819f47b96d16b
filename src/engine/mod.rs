//! Match Engine Core
//!
//! The deterministic-ordering heart of the coordinator, free of any
//! networking. Everything here is plain synchronous state driven by the
//! server's loops:
//!
//! - `command`: per-tick command store with the acceptance window
//! - `queue`: FIFO matchmaking queue and batch formation
//! - `activity`: tick-denominated liveness state machine
//! - `history`: bounded broadcast record for reconnect replay
//! - `desync`: per-tick state-hash comparison
//! - `events`: typed observer surface for embedders

pub mod activity;
pub mod command;
pub mod desync;
pub mod events;
pub mod history;
pub mod queue;

pub use activity::{ActivityState, ActivityThresholds, Liveness, LivenessEvent};
pub use command::{Command, CommandBuffer, CommandRejected, Tick};
pub use desync::{DesyncOracle, DesyncReport};
pub use events::{EngineEvent, EventBus, Subscription};
pub use history::{BroadcastHistory, TickBatch};
pub use queue::{MatchmakingQueue, QueueError, QueueStatus, QueuedPlayer};
