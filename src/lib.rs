//! # boardsync
//!
//! Synchronization and persistence core for a collaborative canvas:
//! optimistic local mutation, low-latency change broadcast, per-field
//! last-writer-wins conflict resolution over hybrid logical clocks, and
//! durable persistence with bounded retry and rollback.
//!
//! ```text
//! ┌──────────┐   stamp + apply   ┌─────────────┐  batch + coalesce  ┌──────────┐
//! │  caller  │ ────────────────► │  SyncEngine │ ─────────────────► │ Realtime │
//! │ (UI/API) │ ◄──── events ──── │             │ ◄──── debounced ── │ channel  │
//! └──────────┘                   └──────┬──────┘                    └──────────┘
//!                                       │ retried, rolled back on failure
//!                                       ▼
//!                               ┌──────────────┐
//!                               │ DurableStore │
//!                               │ Memory/Rocks │
//!                               └──────────────┘
//! ```
//!
//! Layers, bottom up:
//!
//! - [`clock`] — hybrid logical clocks and per-field clock bookkeeping
//! - [`object`] — the board object model and field-scoped patches
//! - [`change`] — change descriptors and the pre-send coalescer
//! - [`wire`] / [`channel`] — the encoded envelope and channel seam
//! - [`broadcast`] — outbound batching timers and inbound debounce
//! - [`storage`] — the durable store seam and its two implementations
//! - [`engine`] — the synchronization engine tying it all together
//!
//! Convergence guarantee: two clients applying the same set of change
//! descriptors, in any order, settle every field to the value carrying
//! the greatest clock. Disconnect gaps are healed by
//! [`engine::SyncEngine::reconcile_on_reconnect`], not by individual
//! message delivery.

pub mod broadcast;
pub mod change;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod object;
pub mod storage;
pub mod wire;

pub use broadcast::{BroadcastConfig, BroadcastTransport, TransportStats};
pub use change::{coalesce, Change};
pub use channel::{LoopbackChannel, RealtimeChannel, WebSocketChannel};
pub use clock::{ClockValue, FieldClockStore, FieldClocks, HybridClock};
pub use engine::{DeleteMode, EngineConfig, EngineEvent, Role, SyncEngine};
pub use object::{BoardObject, ObjectKind, ObjectPatch};
pub use storage::{DurableStore, MemoryStore, RocksStore, RocksStoreConfig, StoreError, StoredRow};
pub use wire::{ChannelError, WireMessage};
