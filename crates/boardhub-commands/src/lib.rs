//! Command coordination for BoardHub.
//!
//! Commands go out through the [`Dispatcher`], which holds a per-device lock
//! for as long as the command is in flight. Each lock is released either by
//! the [`Reconciler`] when the board replies or by the [`Watchdog`] when the
//! reply deadline passes. [`CommandApi`] is the entry point for callers.

pub mod api;
pub mod dispatcher;
pub mod message;
pub mod reconciler;
pub mod reply;
pub mod watchdog;

pub use api::{ApiError, CommandApi};
pub use dispatcher::{BroadcastOutcome, DispatchOutcome, Dispatcher};
pub use message::CommandMessage;
pub use reconciler::{EntryOutcome, Reconciler};
pub use reply::{Reply, ReplyError};
pub use watchdog::Watchdog;
