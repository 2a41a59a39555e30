//! Durable storage for BoardHub, backed by redb.
//!
//! One database file holds every table:
//! - `locks`: in-flight operation locks and timeout tombstones
//! - `stream`: the append-only reply stream and its consumer groups
//! - `boards`: board registry (activity flag, firmware version)
//! - `firmware`: uploaded firmware file records
//!
//! redb transactions are synchronous; every async method runs its
//! transaction on the blocking pool.

pub mod boards;
pub mod database;
pub mod error;
pub mod firmware;
pub mod locks;
pub mod stream;

pub use boards::{Board, BoardRepository, RedbBoardStore, MAX_MAC_ADDRESS_LEN};
pub use database::open_database;
pub use error::{Error, Result};
pub use firmware::{FirmwareFile, FirmwareStore};
pub use locks::{LockRecord, LockRelease, LockStore, RedbLockStore};
pub use stream::{EntryId, PendingEntry, ReplyStream, StreamEntry, StreamInfo};
