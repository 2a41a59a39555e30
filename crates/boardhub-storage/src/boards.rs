//! Board registry.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::database::blocking;
use crate::{Error, Result};

// Boards table: key = mac address, value = Board (JSON)
pub(crate) const BOARDS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("boards");

/// Longest accepted MAC address, in characters.
pub const MAX_MAC_ADDRESS_LEN: usize = 32;

/// A registered board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub mac_address: String,
    /// Topic the board listens on for commands.
    pub topic: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Firmware version the board last reported.
    #[serde(default)]
    pub file_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Board {
    pub fn new(mac_address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            topic: topic.into(),
            is_active: true,
            file_version: None,
            created_at: Utc::now(),
        }
    }
}

/// Board persistence used by command handling.
#[async_trait]
pub trait BoardRepository: Send + Sync {
    /// Look up a board by MAC address.
    async fn get(&self, mac_address: &str) -> Result<Option<Board>>;

    /// All boards, ordered by MAC address.
    async fn list(&self) -> Result<Vec<Board>>;

    /// Set the activity flag. Returns `false` if no such board exists.
    async fn update_activity(&self, mac_address: &str, is_active: bool) -> Result<bool>;

    /// Record a reported firmware version. Returns `false` if no such board exists.
    async fn update_firmware_version(&self, mac_address: &str, version: &str) -> Result<bool>;
}

/// Board store backed by redb.
#[derive(Clone)]
pub struct RedbBoardStore {
    db: Arc<Database>,
}

impl RedbBoardStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a new board.
    pub async fn create(&self, board: Board) -> Result<Board> {
        if board.mac_address.trim().is_empty() {
            return Err(Error::InvalidInput("mac address is empty".to_string()));
        }
        if board.mac_address.chars().count() > MAX_MAC_ADDRESS_LEN {
            return Err(Error::InvalidInput(format!(
                "mac address longer than {} characters",
                MAX_MAC_ADDRESS_LEN
            )));
        }
        let db = self.db.clone();
        blocking(move || {
            let json = serde_json::to_string(&board)?;
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(BOARDS_TABLE)?;
                if table.get(board.mac_address.as_str())?.is_some() {
                    return Err(Error::AlreadyExists(board.mac_address.clone()));
                }
                table.insert(board.mac_address.as_str(), json.as_str())?;
            }
            write_txn.commit()?;
            Ok(board)
        })
        .await
    }

    /// Remove a board. Returns whether it existed.
    pub async fn delete(&self, mac_address: &str) -> Result<bool> {
        let db = self.db.clone();
        let mac_address = mac_address.to_string();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let removed = {
                let mut table = write_txn.open_table(BOARDS_TABLE)?;
                let removed = table.remove(mac_address.as_str())?.is_some();
                removed
            };
            write_txn.commit()?;
            Ok(removed)
        })
        .await
    }

    /// Read-modify-write a single board inside one transaction.
    async fn modify<F>(&self, mac_address: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut Board) + Send + 'static,
    {
        let db = self.db.clone();
        let mac_address = mac_address.to_string();
        blocking(move || {
            let write_txn = db.begin_write()?;
            let found = {
                let mut table = write_txn.open_table(BOARDS_TABLE)?;
                let current: Option<Board> = match table.get(mac_address.as_str())? {
                    Some(value) => Some(serde_json::from_str(value.value())?),
                    None => None,
                };
                match current {
                    Some(mut board) => {
                        apply(&mut board);
                        let json = serde_json::to_string(&board)?;
                        table.insert(mac_address.as_str(), json.as_str())?;
                        true
                    }
                    None => false,
                }
            };
            write_txn.commit()?;
            Ok(found)
        })
        .await
    }
}

#[async_trait]
impl BoardRepository for RedbBoardStore {
    async fn get(&self, mac_address: &str) -> Result<Option<Board>> {
        let db = self.db.clone();
        let mac_address = mac_address.to_string();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(BOARDS_TABLE)?;
            match table.get(mac_address.as_str())? {
                Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Board>> {
        let db = self.db.clone();
        blocking(move || {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(BOARDS_TABLE)?;
            let mut boards = Vec::new();
            for item in table.iter()? {
                let (_, value) = item?;
                boards.push(serde_json::from_str(value.value())?);
            }
            Ok(boards)
        })
        .await
    }

    async fn update_activity(&self, mac_address: &str, is_active: bool) -> Result<bool> {
        self.modify(mac_address, move |board| board.is_active = is_active)
            .await
    }

    async fn update_firmware_version(&self, mac_address: &str, version: &str) -> Result<bool> {
        let version = version.to_string();
        self.modify(mac_address, move |board| board.file_version = Some(version))
            .await
    }
}
