//! Command submission entry point.
//!
//! Validates the request against the board registry and firmware records,
//! builds the command message and hands it to the [`Dispatcher`].

use std::sync::Arc;

use boardhub_core::StorageConfig;
use boardhub_storage::{BoardRepository, FirmwareFile, FirmwareStore};
use thiserror::Error;

use crate::dispatcher::{BroadcastOutcome, DispatchOutcome, Dispatcher};
use crate::message::CommandMessage;

/// Command submission errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("board not found: {0}")]
    BoardNotFound(String),

    #[error("firmware file not found: {0}")]
    FirmwareNotFound(String),

    #[error("firmware file missing on disk: {0}")]
    FirmwareMissingOnDisk(String),

    /// Another operation is in flight for the board.
    #[error("operation already in progress for board {0}")]
    Conflict(String),

    #[error("infrastructure error: {0}")]
    Infra(String),
}

impl ApiError {
    /// HTTP-equivalent status for callers that report one.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BoardNotFound(_)
            | ApiError::FirmwareNotFound(_)
            | ApiError::FirmwareMissingOnDisk(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Infra(_) => 500,
        }
    }
}

impl From<boardhub_storage::Error> for ApiError {
    fn from(e: boardhub_storage::Error) -> Self {
        ApiError::Infra(e.to_string())
    }
}

/// Command submission facade.
pub struct CommandApi {
    dispatcher: Arc<Dispatcher>,
    boards: Arc<dyn BoardRepository>,
    firmware: FirmwareStore,
    storage: StorageConfig,
}

impl CommandApi {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        boards: Arc<dyn BoardRepository>,
        firmware: FirmwareStore,
        storage: StorageConfig,
    ) -> Self {
        Self {
            dispatcher,
            boards,
            firmware,
            storage,
        }
    }

    /// Download URL boards use to fetch `file`.
    pub fn firmware_url(&self, file: &FirmwareFile) -> String {
        format!(
            "{}/media/{}",
            self.storage.site_host.trim_end_matches('/'),
            file.path.trim_start_matches('/')
        )
    }

    async fn require_board(&self, mac_address: &str) -> Result<(), ApiError> {
        match self.boards.get(mac_address).await? {
            Some(_) => Ok(()),
            None => Err(ApiError::BoardNotFound(mac_address.to_string())),
        }
    }

    /// Look up a firmware record and check its binary is on disk.
    async fn require_firmware(&self, file_id: &str) -> Result<FirmwareFile, ApiError> {
        let file = self
            .firmware
            .get(file_id)
            .await?
            .ok_or_else(|| ApiError::FirmwareNotFound(file_id.to_string()))?;

        let disk_path = file.disk_path(&self.storage.media_root);
        if !tokio::fs::try_exists(&disk_path).await.unwrap_or(false) {
            tracing::warn!(file_id, path = %disk_path.display(), "firmware binary missing");
            return Err(ApiError::FirmwareMissingOnDisk(file.path.clone()));
        }
        Ok(file)
    }

    fn single(mac_address: &str, outcome: DispatchOutcome) -> Result<String, ApiError> {
        match outcome {
            DispatchOutcome::Accepted { job_id } => Ok(job_id),
            DispatchOutcome::Conflict => Err(ApiError::Conflict(mac_address.to_string())),
            DispatchOutcome::InfraError(e) => Err(ApiError::Infra(e)),
        }
    }

    /// Switch a board on or off. Returns the job id.
    pub async fn set_state(&self, mac_address: &str, value: bool) -> Result<String, ApiError> {
        self.require_board(mac_address).await?;
        let outcome = self
            .dispatcher
            .dispatch(mac_address, &CommandMessage::state(value))
            .await;
        Self::single(mac_address, outcome)
    }

    /// Flash one board with a stored firmware file. Returns the job id.
    pub async fn flash_single(
        &self,
        mac_address: &str,
        file_id: &str,
    ) -> Result<String, ApiError> {
        self.require_board(mac_address).await?;
        let file = self.require_firmware(file_id).await?;
        let command = CommandMessage::firmware(self.firmware_url(&file), file.version.clone());
        let outcome = self.dispatcher.dispatch(mac_address, &command).await;
        Self::single(mac_address, outcome)
    }

    /// Flash every registered board with one broadcast command.
    pub async fn flash_all(&self, file_id: &str) -> Result<BroadcastOutcome, ApiError> {
        let file = self.require_firmware(file_id).await?;
        let device_ids: Vec<String> = self
            .boards
            .list()
            .await?
            .into_iter()
            .map(|board| board.mac_address)
            .collect();

        let command = CommandMessage::firmware(self.firmware_url(&file), file.version.clone());
        let outcome = self.dispatcher.dispatch_broadcast(&device_ids, &command).await;
        match &outcome.publish_error {
            Some(e) => Err(ApiError::Infra(e.clone())),
            None => Ok(outcome),
        }
    }
}
