//! Mailbox read/write operations, bracketed by IDLE suspension
//!
//! Every operation follows the same shape: stop the supervisor's IDLE
//! wait, run the command sequence under the client lock, then resume
//! idling whether or not the commands succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use mailwatch_imap::{ImapError, MessageSummary};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::supervisor::ConnectionSupervisor;

/// Upper bound on summaries pulled by a full refresh
pub const FRESHEN_WINDOW: u32 = 500;

/// The per-message operations rule actions run against
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Raw RFC 822 body of one message
    async fn get_message(&self, uid: u32) -> EngineResult<Vec<u8>>;
    /// Relocate one message to another folder
    async fn move_message(&self, uid: u32, destination: &str) -> EngineResult<()>;
}

/// Executes fetch/move/delete commands against the supervised session
pub struct FetchWorker {
    supervisor: Arc<ConnectionSupervisor>,
}

impl FetchWorker {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    async fn resume(&self) {
        if let Err(e) = self.supervisor.start_idling().await {
            warn!(
                "Mailbox '{}': failed to resume IDLE: {}",
                self.supervisor.config().name,
                e
            );
        }
    }

    /// Re-select the folder and pull the newest summaries, most recent
    /// last, capped at the freshen window.
    pub async fn freshen_mailbox(&self) -> EngineResult<Vec<MessageSummary>> {
        self.supervisor.stop_idle("freshen").await?;

        let result = async {
            let mut client = self.supervisor.client().lock().await;
            client.select(&self.supervisor.config().folder).await?;
            client.fetch_newest(FRESHEN_WINDOW).await
        }
        .await;

        self.resume().await;
        let summaries = result?;
        debug!(
            "Mailbox '{}': freshened, {} summaries",
            self.supervisor.config().name,
            summaries.len()
        );
        Ok(summaries)
    }

    /// Fetch summaries for the newest `count` messages after a re-select.
    /// The re-select keeps the session's EXISTS view current so the range
    /// covers messages announced while the fetch was queued.
    pub async fn get_new_messages(&self, count: u32) -> EngineResult<Vec<MessageSummary>> {
        self.supervisor.stop_idle("fetch new").await?;

        let result = async {
            let mut client = self.supervisor.client().lock().await;
            client.select(&self.supervisor.config().folder).await?;
            client.fetch_newest(count).await
        }
        .await;

        self.resume().await;
        Ok(result?)
    }

    /// Fetch the raw RFC 822 body for one message
    pub async fn get_message(&self, uid: u32) -> EngineResult<Vec<u8>> {
        self.supervisor.stop_idle("fetch body").await?;

        let result = async {
            let mut client = self.supervisor.client().lock().await;
            client.fetch_body(uid).await
        }
        .await;

        self.resume().await;
        Ok(result?)
    }

    /// Copy a message to another folder, then delete-and-expunge the
    /// original. IMAP has no atomic move; the copy lands first so a
    /// failure between the steps duplicates rather than loses mail.
    pub async fn move_message(&self, uid: u32, destination: &str) -> EngineResult<()> {
        self.supervisor.stop_idle("move").await?;

        let result = async {
            let mut client = self.supervisor.client().lock().await;
            client.uid_copy(uid, destination).await?;
            client.uid_mark_deleted(uid).await?;
            client.expunge().await?;
            Ok::<_, ImapError>(())
        }
        .await;

        self.resume().await;
        result?;
        debug!(
            "Mailbox '{}': moved uid {} to {}",
            self.supervisor.config().name,
            uid,
            destination
        );
        Ok(())
    }

    /// Delete-and-expunge a message in place
    pub async fn delete_message(&self, uid: u32) -> EngineResult<()> {
        self.supervisor.stop_idle("delete").await?;

        let result = async {
            let mut client = self.supervisor.client().lock().await;
            client.uid_mark_deleted(uid).await?;
            client.expunge().await?;
            Ok::<_, ImapError>(())
        }
        .await;

        self.resume().await;
        Ok(result?)
    }
}

#[async_trait]
impl MessageStore for FetchWorker {
    async fn get_message(&self, uid: u32) -> EngineResult<Vec<u8>> {
        FetchWorker::get_message(self, uid).await
    }

    async fn move_message(&self, uid: u32, destination: &str) -> EngineResult<()> {
        FetchWorker::move_message(self, uid, destination).await
    }
}
