//! Registry owning every running mailbox engine
//!
//! The registry is the only holder of orchestrator instances; nothing in
//! the engine reaches for global state. Reconfiguration is a teardown and
//! rebuild, never an in-place mutation of a running mailbox.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{FilterRule, MailboxConfig};
use crate::journal::Journal;
use crate::orchestrator::{MailboxOrchestrator, MailboxStatus};

pub struct MailboxRegistry {
    journal: Arc<dyn Journal>,
    mailboxes: Mutex<HashMap<u32, Arc<MailboxOrchestrator>>>,
}

impl MailboxRegistry {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            journal,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Construct and start a mailbox engine. Setup runs in the background
    /// (it retries with backoff and can take a while); the returned handle
    /// is usable immediately for status and, once up, for operations.
    pub async fn add(
        &self,
        config: MailboxConfig,
        rules: Vec<FilterRule>,
    ) -> Arc<MailboxOrchestrator> {
        let id = config.id;
        let name = config.name.clone();
        if let Some(previous) = self.mailboxes.lock().await.remove(&id) {
            warn!("Mailbox {} ('{}') replaced while running", id, name);
            previous.shutdown().await;
        }

        let orchestrator = MailboxOrchestrator::new(config, rules, Arc::clone(&self.journal));
        let starter = Arc::clone(&orchestrator);
        tokio::spawn(async move { starter.setup().await });

        self.mailboxes
            .lock()
            .await
            .insert(id, Arc::clone(&orchestrator));
        info!("Mailbox {} ('{}') registered", id, name);
        orchestrator
    }

    /// Stop and drop a mailbox. Returns whether it was registered.
    pub async fn remove(&self, id: u32) -> bool {
        let Some(orchestrator) = self.mailboxes.lock().await.remove(&id) else {
            return false;
        };
        orchestrator.shutdown().await;
        info!("Mailbox {} removed", id);
        true
    }

    /// Apply a changed configuration by rebuilding the mailbox engine
    pub async fn reconfigure(
        &self,
        config: MailboxConfig,
        rules: Vec<FilterRule>,
    ) -> Arc<MailboxOrchestrator> {
        self.remove(config.id).await;
        self.add(config, rules).await
    }

    pub async fn get(&self, id: u32) -> Option<Arc<MailboxOrchestrator>> {
        self.mailboxes.lock().await.get(&id).cloned()
    }

    pub async fn status(&self, id: u32) -> Option<MailboxStatus> {
        let orchestrator = self.get(id).await?;
        Some(orchestrator.status().await)
    }

    /// Status of every registered mailbox, in id order
    pub async fn status_all(&self) -> Vec<MailboxStatus> {
        let handles: Vec<_> = {
            let mailboxes = self.mailboxes.lock().await;
            let mut entries: Vec<_> = mailboxes.iter().map(|(id, o)| (*id, Arc::clone(o))).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };
        let mut statuses = Vec::with_capacity(handles.len());
        for (_, orchestrator) in handles {
            statuses.push(orchestrator.status().await);
        }
        statuses
    }

    /// Shut every mailbox down
    pub async fn shutdown_all(&self) {
        let drained: Vec<_> = self.mailboxes.lock().await.drain().collect();
        for (_, orchestrator) in drained {
            orchestrator.shutdown().await;
        }
    }
}
