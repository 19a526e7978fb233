//! Per-mailbox orchestration: setup stages, signal pump, recovery
//!
//! The orchestrator wires supervisor, fetch worker, outbound channel and
//! filter engine together at construction time, drives setup as a series
//! of retried stages, and pumps protocol signals into state updates,
//! journal entries, notifications and filter runs. Every recorded failure
//! counts against a hard exception budget; exhausting it aborts the
//! process rather than letting a wedged engine limp along.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coalesce::BurstCoalescer;
use crate::config::{FilterRule, MailboxConfig};
use crate::content::extract_content;
use crate::error::EngineResult;
use crate::fetch::FetchWorker;
use crate::filter::MessageFilterEngine;
use crate::journal::Journal;
use crate::notify::{dispatch, EventKind, NotificationEvent, NotificationSink};
use crate::outbound::{build_forward, OutboundMailChannel};
use crate::state::MailboxState;
use crate::supervisor::{ConnectionSupervisor, MailboxSignal};

/// First retry delay for a failed setup stage
const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
/// Retry delay ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(160);
/// Recorded exceptions tolerated before the process gives up
pub const EXCEPTION_BUDGET: usize = 100;
/// Signal channel depth between protocol components and the pump
const SIGNAL_DEPTH: usize = 64;

/// Doubling backoff with a ceiling
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
        }
    }

    /// Current delay; doubles for the next call up to the cap
    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_CAP);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Health snapshot for one mailbox
#[derive(Debug, Clone, Serialize)]
pub struct MailboxStatus {
    pub mailbox_id: u32,
    pub name: String,
    pub watch_connected: bool,
    /// LOGIN succeeded on the current IMAP session
    pub watch_authenticated: bool,
    pub idling: bool,
    /// SMTP transport built and probed; lettre authenticates inside each
    /// send/probe exchange, so there is no separate flag for that channel
    pub send_connected: bool,
    pub started_at: DateTime<Utc>,
    pub exception_count: usize,
    /// All of the above healthy at once
    pub green: bool,
}

/// Drives one watched mailbox end to end
pub struct MailboxOrchestrator {
    config: Arc<MailboxConfig>,
    supervisor: Arc<ConnectionSupervisor>,
    fetcher: Arc<FetchWorker>,
    outbound: Arc<OutboundMailChannel>,
    filter: Mutex<Option<Arc<MessageFilterEngine>>>,
    rules: Vec<FilterRule>,
    state: Arc<Mutex<MailboxState>>,
    coalescer: Arc<BurstCoalescer>,
    sinks: Mutex<Vec<Arc<dyn NotificationSink>>>,
    journal: Arc<dyn Journal>,
    exceptions: Mutex<Vec<String>>,
    signals_rx: Mutex<Option<mpsc::Receiver<MailboxSignal>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    started_at: DateTime<Utc>,
}

impl MailboxOrchestrator {
    /// Build the component graph for one mailbox. Channel wiring happens
    /// here, once; components cannot re-subscribe, so signal delivery is
    /// idempotent by construction.
    pub fn new(
        config: MailboxConfig,
        rules: Vec<FilterRule>,
        journal: Arc<dyn Journal>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_DEPTH);

        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&config),
            signals_tx.clone(),
        ));
        let fetcher = Arc::new(FetchWorker::new(Arc::clone(&supervisor)));
        let outbound = Arc::new(OutboundMailChannel::new(Arc::clone(&config), signals_tx));

        Arc::new(Self {
            config,
            supervisor,
            fetcher,
            outbound,
            filter: Mutex::new(None),
            rules,
            state: Arc::new(Mutex::new(MailboxState::new())),
            coalescer: Arc::new(BurstCoalescer::default()),
            sinks: Mutex::new(Vec::new()),
            journal,
            exceptions: Mutex::new(Vec::new()),
            signals_rx: Mutex::new(Some(signals_rx)),
            pump: Mutex::new(None),
            running: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Bring the mailbox up: connect both channels, take the initial
    /// snapshot, start the signal pump, then filter the backlog. Each
    /// stage retries with backoff until it succeeds, so setup only
    /// returns once the mailbox is actually watching (or the exception
    /// budget aborts the process).
    pub async fn setup(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Mailbox '{}': already running", self.config.name);
            return;
        }
        info!("Mailbox '{}': starting", self.config.name);

        self.retry_stage("client setup", || async {
            self.supervisor.setup(false).await?;
            self.outbound.setup().await
        })
        .await;

        self.retry_stage("initial refresh", || async {
            let fresh = self.fetcher.freshen_mailbox().await?;
            self.apply_full_refresh(fresh).await;
            Ok(())
        })
        .await;

        self.spawn_pump().await;

        match self.supervisor.get_mail_folders().await {
            Ok(folders) => debug!(
                "Mailbox '{}': {} folders visible",
                self.config.name,
                folders.len()
            ),
            Err(e) => {
                self.record_exception(&format!("folder listing: {}", e))
                    .await
            }
        }

        let engine = Arc::new(MessageFilterEngine::new(
            self.config.name.clone(),
            self.config.send_as.clone(),
            self.rules.clone(),
            Arc::clone(&self.fetcher) as Arc<dyn crate::fetch::MessageStore>,
            Arc::clone(&self.outbound),
            Arc::clone(&self.journal),
        ));
        if engine.has_rules() {
            let snapshot = self.state.lock().await.emails().to_vec();
            let backlog_engine = Arc::clone(&engine);
            let name = self.config.name.clone();
            tokio::spawn(async move {
                info!("Mailbox '{}': filtering {} backlog messages", name, snapshot.len());
                backlog_engine.filter_all(&snapshot).await;
            });
        }
        *self.filter.lock().await = Some(engine);

        // A completed setup starts the budget over
        self.exceptions.lock().await.clear();
        info!("Mailbox '{}': watching", self.config.name);
    }

    /// Retry one setup stage until it succeeds, recording each failure
    async fn retry_stage<'a, F, Fut>(&'a self, stage: &str, mut op: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<()>> + 'a,
    {
        let mut backoff = Backoff::new();
        loop {
            match op().await {
                Ok(()) => return,
                Err(e) => {
                    self.record_exception(&format!("{}: {}", stage, e)).await;
                    let delay = backoff.next();
                    warn!(
                        "Mailbox '{}': {} failed ({}); retrying in {:?}",
                        self.config.name, stage, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Record a failure against the budget. Keepalive failures do not go
    /// through here; they are the one tolerated recurring fault.
    async fn record_exception(&self, detail: &str) {
        let count = {
            let mut exceptions = self.exceptions.lock().await;
            exceptions.push(detail.to_string());
            exceptions.len()
        };
        if count > EXCEPTION_BUDGET {
            error!(
                "Mailbox '{}': exception budget exhausted ({} recorded), aborting: {}",
                self.config.name, count, detail
            );
            std::process::exit(1);
        }
    }

    async fn spawn_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.signals_rx.lock().await.take() else {
            return;
        };
        let this = Arc::clone(self);
        *self.pump.lock().await = Some(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                match signal {
                    MailboxSignal::Arrived { count } => {
                        let this = Arc::clone(&this);
                        tokio::spawn(async move { this.handle_arrival(count).await });
                    }
                    MailboxSignal::Expunged { seq } => this.handle_expunge(seq).await,
                    MailboxSignal::Seen { seq } => this.handle_seen(seq).await,
                    MailboxSignal::Fault { error } => {
                        this.record_exception(&format!("watch fault: {}", error))
                            .await;
                        this.recover().await;
                    }
                    MailboxSignal::KeepaliveFailure { error } => {
                        warn!(
                            "Mailbox '{}': outbound keepalive failed ({}); rebuilding",
                            this.config.name, error
                        );
                        this.outbound.rebuild().await;
                    }
                }
            }
        }));
    }

    /// Coalesce the arrival with any concurrent ones, then fetch the
    /// combined tail and merge it
    async fn handle_arrival(&self, count: u32) {
        let Some(total) = self.coalescer.note(count).await else {
            return;
        };
        match self.fetcher.get_new_messages(total).await {
            Ok(batch) => self.merge_delta(batch).await,
            Err(e) => {
                self.record_exception(&format!("arrival fetch: {}", e))
                    .await
            }
        }
    }

    async fn handle_expunge(&self, seq: u32) {
        let removed = self.state.lock().await.apply_expunge(seq);
        if let Some(summary) = removed {
            self.journal.log_removed(&summary).await;
            self.emit(EventKind::Removed, summary).await;
        }
    }

    async fn handle_seen(&self, seq: u32) {
        let summary = self.state.lock().await.get_by_seq(seq).cloned();
        if let Some(summary) = summary {
            self.journal.log_seen(&summary).await;
            self.emit(EventKind::Seen, summary).await;
        }
    }

    /// Full watch-side reset after a fatal fault: tear the session down,
    /// reconnect with backoff, re-snapshot.
    async fn recover(&self) {
        warn!("Mailbox '{}': recovering watch channel", self.config.name);
        self.supervisor.destroy().await;

        self.retry_stage("recovery reconnect", || async {
            self.supervisor.setup(false).await
        })
        .await;
        self.retry_stage("recovery refresh", || async {
            let fresh = self.fetcher.freshen_mailbox().await?;
            self.apply_full_refresh(fresh).await;
            Ok(())
        })
        .await;
        info!("Mailbox '{}': watch channel recovered", self.config.name);
    }

    /// Swap in a fresh snapshot and surface the diff
    async fn apply_full_refresh(&self, fresh: Vec<mailwatch_imap::MessageSummary>) {
        let outcome = self.state.lock().await.apply_full_refresh(fresh);
        for summary in outcome.received {
            // The journal gates notifications: an identity already on
            // record was only rediscovered, not received
            if self.journal.log_received(&summary).await {
                self.emit(EventKind::Received, summary).await;
            }
        }
        for summary in outcome.removed {
            self.journal.log_removed(&summary).await;
            self.emit(EventKind::Removed, summary).await;
        }
    }

    /// Merge a delta fetch; new entries get journaled, notified, filtered
    async fn merge_delta(&self, batch: Vec<mailwatch_imap::MessageSummary>) {
        let added = self.state.lock().await.merge_new(batch);
        if added.is_empty() {
            return;
        }
        for summary in &added {
            if self.journal.log_received(summary).await {
                self.emit(EventKind::Received, summary.clone()).await;
            }
        }
        let engine = self.filter.lock().await.clone();
        if let Some(engine) = engine {
            if engine.has_rules() {
                tokio::spawn(async move { engine.filter_all(&added).await });
            }
        }
    }

    async fn emit(&self, kind: EventKind, summary: mailwatch_imap::MessageSummary) {
        let sinks = self.sinks.lock().await.clone();
        let event = NotificationEvent {
            kind,
            summary,
            mailbox_name: self.config.name.clone(),
        };
        dispatch(&sinks, &event).await;
    }

    /// Attach a notification sink; effective for all later events
    pub async fn add_notification(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.lock().await.push(sink);
    }

    /// Raw body of a tracked message
    pub async fn get_message(&self, uid: u32) -> EngineResult<Vec<u8>> {
        self.fetcher.get_message(uid).await
    }

    /// Forward a tracked message on demand, optionally moving it to a
    /// folder afterwards. Returns whether the relay accepted the send;
    /// the move proceeds only on acceptance here, unlike rule-driven
    /// forwards where the move stands on its own.
    pub async fn send_mail(&self, uid: u32, destination: &str, move_to: Option<&str>) -> bool {
        let summary = match self.state.lock().await.get_by_uid(uid) {
            Some(s) => s.clone(),
            None => {
                warn!(
                    "Mailbox '{}': send_mail for untracked uid {}",
                    self.config.name, uid
                );
                return false;
            }
        };
        let content = match self.fetcher.get_message(uid).await.and_then(|raw| {
            extract_content(&raw)
        }) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Mailbox '{}': could not load uid {} for sending: {}",
                    self.config.name, uid, e
                );
                return false;
            }
        };

        let forward = build_forward(
            &self.config.name,
            &self.config.send_as,
            &summary,
            &content,
            destination,
        );
        if !self.outbound.send_mail(forward).await {
            return false;
        }

        let mut moved = false;
        if let Some(folder) = move_to {
            match self.fetcher.move_message(uid, folder).await {
                Ok(()) => {
                    self.state.lock().await.remove_by_uid(uid);
                    moved = true;
                }
                Err(e) => warn!(
                    "Mailbox '{}': post-send move of uid {} failed: {}",
                    self.config.name, uid, e
                ),
            }
        }
        self.journal.log_sent(&summary, destination, moved).await;
        true
    }

    /// Move a tracked message to another folder
    pub async fn move_message(&self, uid: u32, folder: &str, actor: &str) -> EngineResult<()> {
        let summary = self.state.lock().await.get_by_uid(uid).cloned();
        self.fetcher.move_message(uid, folder).await?;
        if let Some(summary) = summary {
            self.state.lock().await.remove_by_uid(uid);
            self.journal
                .log_changed(&summary, actor, &format!("moved to {}", folder))
                .await;
        }
        Ok(())
    }

    /// Messages currently tracked in the watched folder
    pub async fn emails(&self) -> Vec<mailwatch_imap::MessageSummary> {
        self.state.lock().await.emails().to_vec()
    }

    pub async fn status(&self) -> MailboxStatus {
        let watch_connected = self.supervisor.is_connected();
        let watch_authenticated = self.supervisor.is_authenticated();
        let idling = self.supervisor.is_idle();
        let send_connected = self.outbound.is_connected().await;
        MailboxStatus {
            mailbox_id: self.config.id,
            name: self.config.name.clone(),
            watch_connected,
            watch_authenticated,
            idling,
            send_connected,
            started_at: self.started_at,
            exception_count: self.exceptions.lock().await.len(),
            green: watch_connected && watch_authenticated && idling && send_connected,
        }
    }

    /// Stop all background work and close both channels
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Mailbox '{}': shutting down", self.config.name);
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.supervisor.destroy().await;
        self.outbound.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;

    fn config() -> MailboxConfig {
        MailboxConfig {
            id: 3,
            name: "ops".into(),
            imap_host: "imap.example".into(),
            imap_port: 993,
            imap_tls: true,
            username: "u".into(),
            password: "p".into(),
            folder: "INBOX".into(),
            smtp_host: "smtp.example".into(),
            smtp_port: 587,
            smtp_username: "u".into(),
            smtp_password: "p".into(),
            send_as: "watcher@example".into(),
        }
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        let seq: Vec<u64> = (0..7).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(seq, vec![5, 10, 20, 40, 80, 160, 160]);
    }

    #[tokio::test]
    async fn status_is_not_green_before_setup() {
        let orchestrator = MailboxOrchestrator::new(
            config(),
            Vec::new(),
            Arc::new(MemoryJournal::new()),
        );
        let status = orchestrator.status().await;
        assert_eq!(status.mailbox_id, 3);
        assert!(!status.watch_connected);
        assert!(!status.watch_authenticated);
        assert!(!status.idling);
        assert!(!status.send_connected);
        assert!(!status.green);
        assert_eq!(status.exception_count, 0);
    }

    #[tokio::test]
    async fn exceptions_accumulate_below_budget() {
        let orchestrator = MailboxOrchestrator::new(
            config(),
            Vec::new(),
            Arc::new(MemoryJournal::new()),
        );
        for i in 0..5 {
            orchestrator
                .record_exception(&format!("failure {}", i))
                .await;
        }
        assert_eq!(orchestrator.status().await.exception_count, 5);
    }

    #[tokio::test]
    async fn shutdown_before_setup_is_a_noop() {
        let orchestrator = MailboxOrchestrator::new(
            config(),
            Vec::new(),
            Arc::new(MemoryJournal::new()),
        );
        orchestrator.shutdown().await;
        assert!(!orchestrator.running.load(Ordering::SeqCst));
    }
}
