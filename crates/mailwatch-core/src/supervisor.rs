//! Connection supervisor: owns one IMAP session and its IDLE lifecycle
//!
//! State machine: Disconnected -> Connecting -> Idling <-> StoppingIdle,
//! with Recovering reachable from anywhere on a fatal signal. The session
//! sits in IDLE between commands; commands suspend it through
//! `stop_idle` / `start_idling`. Servers cap IDLE duration, so the
//! background task rotates the IDLE command every 9 minutes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mailwatch_imap::{Folder, IdleEvent, ImapClient, ImapError};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MailboxConfig;
use crate::error::{EngineError, EngineResult};

/// Servers may drop IDLE sessions held longer than ~10 minutes
pub const IDLE_ROTATION: Duration = Duration::from_secs(9 * 60);
/// Read quantum inside the IDLE wait; bounds done/cancel latency
const IDLE_WAIT_QUANTUM: Duration = Duration::from_secs(2);
/// Bound on waiting for the IDLE task to acknowledge a stop
const STOP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Signals emitted by the protocol components toward the orchestrator
#[derive(Debug, Clone)]
pub enum MailboxSignal {
    /// New messages arrived; `count` is the observed EXISTS growth
    Arrived { count: u32 },
    /// Message expunged at a 1-based folder position
    Expunged { seq: u32 },
    /// Message at a 1-based folder position was marked seen
    Seen { seq: u32 },
    /// Fatal failure requiring a full component reset
    Fault { error: String },
    /// Outbound keepalive probe failed; rebuild the channel, keep it out
    /// of the recorded exception list
    KeepaliveFailure { error: String },
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Idling,
    StoppingIdle,
    Recovering,
}

struct IdleHandle {
    done: watch::Sender<bool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Supervises one IMAP session for one mailbox
pub struct ConnectionSupervisor {
    config: Arc<MailboxConfig>,
    client: Arc<Mutex<ImapClient>>,
    signals: mpsc::Sender<MailboxSignal>,
    idle: Mutex<Option<IdleHandle>>,
    /// Single-admission gate: concurrent stop requests collapse into one
    stop_gate: Mutex<()>,
    idling: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
    state: std::sync::Mutex<SupervisorState>,
}

impl ConnectionSupervisor {
    pub fn new(config: Arc<MailboxConfig>, signals: mpsc::Sender<MailboxSignal>) -> Self {
        Self {
            config,
            client: Arc::new(Mutex::new(ImapClient::new())),
            signals,
            idle: Mutex::new(None),
            stop_gate: Mutex::new(()),
            idling: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            authenticated: Arc::new(AtomicBool::new(false)),
            state: std::sync::Mutex::new(SupervisorState::Disconnected),
        }
    }

    fn set_state(&self, next: SupervisorState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != next {
            debug!("Mailbox '{}': {:?} -> {:?}", self.config.name, *state, next);
            *state = next;
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn client(&self) -> &Arc<Mutex<ImapClient>> {
        &self.client
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Connect, authenticate, open the watched folder, and start idling.
    ///
    /// With `is_recovery` set, failures are reported on the signal channel
    /// instead of raised: background recovery is best-effort, only an
    /// explicit caller demands success.
    pub async fn setup(&self, is_recovery: bool) -> EngineResult<()> {
        self.set_state(if is_recovery {
            SupervisorState::Recovering
        } else {
            SupervisorState::Connecting
        });

        match self.open_session().await {
            Ok(()) => self.start_idling().await,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                self.authenticated.store(false, Ordering::SeqCst);
                self.set_state(SupervisorState::Disconnected);
                if is_recovery {
                    warn!(
                        "Mailbox '{}': recovery setup failed: {}",
                        self.config.name, e
                    );
                    let _ = self
                        .signals
                        .send(MailboxSignal::Fault {
                            error: e.to_string(),
                        })
                        .await;
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn open_session(&self) -> EngineResult<()> {
        let cfg = &self.config;
        let mut client = self.client.lock().await;
        client
            .connect(&cfg.imap_host, cfg.imap_port, cfg.imap_tls)
            .await?;
        self.connected.store(true, Ordering::SeqCst);
        client.login(&cfg.username, &cfg.password).await?;
        self.authenticated.store(true, Ordering::SeqCst);
        let exists = client.select(&cfg.folder).await?;
        info!(
            "Mailbox '{}': opened {} with {} messages",
            cfg.name, cfg.folder, exists
        );
        Ok(())
    }

    /// Launch the background IDLE wait. No-op when already idling.
    pub async fn start_idling(&self) -> EngineResult<()> {
        if self.idling.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let ctx = IdleTaskCtx {
            client: Arc::clone(&self.client),
            config: Arc::clone(&self.config),
            signals: self.signals.clone(),
            idling: Arc::clone(&self.idling),
            connected: Arc::clone(&self.connected),
            authenticated: Arc::clone(&self.authenticated),
            done: done_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(idle_task(ctx));

        *self.idle.lock().await = Some(IdleHandle {
            done: done_tx,
            cancel,
            task,
        });
        self.set_state(SupervisorState::Idling);
        debug!("Mailbox '{}': idling", self.config.name);
        Ok(())
    }

    /// End the background IDLE wait cleanly. Concurrent callers collapse
    /// into one in-flight stop; all of them observe its completion.
    pub async fn stop_idle(&self, reason: &str) -> EngineResult<()> {
        let _gate = self.stop_gate.lock().await;

        let handle = self.idle.lock().await.take();
        let Some(handle) = handle else {
            debug!(
                "Mailbox '{}': stop_idle({}) with no IDLE in flight",
                self.config.name, reason
            );
            return Ok(());
        };

        self.set_state(SupervisorState::StoppingIdle);
        debug!("Mailbox '{}': stopping IDLE ({})", self.config.name, reason);

        let _ = handle.done.send(true);
        match tokio::time::timeout(STOP_IDLE_TIMEOUT, handle.task).await {
            Ok(Ok(())) => {}
            // A cancelled IDLE task is a clean stop, not an error
            Ok(Err(join_err)) if join_err.is_cancelled() => {}
            Ok(Err(join_err)) => {
                warn!(
                    "Mailbox '{}': IDLE task ended abnormally: {}",
                    self.config.name, join_err
                );
            }
            Err(_) => {
                warn!(
                    "Mailbox '{}': IDLE task ignored stop for {:?}; cancelling hard",
                    self.config.name, STOP_IDLE_TIMEOUT
                );
                handle.cancel.cancel();
            }
        }

        self.idling.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Walk the folder hierarchy, suspending IDLE around the listing
    pub async fn get_mail_folders(&self) -> EngineResult<Vec<Folder>> {
        self.stop_idle("list folders").await?;

        let result = async {
            let mut client = self.client.lock().await;
            client.close().await?;
            let folders = client.list_folders().await?;
            client.select(&self.config.folder).await?;
            Ok::<_, ImapError>(folders)
        }
        .await;

        self.start_idling().await?;
        Ok(result?)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether LOGIN succeeded on the current session
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.idling.load(Ordering::SeqCst)
    }

    /// Forcibly close the session and stop all background work
    pub async fn destroy(&self) {
        if let Some(handle) = self.idle.lock().await.take() {
            handle.cancel.cancel();
            let _ = handle.done.send(true);
        }
        self.idling.store(false, Ordering::SeqCst);

        let mut client = self.client.lock().await;
        let _ = client.logout().await;
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.set_state(SupervisorState::Disconnected);
        info!("Mailbox '{}': session destroyed", self.config.name);
    }
}

struct IdleTaskCtx {
    client: Arc<Mutex<ImapClient>>,
    config: Arc<MailboxConfig>,
    signals: mpsc::Sender<MailboxSignal>,
    idling: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    cancel: CancellationToken,
}

/// Background IDLE wait. Holds the client lock for its whole lifetime so
/// that exactly one stop -> command -> resume sequence can run at a time.
async fn idle_task(ctx: IdleTaskCtx) {
    let mut client = ctx.client.lock().await;
    let mut known_exists = client.exists();

    'session: loop {
        if let Err(e) = client.idle_start().await {
            fail(&ctx, e.into()).await;
            return;
        }
        let rotate_at = tokio::time::Instant::now() + IDLE_ROTATION;

        loop {
            if ctx.cancel.is_cancelled() {
                // Hard abort: stream state is unknown, do not send DONE
                ctx.idling.store(false, Ordering::SeqCst);
                return;
            }
            if *ctx.done.borrow() {
                match client.idle_done().await {
                    Ok(trailing) => {
                        // Events that raced the DONE still get delivered
                        for event in trailing {
                            if !deliver(&ctx, event, &mut known_exists).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Mailbox '{}': DONE failed: {}", ctx.config.name, e)
                    }
                }
                ctx.idling.store(false, Ordering::SeqCst);
                return;
            }

            if tokio::time::Instant::now() >= rotate_at {
                debug!("Mailbox '{}': rotating IDLE", ctx.config.name);
                let healthy = match client.idle_done().await {
                    Ok(trailing) => {
                        let mut alive = true;
                        for event in trailing {
                            alive = deliver(&ctx, event, &mut known_exists).await;
                            if !alive {
                                break;
                            }
                        }
                        if !alive {
                            return;
                        }
                        client.noop().await.is_ok()
                    }
                    Err(_) => false,
                };
                if !healthy {
                    info!(
                        "Mailbox '{}': session lost at rotation; reconnecting",
                        ctx.config.name
                    );
                    if let Err(e) = reopen(&mut client, &ctx.config).await {
                        ctx.connected.store(false, Ordering::SeqCst);
                        ctx.authenticated.store(false, Ordering::SeqCst);
                        fail(&ctx, e).await;
                        return;
                    }
                    known_exists = client.exists();
                }
                continue 'session;
            }

            match client.idle_wait(IDLE_WAIT_QUANTUM).await {
                Ok(Some(event)) => {
                    if !deliver(&ctx, event, &mut known_exists).await {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    ctx.connected.store(false, Ordering::SeqCst);
                    ctx.authenticated.store(false, Ordering::SeqCst);
                    fail(&ctx, e.into()).await;
                    return;
                }
            }
        }
    }
}

async fn reopen(client: &mut ImapClient, cfg: &MailboxConfig) -> EngineResult<()> {
    client
        .connect(&cfg.imap_host, cfg.imap_port, cfg.imap_tls)
        .await?;
    client.login(&cfg.username, &cfg.password).await?;
    client.select(&cfg.folder).await?;
    Ok(())
}

/// Turn one pushed event into a signal. Returns false when the event
/// ended the session; a BYE can surface here from the live wait or from
/// the trailing events a DONE collects, and both paths must stop.
async fn deliver(ctx: &IdleTaskCtx, event: IdleEvent, known_exists: &mut u32) -> bool {
    match event {
        IdleEvent::Exists(n) => {
            if n > *known_exists {
                let count = n - *known_exists;
                info!(
                    "Mailbox '{}': {} new message(s) announced",
                    ctx.config.name, count
                );
                let _ = ctx.signals.send(MailboxSignal::Arrived { count }).await;
            }
            *known_exists = n;
            true
        }
        IdleEvent::Expunged(seq) => {
            *known_exists = known_exists.saturating_sub(1);
            let _ = ctx.signals.send(MailboxSignal::Expunged { seq }).await;
            true
        }
        IdleEvent::Seen(seq) => {
            let _ = ctx.signals.send(MailboxSignal::Seen { seq }).await;
            true
        }
        IdleEvent::Bye => {
            ctx.connected.store(false, Ordering::SeqCst);
            ctx.authenticated.store(false, Ordering::SeqCst);
            fail(ctx, EngineError::Idle("server said BYE".to_string())).await;
            false
        }
    }
}

/// IDLE faults always force a full reset upstream; the wait is never
/// silently retried in place.
async fn fail(ctx: &IdleTaskCtx, error: EngineError) {
    warn!("Mailbox '{}': IDLE fault: {}", ctx.config.name, error);
    ctx.idling.store(false, Ordering::SeqCst);
    let _ = ctx
        .signals
        .send(MailboxSignal::Fault {
            error: error.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;

    fn config() -> Arc<MailboxConfig> {
        Arc::new(MailboxConfig {
            id: 1,
            name: "test".into(),
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
        })
    }

    fn unreachable_config() -> Arc<MailboxConfig> {
        let mut cfg = (*config()).clone();
        // Nothing listens on port 1; connect fails without leaving the host
        cfg.imap_host = "127.0.0.1".into();
        cfg.imap_port = 1;
        cfg.imap_tls = false;
        Arc::new(cfg)
    }

    fn idle_ctx(signals: mpsc::Sender<MailboxSignal>) -> IdleTaskCtx {
        let (_done_tx, done_rx) = watch::channel(false);
        IdleTaskCtx {
            client: Arc::new(Mutex::new(ImapClient::new())),
            config: config(),
            signals,
            idling: Arc::new(AtomicBool::new(true)),
            connected: Arc::new(AtomicBool::new(true)),
            authenticated: Arc::new(AtomicBool::new(true)),
            done: done_rx,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn bye_among_trailing_events_reports_fault() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = idle_ctx(tx);
        let mut known_exists = 5;

        // A BYE that raced a DONE arrives through the trailing-event path
        assert!(!deliver(&ctx, IdleEvent::Bye, &mut known_exists).await);

        assert!(!ctx.idling.load(Ordering::SeqCst));
        assert!(!ctx.connected.load(Ordering::SeqCst));
        assert!(!ctx.authenticated.load(Ordering::SeqCst));
        match rx.recv().await {
            Some(MailboxSignal::Fault { error }) => assert!(error.contains("BYE")),
            other => panic!("expected Fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn exists_growth_delivers_arrival_delta() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = idle_ctx(tx);
        let mut known_exists = 5;

        assert!(deliver(&ctx, IdleEvent::Exists(8), &mut known_exists).await);
        assert_eq!(known_exists, 8);
        match rx.recv().await {
            Some(MailboxSignal::Arrived { count }) => assert_eq!(count, 3),
            other => panic!("expected Arrived, got {:?}", other),
        }

        // Shrinking EXISTS announces nothing
        assert!(deliver(&ctx, IdleEvent::Exists(4), &mut known_exists).await);
        assert_eq!(known_exists, 4);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn recovery_setup_reports_fault_instead_of_raising() {
        let (tx, mut rx) = mpsc::channel(8);
        let supervisor = ConnectionSupervisor::new(unreachable_config(), tx);

        supervisor.setup(true).await.unwrap();

        assert!(!supervisor.is_connected());
        assert!(!supervisor.is_authenticated());
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        match rx.recv().await {
            Some(MailboxSignal::Fault { .. }) => {}
            other => panic!("expected Fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn initial_setup_raises_on_connect_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let supervisor = ConnectionSupervisor::new(unreachable_config(), tx);

        assert!(supervisor.setup(false).await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_idle_without_idle_is_a_noop() {
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = ConnectionSupervisor::new(config(), tx);
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        supervisor.stop_idle("test").await.unwrap();
        assert!(!supervisor.is_idle());
    }

    #[tokio::test]
    async fn concurrent_stop_idle_collapses_to_one_cancellation() {
        let (tx, _rx) = mpsc::channel(8);
        let supervisor = Arc::new(ConnectionSupervisor::new(config(), tx));

        // Plant a fake IDLE task that ends when "done" is signalled and
        // counts how often it observes the signal.
        let (done_tx, mut done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let observed = Arc::new(AtomicBool::new(false));
        let observed_in_task = Arc::clone(&observed);
        let task = tokio::spawn(async move {
            done_rx.changed().await.ok();
            assert!(
                !observed_in_task.swap(true, Ordering::SeqCst),
                "cancellation observed twice"
            );
        });
        *supervisor.idle.lock().await = Some(IdleHandle {
            done: done_tx,
            cancel,
            task,
        });
        supervisor.idling.store(true, Ordering::SeqCst);

        let a = {
            let s = Arc::clone(&supervisor);
            tokio::spawn(async move { s.stop_idle("a").await })
        };
        let b = {
            let s = Arc::clone(&supervisor);
            tokio::spawn(async move { s.stop_idle("b").await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(observed.load(Ordering::SeqCst));
        assert!(!supervisor.is_idle());
        assert!(supervisor.idle.lock().await.is_none());
    }
}
