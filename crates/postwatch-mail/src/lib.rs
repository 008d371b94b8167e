//! Mailbox monitoring engine: a sync-loop state machine over a protocol-client boundary.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use postwatch_core::{Email, MailStore, log_debug};

pub mod transport;

pub use transport::ImapMailbox;

const MONITOR_EVENT_QUEUE_CAPACITY: usize = 256;

pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Imap,
    Pop3,
}

impl ProtocolKind {
    /// Well-known port for the protocol, by transport security.
    pub fn default_port(self, use_tls: bool) -> u16 {
        match (self, use_tls) {
            (ProtocolKind::Imap, false) => 143,
            (ProtocolKind::Imap, true) => 993,
            (ProtocolKind::Pop3, false) => 110,
            (ProtocolKind::Pop3, true) => 995,
        }
    }
}

/// Connection parameters for one remote mailbox. Built once, then read-only
/// for the whole monitoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub host: String,
    pub account: String,
    pub password: String,
    pub use_tls: bool,
    pub port: u16,
    pub protocol: ProtocolKind,
    pub wait_timeout_secs: u64,
}

impl MailboxConfig {
    pub fn new(host: &str, account: &str, password: &str, use_tls: bool) -> Self {
        Self {
            host: host.to_string(),
            account: account.to_string(),
            password: password.to_string(),
            use_tls,
            port: ProtocolKind::Imap.default_port(use_tls),
            protocol: ProtocolKind::Imap,
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("fetch failed for message {uid}: {reason}")]
    Fetch { uid: u32, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Lightweight handle to one remote message. Re-queried every cycle and
/// discarded after use; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailSummary {
    pub seq: u32,
    pub uid: u32,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => write!(f, "{} <{}>", name, self.address),
            _ => write!(f, "{}", self.address),
        }
    }
}

/// A fully retrieved message as the protocol client reports it, before the
/// address lists are rendered into the domain [`Email`].
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryFilter {
    All,
    UnreadOnly,
}

/// The protocol-client boundary. Everything wire-level (framing, TLS,
/// command encoding) lives behind this trait; the engine only sees blocking
/// calls with normalized results.
pub trait MailboxClient: Send {
    fn connect(&mut self) -> Result<(), MailboxError>;
    fn logout(&mut self) -> Result<(), MailboxError>;
    /// Unconditional refresh of the remote summary state.
    fn refresh_summaries(&mut self) -> Result<(), MailboxError>;
    /// Summaries in mailbox order, optionally restricted to unread mail.
    fn list_summaries(
        &mut self,
        filter: SummaryFilter,
    ) -> Result<Vec<MailSummary>, MailboxError>;
    fn retrieve_message(&mut self, summary: &MailSummary) -> Result<RawMessage, MailboxError>;
    fn mark_read(&mut self, summary: &MailSummary, read: bool) -> Result<(), MailboxError>;
    /// Block until a new-mail signal arrives or the timeout elapses. Returns
    /// whether a signal was seen.
    fn wait_for_new_mail(&mut self, timeout: Duration) -> Result<bool, MailboxError>;
    /// Tear down whatever the timed-out wait left behind.
    fn cancel_wait(&mut self) -> Result<(), MailboxError>;
}

/// Diagnostic stream. Consumers may drop the receiver at any time; events
/// never influence the sync loop.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Securing { host: String },
    Connected,
    Authorized,
    SummaryRefreshed { total: usize },
    Waiting { timeout_secs: u64 },
    NewMailSignal,
    WaitTimedOut,
    FetchStarted { unread: usize },
    ReceiveProgress { index: usize, total: usize },
    MessageStored { from: String, subject: String },
    MarkedRead { uid: u32 },
    Trace { detail: String },
    Disconnecting,
}

fn emit(events: &mpsc::Sender<MonitorEvent>, event: MonitorEvent) {
    let _ = events.blocking_send(event);
}

/// Cooperative stop signal, set once from outside the loop and sampled at
/// the top of each waiting iteration. It never pre-empts an in-flight wait
/// or fetch, so stop latency is bounded by the wait timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLoopState {
    Disconnected,
    Connecting,
    InitialSync,
    Waiting,
    Fetching,
    Disconnecting,
    Terminated,
}

/// Drive the sync loop until cancellation or a fatal error. Logout is
/// attempted exactly once on every exit path, including connect failures;
/// its own failure is traced, never allowed to mask the primary outcome.
pub fn run_sync_loop(
    client: &mut dyn MailboxClient,
    store: &MailStore,
    cancel: &CancelFlag,
    events: &mpsc::Sender<MonitorEvent>,
    wait_timeout: Duration,
) -> Result<(), MailboxError> {
    let mut state = SyncLoopState::Disconnected;
    let mut outcome: Result<(), MailboxError> = Ok(());

    loop {
        state = match state {
            SyncLoopState::Disconnected => SyncLoopState::Connecting,
            SyncLoopState::Connecting => match client.connect() {
                Ok(()) => SyncLoopState::InitialSync,
                Err(err) => {
                    outcome = Err(err);
                    SyncLoopState::Disconnecting
                }
            },
            SyncLoopState::InitialSync => match refresh_baseline(client, events) {
                Ok(_) => SyncLoopState::Waiting,
                Err(err) => {
                    outcome = Err(err);
                    SyncLoopState::Disconnecting
                }
            },
            SyncLoopState::Waiting => {
                if cancel.is_cancelled() {
                    SyncLoopState::Disconnecting
                } else {
                    emit(
                        events,
                        MonitorEvent::Waiting {
                            timeout_secs: wait_timeout.as_secs(),
                        },
                    );
                    match client.wait_for_new_mail(wait_timeout) {
                        Ok(true) => {
                            emit(events, MonitorEvent::NewMailSignal);
                            SyncLoopState::Fetching
                        }
                        Ok(false) => {
                            emit(events, MonitorEvent::WaitTimedOut);
                            match client.cancel_wait() {
                                Ok(()) => SyncLoopState::Waiting,
                                Err(err) => {
                                    outcome = Err(err);
                                    SyncLoopState::Disconnecting
                                }
                            }
                        }
                        Err(err) => {
                            outcome = Err(err);
                            SyncLoopState::Disconnecting
                        }
                    }
                }
            }
            SyncLoopState::Fetching => {
                let batch = refresh_baseline(client, events)
                    .and_then(|_| fetch_and_store_unread(client, store, events));
                match batch {
                    Ok(_) => SyncLoopState::Waiting,
                    Err(err) => {
                        outcome = Err(err);
                        SyncLoopState::Disconnecting
                    }
                }
            }
            SyncLoopState::Disconnecting => {
                emit(events, MonitorEvent::Disconnecting);
                if let Err(err) = client.logout() {
                    log_debug(&format!("logout failed: {}", err));
                }
                SyncLoopState::Terminated
            }
            SyncLoopState::Terminated => break,
        };
    }

    outcome
}

/// One unconditional full-mailbox summary refresh; the baseline is taken
/// without filtering by read state.
fn refresh_baseline(
    client: &mut dyn MailboxClient,
    events: &mpsc::Sender<MonitorEvent>,
) -> Result<usize, MailboxError> {
    client.refresh_summaries()?;
    let summaries = client.list_summaries(SummaryFilter::All)?;
    emit(
        events,
        MonitorEvent::SummaryRefreshed {
            total: summaries.len(),
        },
    );
    Ok(summaries.len())
}

/// Fetch every unread message in the order the mailbox reports them:
/// retrieve, map, append, and only then flag it read remotely. A failure
/// aborts the batch and propagates; anything appended before it stays in
/// the store, and the failed message stays unread remotely, so it is
/// re-fetched on the next cycle (at-least-once, not exactly-once).
pub fn fetch_and_store_unread(
    client: &mut dyn MailboxClient,
    store: &MailStore,
    events: &mpsc::Sender<MonitorEvent>,
) -> Result<usize, MailboxError> {
    let summaries = client.list_summaries(SummaryFilter::UnreadOnly)?;
    let total = summaries.len();
    emit(events, MonitorEvent::FetchStarted { unread: total });

    for (index, summary) in summaries.iter().enumerate() {
        emit(
            events,
            MonitorEvent::ReceiveProgress {
                index: index + 1,
                total,
            },
        );
        let raw = client.retrieve_message(summary)?;
        let email = email_from_raw(&raw);
        let from = email.from.clone();
        let subject = email.subject.clone();
        store.append(email);
        emit(events, MonitorEvent::MessageStored { from, subject });
        if !summary.read {
            client.mark_read(summary, true)?;
            emit(events, MonitorEvent::MarkedRead { uid: summary.uid });
        }
    }

    Ok(total)
}

/// Render a protocol record into the domain model. Address lists keep the
/// source order and count.
pub fn email_from_raw(raw: &RawMessage) -> Email {
    Email {
        from: raw
            .from
            .as_ref()
            .map(|addr| addr.to_string())
            .unwrap_or_default(),
        to: raw.to.iter().map(|addr| addr.to_string()).collect(),
        cc: raw.cc.iter().map(|addr| addr.to_string()).collect(),
        subject: raw.subject.clone(),
        text_body: raw.text_body.clone(),
        html_body: raw.html_body.clone(),
    }
}

pub struct MonitorHandle {
    cancel: CancelFlag,
    worker: JoinHandle<Result<(), MailboxError>>,
}

impl MonitorHandle {
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker and return the run outcome.
    pub async fn join(self) -> Result<(), MailboxError> {
        match self.worker.await {
            Ok(outcome) => outcome,
            Err(err) => Err(MailboxError::Protocol(format!(
                "monitor worker panicked: {}",
                err
            ))),
        }
    }
}

/// Spawn the blocking sync loop against an IMAP mailbox. Must be called from
/// within a tokio runtime; the returned receiver carries the diagnostic
/// stream and closes when the run ends.
pub fn start_monitor(
    config: MailboxConfig,
    store: MailStore,
) -> (MonitorHandle, mpsc::Receiver<MonitorEvent>) {
    let (event_tx, event_rx) = mpsc::channel(MONITOR_EVENT_QUEUE_CAPACITY);
    let cancel = CancelFlag::new();
    let worker_cancel = cancel.clone();
    let wait_timeout = config.wait_timeout();
    let worker = tokio::task::spawn_blocking(move || {
        let mut client = ImapMailbox::new(config, event_tx.clone());
        run_sync_loop(&mut client, &store, &worker_cancel, &event_tx, wait_timeout)
    });
    (MonitorHandle { cancel, worker }, event_rx)
}
