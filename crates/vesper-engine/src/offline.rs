use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::ConversationDirectory;
use vesper_db::{Database, encode_ts, models::PendingSendRow};
use vesper_types::error::SendError;
use vesper_types::models::{AttachmentRef, Message, OutboundState};

/// Retry budget per staged send before it is parked as failed.
const MAX_ATTEMPTS: u32 = 8;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// How often the drain loop polls for due items while online.
const DRAIN_POLL: Duration = Duration::from_millis(500);
/// Items attempted per drain pass.
const DRAIN_BATCH: u32 = 16;

/// Where drained messages go. `MessageGateway` is the production sink; tests
/// substitute flaky ones.
pub trait MessageSink: Send + Sync {
    fn send_now(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
    ) -> BoxFuture<'_, Result<Message, SendError>>;
}

/// Outcome of an `OfflineQueue::send` call.
#[derive(Debug)]
pub enum SendAttempt {
    /// Went straight through the sink.
    Delivered(Message),
    /// Staged durably; watch `subscribe_updates` for the reconciliation.
    Queued { local_id: i64 },
    /// Terminal rejection (or local staging failure) — nothing queued.
    Rejected(SendError),
}

/// Durable staging area for sends made while disconnected. Entries survive
/// process restarts in the `pending_sends` table; the drain loop is
/// process-scoped and keeps delivering after the originating view is gone.
///
/// FIFO within a conversation; conversations drain interleaved.
pub struct OfflineQueue {
    db: Arc<Database>,
    directory: Arc<ConversationDirectory>,
    sink: Arc<dyn MessageSink>,
    online_tx: watch::Sender<bool>,
    max_attempts: u32,
    states: Mutex<HashMap<i64, OutboundState>>,
    updates_tx: broadcast::Sender<(i64, OutboundState)>,
}

impl OfflineQueue {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ConversationDirectory>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (online_tx, _) = watch::channel(true);
        let (updates_tx, _) = broadcast::channel(256);
        Self {
            db,
            directory,
            sink,
            online_tx,
            max_attempts: MAX_ATTEMPTS,
            states: Mutex::new(HashMap::new()),
            updates_tx,
        }
    }

    /// Shrink the retry budget, for tests.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Connectivity hook, driven by the transport layer.
    pub fn set_online(&self, online: bool) {
        self.online_tx.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Current state of a staged send, if tracked in this process.
    pub fn state(&self, local_id: i64) -> Option<OutboundState> {
        self.states.lock().expect("state lock poisoned").get(&local_id).cloned()
    }

    /// Stream of `(local_id, state)` transitions for reconciling optimistic
    /// UI entries.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<(i64, OutboundState)> {
        self.updates_tx.subscribe()
    }

    /// Try the sink directly; stage the payload only if the transport is
    /// unreachable. Terminal rejections are surfaced immediately and never
    /// staged.
    pub async fn send(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
    ) -> SendAttempt {
        if self.is_online() {
            match self.attempt(sender_id, recipient_id, text.clone(), attachments.clone()).await {
                Ok(message) => return SendAttempt::Delivered(message),
                Err(e) if e.is_transient() => {
                    debug!("send failed transiently, staging: {e}");
                }
                Err(e) => return SendAttempt::Rejected(e),
            }
        }

        match self.enqueue(sender_id, recipient_id, &text, &attachments).await {
            Ok(local_id) => {
                self.set_state(local_id, OutboundState::Queued);
                SendAttempt::Queued { local_id }
            }
            Err(e) => SendAttempt::Rejected(SendError::Storage(e.to_string())),
        }
    }

    /// Long-lived drain loop. Process-scoped by design: not tied to any UI
    /// lifecycle, so a queued message still goes out after the user has
    /// navigated away.
    pub fn spawn_drain(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut online_rx = self.online_tx.subscribe();
            loop {
                if !*online_rx.borrow() {
                    if online_rx.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                if let Err(e) = self.drain_once().await {
                    warn!("drain pass failed: {e:#}");
                }
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
    }

    /// One drain pass over the due queue heads. Returns the number of items
    /// attempted.
    pub async fn drain_once(&self) -> Result<usize> {
        self.drain_once_at(Utc::now()).await
    }

    /// Drain with an explicit clock, for tests.
    pub async fn drain_once_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.db.clone();
        let cutoff = encode_ts(now);
        let due = tokio::task::spawn_blocking(move || db.due_sends(&cutoff, DRAIN_BATCH)).await??;

        let attempted = due.len();
        for item in due {
            self.drain_item(item, now).await?;
        }
        Ok(attempted)
    }

    /// Parked sends awaiting explicit discard or resend.
    pub async fn failed_sends(&self, sender_id: Uuid) -> Result<Vec<PendingSendRow>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.failed_sends_for(&sender_id.to_string())).await?
    }

    /// Drop a staged or parked send entirely.
    pub async fn discard(&self, local_id: i64) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.delete_send(local_id)).await??;
        self.states.lock().expect("state lock poisoned").remove(&local_id);
        Ok(())
    }

    /// Put a parked send back in the queue with a fresh attempt budget.
    pub async fn resend(&self, local_id: i64) -> Result<bool> {
        let db = self.db.clone();
        let now = encode_ts(Utc::now());
        let requeued =
            tokio::task::spawn_blocking(move || db.requeue_send(local_id, &now)).await??;
        if requeued {
            self.set_state(local_id, OutboundState::Queued);
        }
        Ok(requeued)
    }

    async fn drain_item(&self, item: PendingSendRow, now: DateTime<Utc>) -> Result<()> {
        let sender_id: Uuid = item.sender_id.parse()?;
        let recipient_id: Uuid = item.recipient_id.parse()?;
        let attachments: Vec<AttachmentRef> = serde_json::from_str(&item.attachments)?;

        let result = self
            .attempt(sender_id, recipient_id, item.text.clone(), attachments)
            .await;

        match result {
            Ok(message) => {
                self.delete_row(item.local_id).await?;
                debug!(
                    "drained local send {} as message {}",
                    item.local_id, message.id
                );
                self.set_state(item.local_id, OutboundState::Sent { server_id: message.id });
            }
            Err(SendError::RateLimited { retry_after }) => {
                // Honor the hint without burning an attempt.
                let next = encode_ts(now + chrono::Duration::from_std(retry_after)?);
                let db = self.db.clone();
                let attempts = item.attempts;
                let local_id = item.local_id;
                tokio::task::spawn_blocking(move || db.bump_send_attempt(local_id, attempts, &next))
                    .await??;
            }
            Err(e) if e.is_transient() => {
                let attempts = item.attempts + 1;
                if attempts >= self.max_attempts {
                    let db = self.db.clone();
                    let local_id = item.local_id;
                    tokio::task::spawn_blocking(move || db.mark_send_failed(local_id)).await??;
                    warn!("local send {} exhausted retries: {e}", item.local_id);
                    self.set_state(
                        item.local_id,
                        OutboundState::Failed {
                            reason: format!("retries exhausted: {e}"),
                        },
                    );
                } else {
                    let next = encode_ts(now + chrono::Duration::from_std(backoff(attempts))?);
                    let db = self.db.clone();
                    let local_id = item.local_id;
                    tokio::task::spawn_blocking(move || {
                        db.bump_send_attempt(local_id, attempts, &next)
                    })
                    .await??;
                }
            }
            Err(e) => {
                // Terminal: remove the item so it can never resurrect as a
                // retry storm, and surface the reason.
                self.delete_row(item.local_id).await?;
                self.set_state(item.local_id, OutboundState::Failed { reason: e.to_string() });
            }
        }
        Ok(())
    }

    /// Resolve the conversation lazily (the pair is the durable key) and
    /// push through the sink.
    async fn attempt(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
    ) -> Result<Message, SendError> {
        let conversation = self.directory.resolve(sender_id, recipient_id).await?;
        self.sink
            .send_now(conversation.id, sender_id, text, attachments)
            .await
    }

    async fn enqueue(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        text: &str,
        attachments: &[AttachmentRef],
    ) -> Result<i64> {
        let conversation_id = ConversationDirectory::conversation_id_for(sender_id, recipient_id);
        let attachments_json = serde_json::to_string(attachments)?;
        let enqueued_at = encode_ts(Utc::now());
        let db = self.db.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            db.enqueue_send(
                &conversation_id.to_string(),
                &sender_id.to_string(),
                &recipient_id.to_string(),
                &text,
                &attachments_json,
                &enqueued_at,
            )
        })
        .await?
    }

    async fn delete_row(&self, local_id: i64) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.delete_send(local_id)).await?
    }

    fn set_state(&self, local_id: i64, state: OutboundState) {
        self.states
            .lock()
            .expect("state lock poisoned")
            .insert(local_id, state.clone());
        let _ = self.updates_tx.send((local_id, state));
    }
}

fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(6);
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(exp))
}
