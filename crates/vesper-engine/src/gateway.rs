use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::notify::{NotificationEvent, NotificationTrigger};
use crate::offline::MessageSink;
use crate::permission::PermissionEvaluator;
use crate::ratelimit::RateLimiter;
use crate::validate;
use crate::directory::conversation_from_row;
use vesper_bus::DeliveryBus;
use vesper_db::queries::{PersistMessage, SendTxOutcome};
use vesper_db::{Database, encode_ts, models::MessageRow};
use vesper_types::error::SendError;
use vesper_types::models::{AttachmentRef, Message, Verdict};

/// Code points of message text kept in the conversation list preview.
const PREVIEW_CODE_POINTS: usize = 80;

/// The transactional send core: validates, authorizes, persists, and fans
/// out. The message insert, conversation bookkeeping, and request-count
/// increment happen in one storage transaction; fan-out and notification
/// happen only after commit.
pub struct MessageGateway {
    db: Arc<Database>,
    permissions: Arc<PermissionEvaluator>,
    rate_limiter: RateLimiter,
    bus: DeliveryBus,
    notifier: Arc<dyn NotificationTrigger>,
    /// Held from commit through fan-out so the order subscribers observe
    /// matches the order of server-assigned seqs.
    send_lock: tokio::sync::Mutex<()>,
}

impl MessageGateway {
    pub fn new(
        db: Arc<Database>,
        permissions: Arc<PermissionEvaluator>,
        rate_limiter: RateLimiter,
        bus: DeliveryBus,
        notifier: Arc<dyn NotificationTrigger>,
    ) -> Self {
        Self {
            db,
            permissions,
            rate_limiter,
            bus,
            notifier,
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn bus(&self) -> &DeliveryBus {
        &self.bus
    }

    /// Send a message into an existing conversation on behalf of
    /// `sender_id` (already authenticated by the caller).
    pub async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
    ) -> Result<Message, SendError> {
        // Admission control first: both checks are cheap and terminal-ish,
        // no point touching storage for a payload that can never land.
        validate::validate(&text, &attachments)?;
        self.rate_limiter.admit(sender_id)?;

        let db = self.db.clone();
        let permissions = self.permissions.clone();

        // Two racing sends serialize at the storage layer, but each task
        // resumes independently after its commit; without this guard the
        // send that committed the later seq could publish first.
        let ordering = self.send_lock.lock().await;
        let (message, verdict, recipient_id) = tokio::task::spawn_blocking(move || {
            send_blocking(&db, &permissions, conversation_id, sender_id, text, attachments)
        })
        .await
        .map_err(|e| SendError::Storage(format!("join error: {e}")))??;

        self.bus.publish_message(&message);
        drop(ordering);

        let event = match verdict {
            Verdict::Limited { .. } => NotificationEvent::MessageRequest {
                conversation_id,
                message_id: message.id,
                sender_id,
                recipient_id,
            },
            _ => NotificationEvent::DirectMessage {
                conversation_id,
                message_id: message.id,
                sender_id,
                recipient_id,
            },
        };
        self.notifier.notify(event);

        Ok(message)
    }
}

impl MessageSink for MessageGateway {
    fn send_now(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        text: String,
        attachments: Vec<AttachmentRef>,
    ) -> futures_util::future::BoxFuture<'_, Result<Message, SendError>> {
        Box::pin(self.send(conversation_id, sender_id, text, attachments))
    }
}

fn send_blocking(
    db: &Database,
    permissions: &PermissionEvaluator,
    conversation_id: Uuid,
    sender_id: Uuid,
    text: String,
    attachments: Vec<AttachmentRef>,
) -> Result<(Message, Verdict, Uuid), SendError> {
    let row = db
        .get_conversation(&conversation_id.to_string())
        .map_err(storage)?
        .ok_or(SendError::UnknownConversation(conversation_id))?;
    let conversation = conversation_from_row(&row).map_err(storage)?;

    let recipient_id = conversation
        .other_participant(sender_id)
        .ok_or(SendError::NotParticipant(conversation_id))?;

    // Re-evaluated on every send so a follow-back or a fresh block takes
    // effect immediately.
    let verdict = permissions
        .evaluate(sender_id, recipient_id)
        .map_err(storage)?;

    let limit = match verdict {
        Verdict::Blocked => return Err(SendError::PermissionDenied),
        Verdict::Limited { max } => Some(max),
        Verdict::Unlimited => None,
    };

    let message_id = Uuid::new_v4();
    let created_at = encode_ts(Utc::now());
    let attachments_json = serde_json::to_string(&attachments)
        .map_err(|e| SendError::Storage(format!("attachment encoding: {e}")))?;
    let preview = preview_of(&text, &attachments);

    let outcome = db
        .persist_message(&PersistMessage {
            message_id: &message_id.to_string(),
            conversation_id: &conversation_id.to_string(),
            sender_id: &sender_id.to_string(),
            other_id: &recipient_id.to_string(),
            text: text.trim(),
            attachments_json: &attachments_json,
            preview: &preview,
            created_at: &created_at,
            limit,
        })
        .map_err(storage)?;

    match outcome {
        SendTxOutcome::LimitExceeded => Err(SendError::RequestLimitExceeded),
        SendTxOutcome::Persisted(row) => {
            let message = message_from_row(&row).map_err(storage)?;
            Ok((message, verdict, recipient_id))
        }
    }
}

pub fn message_from_row(row: &MessageRow) -> Result<Message> {
    Ok(Message {
        id: row.id.parse().context("bad message id")?,
        seq: row.seq,
        conversation_id: row.conversation_id.parse().context("bad conversation id")?,
        sender_id: row.sender_id.parse().context("bad sender id")?,
        text: row.text.clone(),
        attachments: serde_json::from_str(&row.attachments).context("bad attachments json")?,
        created_at: vesper_db::decode_ts(&row.created_at)?,
        deleted: row.deleted_at.is_some(),
    })
}

fn preview_of(text: &str, attachments: &[AttachmentRef]) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() && !attachments.is_empty() {
        return "[attachment]".to_string();
    }
    trimmed.chars().take(PREVIEW_CODE_POINTS).collect()
}

fn storage(e: anyhow::Error) -> SendError {
    SendError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ConversationDirectory;
    use crate::relationship::DbRelationshipOracle;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Captures fired notification events for assertions.
    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<NotificationEvent>>,
    }

    impl NotificationTrigger for RecordingNotifier {
        fn notify(&self, event: NotificationEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        directory: ConversationDirectory,
        gateway: MessageGateway,
        notifier: Arc<RecordingNotifier>,
        bus: DeliveryBus,
    }

    fn fixture() -> Fixture {
        fixture_with_limiter(RateLimiter::default())
    }

    fn fixture_with_limiter(rate_limiter: RateLimiter) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let oracle = Arc::new(DbRelationshipOracle::new(db.clone()));
        let permissions = Arc::new(PermissionEvaluator::new(oracle.clone()));
        let bus = DeliveryBus::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = MessageGateway::new(
            db.clone(),
            permissions,
            rate_limiter,
            bus.clone(),
            notifier.clone(),
        );
        let directory = ConversationDirectory::new(db.clone(), oracle);
        Fixture {
            _dir: dir,
            db,
            directory,
            gateway,
            notifier,
            bus,
        }
    }

    fn seed_users(db: &Database) -> (Uuid, Uuid) {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        db.create_user(&a.to_string(), "alice", "hash").unwrap();
        db.create_user(&b.to_string(), "bob", "hash").unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn validation_fails_before_any_write() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        let convo = fx.directory.resolve(a, b).await.unwrap();

        let result = fx.gateway.send(convo.id, a, "   ".into(), vec![]).await;
        assert!(matches!(result, Err(SendError::Validation(_))));
        assert!(fx.db.get_messages(&convo.id.to_string(), 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_conversation_is_terminal() {
        let fx = fixture();
        let (a, _) = seed_users(&fx.db);
        let result = fx.gateway.send(Uuid::new_v4(), a, "hi".into(), vec![]).await;
        assert!(matches!(result, Err(SendError::UnknownConversation(_))));
    }

    #[tokio::test]
    async fn non_participant_cannot_send() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        let outsider = Uuid::new_v4();
        fx.db.create_user(&outsider.to_string(), "carol", "hash").unwrap();
        let convo = fx.directory.resolve(a, b).await.unwrap();

        let result = fx.gateway.send(convo.id, outsider, "hi".into(), vec![]).await;
        assert!(matches!(result, Err(SendError::NotParticipant(_))));
    }

    #[tokio::test]
    async fn blocked_pair_gets_permission_denied_with_no_write() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        let convo = fx.directory.resolve(a, b).await.unwrap();
        fx.db.add_block(&b.to_string(), &a.to_string()).unwrap();

        let result = fx.gateway.send(convo.id, a, "hello?".into(), vec![]).await;
        assert!(matches!(result, Err(SendError::PermissionDenied)));
        assert!(fx.db.get_messages(&convo.id.to_string(), 10, None).unwrap().is_empty());
        assert!(fx.notifier.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_limit_spent_then_lifted_by_follow_back() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        let convo = fx.directory.resolve(a, b).await.unwrap();

        // First limited message lands and emits a request notification.
        let sent = fx.gateway.send(convo.id, a, "Hi".into(), vec![]).await.unwrap();
        assert_eq!(sent.text, "Hi");
        assert_eq!(
            fx.db.request_count(&convo.id.to_string(), &a.to_string()).unwrap(),
            1
        );
        assert!(matches!(
            fx.notifier.events.lock().unwrap()[0],
            NotificationEvent::MessageRequest { .. }
        ));

        // Second attempt before reciprocity is terminal.
        let second = fx.gateway.send(convo.id, a, "Still there?".into(), vec![]).await;
        assert!(matches!(second, Err(SendError::RequestLimitExceeded)));

        // Follow-back flips the verdict on the very next send.
        fx.db.add_follow(&a.to_string(), &b.to_string()).unwrap();
        fx.db.add_follow(&b.to_string(), &a.to_string()).unwrap();
        let third = fx.gateway.send(convo.id, a, "Hey!".into(), vec![]).await.unwrap();
        assert_eq!(third.text, "Hey!");
        assert!(matches!(
            fx.notifier.events.lock().unwrap().last().unwrap(),
            NotificationEvent::DirectMessage { .. }
        ));

        // The counter is no longer consulted or advanced.
        assert_eq!(
            fx.db.request_count(&convo.id.to_string(), &a.to_string()).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn successful_send_fans_out_on_the_bus() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        fx.db.set_message_privacy(&b.to_string(), "anyone").unwrap();
        let convo = fx.directory.resolve(a, b).await.unwrap();
        let mut sub = fx.bus.subscribe(convo.id);

        let sent = fx.gateway.send(convo.id, a, "hello".into(), vec![]).await.unwrap();

        let event = sub.recv().await.unwrap();
        match event {
            vesper_types::events::ConversationEvent::MessageCreate { id, seq, .. } => {
                assert_eq!(id, sent.id);
                assert_eq!(seq, sent.seq);
            }
            other => panic!("expected MessageCreate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limiter_throttles_bursts() {
        let fx = fixture_with_limiter(RateLimiter::new(2, Duration::from_secs(60)));
        let (a, b) = seed_users(&fx.db);
        fx.db.set_message_privacy(&b.to_string(), "anyone").unwrap();
        let convo = fx.directory.resolve(a, b).await.unwrap();

        fx.gateway.send(convo.id, a, "one".into(), vec![]).await.unwrap();
        fx.gateway.send(convo.id, a, "two".into(), vec![]).await.unwrap();
        let third = fx.gateway.send(convo.id, a, "three".into(), vec![]).await;
        assert!(matches!(third, Err(SendError::RateLimited { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_fan_out_in_commit_order() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        fx.db.set_message_privacy(&a.to_string(), "anyone").unwrap();
        fx.db.set_message_privacy(&b.to_string(), "anyone").unwrap();
        let convo = fx.directory.resolve(a, b).await.unwrap();
        let mut sub = fx.bus.subscribe(convo.id);

        let gateway = Arc::new(fx.gateway);
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..10 {
            let gw = gateway.clone();
            let sender = if i % 2 == 0 { a } else { b };
            let cid = convo.id;
            tasks.spawn(async move {
                gw.send(cid, sender, format!("msg {i}"), vec![]).await.unwrap();
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        // The subscriber must observe commit order, not task resume order.
        let mut seqs = Vec::new();
        for _ in 0..10 {
            match sub.recv().await.unwrap() {
                vesper_types::events::ConversationEvent::MessageCreate { seq, .. } => {
                    seqs.push(seq);
                }
                other => panic!("expected MessageCreate, got {other:?}"),
            }
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "out of order: {seqs:?}");
    }

    #[tokio::test]
    async fn messages_are_ordered_by_seq_within_a_conversation() {
        let fx = fixture();
        let (a, b) = seed_users(&fx.db);
        fx.db.set_message_privacy(&b.to_string(), "anyone").unwrap();
        fx.db.set_message_privacy(&a.to_string(), "anyone").unwrap();
        let convo = fx.directory.resolve(a, b).await.unwrap();

        let mut seqs = vec![];
        for (sender, text) in [(a, "one"), (b, "two"), (a, "three")] {
            let sent = fx.gateway.send(convo.id, sender, text.into(), vec![]).await.unwrap();
            seqs.push(sent.seq);
        }
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }
}
