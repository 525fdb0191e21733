//! End-to-end send flows through the full engine stack: directory,
//! permission evaluation, transactional persistence, bus fan-out, and the
//! offline queue, against a real on-disk store.

use std::sync::Arc;

use uuid::Uuid;

use vesper_bus::DeliveryBus;
use vesper_db::Database;
use vesper_engine::offline::MessageSink;
use vesper_engine::{
    ConversationDirectory, DbRelationshipOracle, LogNotifier, MessageGateway, OfflineQueue,
    PermissionEvaluator, RateLimiter, SendAttempt,
};
use vesper_types::error::SendError;
use vesper_types::events::ConversationEvent;
use vesper_types::models::ConversationStatus;

struct Stack {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    directory: Arc<ConversationDirectory>,
    gateway: Arc<MessageGateway>,
    bus: DeliveryBus,
}

fn stack() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("engine.db")).unwrap());
    let oracle = Arc::new(DbRelationshipOracle::new(db.clone()));
    let permissions = Arc::new(PermissionEvaluator::new(oracle.clone()));
    let bus = DeliveryBus::new();
    let gateway = Arc::new(MessageGateway::new(
        db.clone(),
        permissions,
        RateLimiter::default(),
        bus.clone(),
        Arc::new(LogNotifier),
    ));
    let directory = Arc::new(ConversationDirectory::new(db.clone(), oracle));
    Stack {
        _dir: dir,
        db,
        directory,
        gateway,
        bus,
    }
}

fn user(db: &Database, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.create_user(&id.to_string(), name, "hash").unwrap();
    id
}

/// A stranger messaging a followers-only recipient gets exactly one request
/// message; the follow-back lifts the limit and accepts the conversation.
#[tokio::test]
async fn stranger_request_flow() {
    let s = stack();
    let alice = user(&s.db, "alice");
    let bob = user(&s.db, "bob");

    let convo = s.directory.resolve(alice, bob).await.unwrap();
    assert_eq!(convo.status, ConversationStatus::Pending);

    s.gateway.send(convo.id, alice, "hi, we met at the retreat".into(), vec![]).await.unwrap();

    let denied = s.gateway.send(convo.id, alice, "hello?".into(), vec![]).await;
    assert!(matches!(denied, Err(SendError::RequestLimitExceeded)));

    // Follow-back establishes reciprocity.
    s.db.add_follow(&alice.to_string(), &bob.to_string()).unwrap();
    s.db.add_follow(&bob.to_string(), &alice.to_string()).unwrap();

    s.gateway.send(convo.id, alice, "oh good, you followed back".into(), vec![]).await.unwrap();
    let convo = s.directory.resolve(alice, bob).await.unwrap();
    assert_eq!(convo.status, ConversationStatus::Accepted);

    let rows = s.db.get_messages(&convo.id.to_string(), 10, None).unwrap();
    assert_eq!(rows.len(), 2);
}

/// With privacy set to `anyone`, a stranger sends without limit; the
/// conversation still waits for reciprocity before it reads as accepted.
#[tokio::test]
async fn open_privacy_skips_the_request_gate() {
    let s = stack();
    let alice = user(&s.db, "alice");
    let bob = user(&s.db, "bob");
    s.db.set_message_privacy(&bob.to_string(), "anyone").unwrap();

    let convo = s.directory.resolve(alice, bob).await.unwrap();
    for text in ["one", "two", "three"] {
        s.gateway.send(convo.id, alice, text.into(), vec![]).await.unwrap();
    }

    let convo = s.directory.resolve(alice, bob).await.unwrap();
    assert_eq!(convo.status, ConversationStatus::Pending);
    assert_eq!(
        s.db.request_count(&convo.id.to_string(), &alice.to_string()).unwrap(),
        0
    );

    // Bob answering is what accepts it.
    s.gateway.send(convo.id, bob, "four".into(), vec![]).await.unwrap();
    let convo = s.directory.resolve(alice, bob).await.unwrap();
    assert_eq!(convo.status, ConversationStatus::Accepted);
}

/// A reply from the recipient flips a pending request conversation to
/// accepted, even before any follow exists.
#[tokio::test]
async fn reply_accepts_the_conversation() {
    let s = stack();
    let alice = user(&s.db, "alice");
    let bob = user(&s.db, "bob");

    let convo = s.directory.resolve(alice, bob).await.unwrap();
    s.gateway.send(convo.id, alice, "hi".into(), vec![]).await.unwrap();
    assert_eq!(
        s.directory.resolve(alice, bob).await.unwrap().status,
        ConversationStatus::Pending
    );

    s.gateway.send(convo.id, bob, "hey!".into(), vec![]).await.unwrap();
    assert_eq!(
        s.directory.resolve(alice, bob).await.unwrap().status,
        ConversationStatus::Accepted
    );
}

/// A block placed mid-conversation stops sends in both directions, and the
/// refusal is indistinguishable from a generic failure.
#[tokio::test]
async fn block_cuts_both_directions() {
    let s = stack();
    let alice = user(&s.db, "alice");
    let bob = user(&s.db, "bob");
    s.db.add_follow(&alice.to_string(), &bob.to_string()).unwrap();
    s.db.add_follow(&bob.to_string(), &alice.to_string()).unwrap();

    let convo = s.directory.resolve(alice, bob).await.unwrap();
    s.gateway.send(convo.id, alice, "before".into(), vec![]).await.unwrap();

    s.db.add_block(&bob.to_string(), &alice.to_string()).unwrap();

    for sender in [alice, bob] {
        let result = s.gateway.send(convo.id, sender, "after".into(), vec![]).await;
        match result {
            Err(e @ SendError::PermissionDenied) => {
                assert_eq!(e.to_string(), "message could not be sent");
            }
            other => panic!("expected PermissionDenied, got {other:?}"),
        }
    }
}

/// Live subscribers see the message exactly once even when the transport
/// redelivers, and the offline queue reconciles a staged send through the
/// same path.
#[tokio::test]
async fn offline_send_reaches_a_live_subscriber() {
    let s = stack();
    let alice = user(&s.db, "alice");
    let bob = user(&s.db, "bob");
    s.db.set_message_privacy(&bob.to_string(), "anyone").unwrap();

    let sink: Arc<dyn MessageSink> = s.gateway.clone();
    let queue = OfflineQueue::new(s.db.clone(), s.directory.clone(), sink);

    // Stage while offline.
    queue.set_online(false);
    let SendAttempt::Queued { local_id } =
        queue.send(alice, bob, "sent from the subway".into(), vec![]).await
    else {
        panic!("expected the send to stage");
    };

    // Bob's device comes up and subscribes before the drain.
    let convo_id = ConversationDirectory::conversation_id_for(alice, bob);
    let mut sub = s.bus.subscribe(convo_id);

    queue.set_online(true);
    assert_eq!(queue.drain_once().await.unwrap(), 1);
    assert!(matches!(
        queue.state(local_id),
        Some(vesper_types::models::OutboundState::Sent { .. })
    ));

    let event = sub.recv().await.unwrap();
    match event {
        ConversationEvent::MessageCreate { sender_id, text, .. } => {
            assert_eq!(sender_id, alice);
            assert_eq!(text, "sent from the subway");
        }
        other => panic!("expected MessageCreate, got {other:?}"),
    }
}
