//! Real-time fan-out for active conversation views: messages, typing state,
//! and presence. Delivery is at-least-once; `Subscription::recv` dedupes
//! redelivered messages by id. Typing entries are ephemeral with a short
//! TTL; presence is a coarse online flag with a last-seen fallback.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use vesper_types::events::ConversationEvent;
use vesper_types::models::Message;

/// Typing indicators expire this long after the last keystroke signal, even
/// if the sender's device disconnects mid-type.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

const TOPIC_CAPACITY: usize = 256;
const DEDUP_WINDOW: usize = 128;

#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

struct Topic {
    tx: broadcast::Sender<ConversationEvent>,
    subscribers: usize,
}

struct BusInner {
    /// conversation id -> live topic. Topics exist only while subscribed.
    topics: RwLock<HashMap<Uuid, Topic>>,
    /// conversation id -> (user id -> typing expiry). Pruned lazily.
    typing: Mutex<HashMap<Uuid, HashMap<Uuid, DateTime<Utc>>>>,
    presence: RwLock<HashMap<Uuid, PresenceEntry>>,
}

/// Cloneable handle to the delivery bus. All clones share state.
#[derive(Clone)]
pub struct DeliveryBus {
    inner: Arc<BusInner>,
}

impl DeliveryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                typing: Mutex::new(HashMap::new()),
                presence: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Open a subscription for one conversation. The returned handle owns
    /// the underlying topic registration: dropping it tears the
    /// subscription down exactly once.
    pub fn subscribe(&self, conversation_id: Uuid) -> Subscription {
        let mut topics = self.inner.topics.write().expect("topics lock poisoned");
        let topic = topics.entry(conversation_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
            Topic { tx, subscribers: 0 }
        });
        topic.subscribers += 1;
        Subscription {
            bus: self.clone(),
            conversation_id,
            rx: topic.tx.subscribe(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Fan an event out. Conversation-scoped events go to that topic;
    /// presence updates go to every active topic.
    pub fn publish(&self, event: ConversationEvent) {
        let topics = self.inner.topics.read().expect("topics lock poisoned");
        match event.conversation_id() {
            Some(conversation_id) => {
                if let Some(topic) = topics.get(&conversation_id) {
                    let _ = topic.tx.send(event);
                }
            }
            None => {
                for topic in topics.values() {
                    let _ = topic.tx.send(event.clone());
                }
            }
        }
    }

    /// Convenience for the gateway: fan out a freshly persisted message.
    pub fn publish_message(&self, message: &Message) {
        self.publish(ConversationEvent::MessageCreate {
            id: message.id,
            seq: message.seq,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            text: message.text.clone(),
            attachments: message.attachments.clone(),
            created_at: message.created_at,
        });
    }

    /// Record and broadcast a typing signal. Lossy by design: a missed
    /// event is acceptable, the TTL bounds staleness.
    pub fn publish_typing(&self, conversation_id: Uuid, user_id: Uuid) {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(TYPING_TTL).expect("TYPING_TTL fits chrono range");
        self.inner
            .typing
            .lock()
            .expect("typing lock poisoned")
            .entry(conversation_id)
            .or_default()
            .insert(user_id, expires_at);

        self.publish(ConversationEvent::TypingStart {
            conversation_id,
            user_id,
            expires_at,
        });
    }

    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<Uuid> {
        self.typing_users_at(conversation_id, Utc::now())
    }

    /// Typing users still within their TTL at `now`; expired entries are
    /// pruned as a side effect.
    pub fn typing_users_at(&self, conversation_id: Uuid, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut typing = self.inner.typing.lock().expect("typing lock poisoned");
        let Some(entries) = typing.get_mut(&conversation_id) else {
            return vec![];
        };
        entries.retain(|_, expires_at| *expires_at > now);
        let users: Vec<Uuid> = entries.keys().copied().collect();
        if entries.is_empty() {
            typing.remove(&conversation_id);
        }
        users
    }

    /// Connect hook: mark online and broadcast to every active topic.
    pub fn connect(&self, user_id: Uuid) {
        self.set_presence(user_id, true);
    }

    /// Disconnect hook: mark offline with a fresh last-seen stamp.
    pub fn disconnect(&self, user_id: Uuid) {
        self.set_presence(user_id, false);
    }

    pub fn presence(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.inner
            .presence
            .read()
            .expect("presence lock poisoned")
            .get(&user_id)
            .cloned()
    }

    /// Active subscriber count for a conversation topic.
    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.inner
            .topics
            .read()
            .expect("topics lock poisoned")
            .get(&conversation_id)
            .map_or(0, |t| t.subscribers)
    }

    fn set_presence(&self, user_id: Uuid, online: bool) {
        let last_seen = Utc::now();
        self.inner
            .presence
            .write()
            .expect("presence lock poisoned")
            .insert(user_id, PresenceEntry { online, last_seen });

        self.publish(ConversationEvent::PresenceUpdate {
            user_id,
            online,
            last_seen,
        });
    }

    fn release(&self, conversation_id: Uuid) {
        let mut topics = self.inner.topics.write().expect("topics lock poisoned");
        if let Some(topic) = topics.get_mut(&conversation_id) {
            topic.subscribers -= 1;
            if topic.subscribers == 0 {
                topics.remove(&conversation_id);
            }
        }
    }
}

impl Default for DeliveryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned, cancellable subscription to one conversation's event stream.
/// Dropping the handle releases the topic registration.
pub struct Subscription {
    bus: DeliveryBus,
    conversation_id: Uuid,
    rx: broadcast::Receiver<ConversationEvent>,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
}

impl Subscription {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Next event, or `None` once the topic is gone. Redelivered messages
    /// (same id) are swallowed here so callers see each message once.
    pub async fn recv(&mut self) -> Option<ConversationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(message_id) = event.message_id() {
                        if !self.remember(message_id) {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "subscription for {} lagged by {} events",
                        self.conversation_id, n
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns false if the id was already seen. The window is bounded so
    /// long-lived subscriptions don't grow without limit.
    fn remember(&mut self, message_id: Uuid) -> bool {
        if !self.seen.insert(message_id) {
            return false;
        }
        self.seen_order.push_back(message_id);
        if self.seen_order.len() > DEDUP_WINDOW {
            if let Some(evicted) = self.seen_order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.release(self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_event(conversation_id: Uuid, id: Uuid, seq: i64) -> ConversationEvent {
        ConversationEvent::MessageCreate {
            id,
            seq,
            conversation_id,
            sender_id: Uuid::new_v4(),
            text: format!("message {seq}"),
            attachments: vec![],
            created_at: Utc::now(),
        }
    }

    fn seq_of(event: &ConversationEvent) -> i64 {
        match event {
            ConversationEvent::MessageCreate { seq, .. } => *seq,
            other => panic!("expected MessageCreate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = DeliveryBus::new();
        let conversation = Uuid::new_v4();
        let mut sub = bus.subscribe(conversation);

        for seq in 1..=3 {
            bus.publish(message_event(conversation, Uuid::new_v4(), seq));
        }

        for expected in 1..=3 {
            let event = sub.recv().await.unwrap();
            assert_eq!(seq_of(&event), expected);
        }
    }

    #[tokio::test]
    async fn redelivered_messages_are_deduplicated() {
        let bus = DeliveryBus::new();
        let conversation = Uuid::new_v4();
        let mut sub = bus.subscribe(conversation);

        let id = Uuid::new_v4();
        bus.publish(message_event(conversation, id, 1));
        // Redelivery after a reconnect is expected, not a bug.
        bus.publish(message_event(conversation, id, 1));
        bus.publish(message_event(conversation, Uuid::new_v4(), 2));

        assert_eq!(seq_of(&sub.recv().await.unwrap()), 1);
        assert_eq!(seq_of(&sub.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = DeliveryBus::new();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub1 = bus.subscribe(c1);
        let _sub2 = bus.subscribe(c2);

        bus.publish(message_event(c2, Uuid::new_v4(), 1));
        bus.publish(message_event(c1, Uuid::new_v4(), 2));

        // sub1 only ever sees c1 traffic.
        let event = sub1.recv().await.unwrap();
        assert_eq!(event.conversation_id(), Some(c1));
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_the_topic() {
        let bus = DeliveryBus::new();
        let conversation = Uuid::new_v4();

        let sub1 = bus.subscribe(conversation);
        let sub2 = bus.subscribe(conversation);
        assert_eq!(bus.subscriber_count(conversation), 2);

        drop(sub1);
        assert_eq!(bus.subscriber_count(conversation), 1);
        drop(sub2);
        assert_eq!(bus.subscriber_count(conversation), 0);
    }

    #[tokio::test]
    async fn typing_expires_after_ttl() {
        let bus = DeliveryBus::new();
        let conversation = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut sub = bus.subscribe(conversation);

        bus.publish_typing(conversation, user);
        assert_eq!(bus.typing_users(conversation), vec![user]);

        let event = sub.recv().await.unwrap();
        assert!(matches!(event, ConversationEvent::TypingStart { user_id, .. } if user_id == user));

        // Past the TTL the entry is gone even without a stop signal.
        let later = Utc::now() + chrono::Duration::seconds(6);
        assert!(bus.typing_users_at(conversation, later).is_empty());
    }

    #[tokio::test]
    async fn presence_reaches_all_active_topics() {
        let bus = DeliveryBus::new();
        let user = Uuid::new_v4();
        let mut sub1 = bus.subscribe(Uuid::new_v4());
        let mut sub2 = bus.subscribe(Uuid::new_v4());

        bus.connect(user);
        for sub in [&mut sub1, &mut sub2] {
            let event = sub.recv().await.unwrap();
            assert!(matches!(
                event,
                ConversationEvent::PresenceUpdate { user_id, online: true, .. } if user_id == user
            ));
        }
        assert!(bus.presence(user).unwrap().online);

        bus.disconnect(user);
        let entry = bus.presence(user).unwrap();
        assert!(!entry.online);
        // last_seen fallback survives the disconnect.
        assert!(entry.last_seen <= Utc::now());
    }
}
