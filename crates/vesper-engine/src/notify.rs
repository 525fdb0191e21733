use uuid::Uuid;

/// Closed set of notification kinds handed to the push subsystem. One
/// variant per kind keeps the boundary exhaustively checked at compile time
/// instead of a string-keyed payload map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// A normal message in an established (unlimited) conversation.
    DirectMessage {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
    },
    /// The one allowed message from a non-mutual contact.
    MessageRequest {
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        recipient_id: Uuid,
    },
}

/// Fire-and-forget boundary to the push-notification subsystem. The engine
/// never waits on or checks notification delivery.
pub trait NotificationTrigger: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

/// Default trigger: logs the event and does nothing else. Deployments slot
/// in their own impl.
pub struct LogNotifier;

impl NotificationTrigger for LogNotifier {
    fn notify(&self, event: NotificationEvent) {
        tracing::debug!(?event, "notification event");
    }
}
