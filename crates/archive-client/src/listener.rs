use async_trait::async_trait;

/// A change announcement for `[start, end)` of `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: String,
    pub start: i64,
    pub end: i64,
}

/// Another transaction committed a write lock overlapping one of our intents.
/// `[start, end)` is the overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentHit {
    pub key: String,
    pub start: i64,
    pub end: i64,
}

/// Receives notifications for the keys it was registered on.
///
/// Listeners run on their own task, one callback at a time per connection, so they
/// may issue requests on the same [`crate::Connection`].
#[async_trait]
pub trait NotificationListener: Send + Sync {
    async fn on_notification(&self, notification: &Notification);
}

#[async_trait]
pub trait IntentListener: Send + Sync {
    async fn on_intent_hit(&self, hit: &IntentHit);
}
