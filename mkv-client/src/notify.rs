//! # Push Notifications
//!
//! Purpose: Classify RESP3 push frames and deliver pub/sub traffic to user
//! callbacks without stalling the connection's reply stream.
//!
//! Invalidation pushes are consumed by the connection itself (they must be
//! applied in wire order); everything subscribers care about is forwarded
//! over an unbounded channel to one notification task per connection.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use mkv_common::RespValue;
use tokio::sync::mpsc;
use tracing::trace;

/// Callback for channel and pattern messages.
pub type MessageHandler = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Callback for subscribe/unsubscribe confirmations.
pub type SubscriptionHandler = Arc<dyn Fn(Subscription) + Send + Sync>;

/// Which subscription produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Message,
    PMessage,
    SMessage,
}

/// A message published to a channel the connection is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub kind: MessageKind,
    /// Matching pattern for `pmessage`.
    pub pattern: Option<Bytes>,
    pub channel: Bytes,
    pub payload: Bytes,
}

/// Kind of subscription change confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    PSubscribe,
    SSubscribe,
    Unsubscribe,
    PUnsubscribe,
    SUnsubscribe,
}

/// Subscription confirmation: the channel and the connection's remaining
/// subscription count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    pub channel: Bytes,
    pub count: i64,
}

/// Callbacks invoked for push messages. Cheap to clone.
#[derive(Clone, Default)]
pub struct PubSubHandlers {
    on_message: Option<MessageHandler>,
    on_subscription: Option<SubscriptionHandler>,
}

impl PubSubHandlers {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the callback for `message`, `pmessage` and `smessage` pushes.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(PubSubMessage) + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Installs the callback for subscription confirmations.
    pub fn on_subscription<F>(mut self, handler: F) -> Self
    where
        F: Fn(Subscription) + Send + Sync + 'static,
    {
        self.on_subscription = Some(Arc::new(handler));
        self
    }

    /// True when no callback is installed.
    pub fn is_empty(&self) -> bool {
        self.on_message.is_none() && self.on_subscription.is_none()
    }

    fn deliver(&self, notification: Notification) {
        match notification {
            Notification::Message(msg) => {
                if let Some(handler) = &self.on_message {
                    handler(msg);
                }
            }
            Notification::Subscription(sub) => {
                if let Some(handler) = &self.on_subscription {
                    handler(sub);
                }
            }
        }
    }
}

impl fmt::Debug for PubSubHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubHandlers")
            .field("on_message", &self.on_message.is_some())
            .field("on_subscription", &self.on_subscription.is_some())
            .finish()
    }
}

/// Pub/sub event forwarded to the notification task.
#[derive(Debug, Clone)]
pub(crate) enum Notification {
    Message(PubSubMessage),
    Subscription(Subscription),
}

/// Classified push frame.
#[derive(Debug)]
pub(crate) enum Push {
    /// Keys whose cached reads are stale; `None` flushes everything.
    Invalidate(Option<Vec<Bytes>>),
    Message(PubSubMessage),
    Subscription(Subscription),
    Unknown,
}

/// Classifies the elements of a `>` frame.
pub(crate) fn classify(items: &[RespValue]) -> Push {
    let Some((kind, rest)) = items.split_first() else {
        return Push::Unknown;
    };
    let kind = match kind {
        RespValue::Bulk(kind) | RespValue::Simple(kind) => kind.to_ascii_lowercase(),
        _ => return Push::Unknown,
    };

    match kind.as_slice() {
        b"invalidate" => match rest.first() {
            Some(RespValue::Array(keys)) | Some(RespValue::Set(keys)) => Push::Invalidate(Some(
                keys.iter()
                    .filter_map(|key| match key {
                        RespValue::Bulk(key) | RespValue::Simple(key) => Some(key.clone()),
                        _ => None,
                    })
                    .collect(),
            )),
            _ => Push::Invalidate(None),
        },
        b"message" | b"smessage" => match (bytes_at(rest, 0), bytes_at(rest, 1)) {
            (Some(channel), Some(payload)) => Push::Message(PubSubMessage {
                kind: if kind.as_slice() == b"message" {
                    MessageKind::Message
                } else {
                    MessageKind::SMessage
                },
                pattern: None,
                channel,
                payload,
            }),
            _ => Push::Unknown,
        },
        b"pmessage" => match (bytes_at(rest, 0), bytes_at(rest, 1), bytes_at(rest, 2)) {
            (Some(pattern), Some(channel), Some(payload)) => Push::Message(PubSubMessage {
                kind: MessageKind::PMessage,
                pattern: Some(pattern),
                channel,
                payload,
            }),
            _ => Push::Unknown,
        },
        other => {
            let kind = match other {
                b"subscribe" => SubscriptionKind::Subscribe,
                b"psubscribe" => SubscriptionKind::PSubscribe,
                b"ssubscribe" => SubscriptionKind::SSubscribe,
                b"unsubscribe" => SubscriptionKind::Unsubscribe,
                b"punsubscribe" => SubscriptionKind::PUnsubscribe,
                b"sunsubscribe" => SubscriptionKind::SUnsubscribe,
                _ => return Push::Unknown,
            };
            Push::Subscription(Subscription {
                kind,
                channel: bytes_at(rest, 0).unwrap_or_default(),
                count: rest.get(1).and_then(|v| v.as_i64().ok()).unwrap_or(0),
            })
        }
    }
}

fn bytes_at(items: &[RespValue], idx: usize) -> Option<Bytes> {
    match items.get(idx)? {
        RespValue::Bulk(b) | RespValue::Simple(b) => Some(b.clone()),
        _ => None,
    }
}

/// Spawns the notification task and returns its inbox.
pub(crate) fn spawn_dispatcher(handlers: PubSubHandlers) -> mpsc::UnboundedSender<Notification> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            trace!(?notification, "delivering push");
            handlers.deliver(notification);
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &'static [u8]) -> RespValue {
        RespValue::Bulk(Bytes::from_static(s))
    }

    #[test]
    fn classifies_invalidations() {
        match classify(&[bulk(b"invalidate"), RespValue::Array(vec![bulk(b"a"), bulk(b"b")])]) {
            Push::Invalidate(Some(keys)) => assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            classify(&[bulk(b"invalidate"), RespValue::Null]),
            Push::Invalidate(None)
        ));
    }

    #[test]
    fn classifies_messages() {
        match classify(&[bulk(b"pmessage"), bulk(b"news.*"), bulk(b"news.tech"), bulk(b"hi")]) {
            Push::Message(msg) => {
                assert_eq!(msg.kind, MessageKind::PMessage);
                assert_eq!(msg.pattern.as_deref(), Some(&b"news.*"[..]));
                assert_eq!(msg.channel.as_ref(), b"news.tech");
                assert_eq!(msg.payload.as_ref(), b"hi");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classifies_subscriptions() {
        match classify(&[bulk(b"subscribe"), bulk(b"chan"), RespValue::Integer(1)]) {
            Push::Subscription(sub) => {
                assert_eq!(sub.kind, SubscriptionKind::Subscribe);
                assert_eq!(sub.count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(classify(&[bulk(b"tracking-redir-broken")]), Push::Unknown));
    }
}
