//! Publish / Subscribe Hub
//!
//! Maps channel names to subscriber lists. Each subscriber is the
//! outbound byte channel of a connection, so publishing never touches
//! another task's socket directly. Channel-level critical sections come
//! from the striped key-lock table, keyed by channel name.

use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::protocol::RespValue;
use crate::storage::{ConcurrentDict, KeyLocks};

const HUB_LOCK_SIZE: usize = 16;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

/// Three-element pub/sub notification: kind, channel, count.
fn make_msg(kind: &str, channel: &str, code: i64) -> Vec<u8> {
    RespValue::Array(vec![
        RespValue::bulk_string(kind.as_bytes().to_vec()),
        RespValue::bulk_string(channel.as_bytes().to_vec()),
        RespValue::integer(code),
    ])
    .serialize()
}

/// The subscription registry shared by all connections.
pub struct Hub {
    subs: ConcurrentDict<Vec<Subscriber>>,
    locker: KeyLocks,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subs: ConcurrentDict::new(HUB_LOCK_SIZE),
            locker: KeyLocks::new(HUB_LOCK_SIZE),
        }
    }

    fn subscribe_one(&self, conn: &mut ConnectionState, channel: &str) -> bool {
        conn.subscribe(channel);
        let Some(sender) = conn.outbound() else {
            return false;
        };
        let mut list = self.subs.get_or_insert_with(channel, Vec::new);
        if list.iter().any(|s| s.id == conn.id()) {
            return false;
        }
        list.push(Subscriber { id: conn.id(), sender });
        true
    }

    fn unsubscribe_one(&self, conn: &mut ConnectionState, channel: &str) -> bool {
        conn.unsubscribe(channel);
        let mut emptied = false;
        let found = match self.subs.get_mut(channel) {
            None => false,
            Some(mut list) => {
                let before = list.len();
                list.retain(|s| s.id != conn.id());
                emptied = list.is_empty();
                before != list.len()
            }
        };
        if emptied {
            self.subs.remove(channel);
        }
        found
    }

    /// SUBSCRIBE channel [channel ...]: adds the connection to each list
    /// and confirms each subscription through the outbound channel.
    pub fn subscribe(&self, conn: &mut ConnectionState, channels: &[String]) {
        let _guard = self.locker.locks(channels);
        for channel in channels {
            if self.subscribe_one(conn, channel) {
                conn.push_message(make_msg("subscribe", channel, conn.subs_count() as i64));
            }
        }
    }

    /// UNSUBSCRIBE [channel ...]: with no channels, drops every current
    /// subscription of the connection.
    pub fn unsubscribe(&self, conn: &mut ConnectionState, channels: &[String]) {
        let channels: Vec<String> = if channels.is_empty() {
            conn.channels()
        } else {
            channels.to_vec()
        };

        if channels.is_empty() {
            // nothing to drop: a three-element ack with a nil channel
            conn.push_message(
                RespValue::Array(vec![
                    RespValue::bulk_string("unsubscribe"),
                    RespValue::Null,
                    RespValue::integer(0),
                ])
                .serialize(),
            );
            return;
        }

        let _guard = self.locker.locks(&channels);
        for channel in &channels {
            if self.unsubscribe_one(conn, channel) {
                conn.push_message(make_msg("unsubscribe", channel, conn.subs_count() as i64));
            }
        }
    }

    /// PUBLISH channel message: fans the payload out to every subscriber,
    /// pruning receivers whose connection has gone away. Returns the
    /// delivery count.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> i64 {
        let key = vec![channel.to_string()];
        let _guard = self.locker.locks(&key);

        let message = RespValue::Array(vec![
            RespValue::bulk_string("message"),
            RespValue::bulk_string(channel.as_bytes().to_vec()),
            RespValue::bulk_string(payload.to_vec()),
        ])
        .serialize();

        let mut emptied = false;
        let delivered = match self.subs.get_mut(channel) {
            None => 0,
            Some(mut list) => {
                list.retain(|subscriber| subscriber.sender.send(message.clone()).is_ok());
                emptied = list.is_empty();
                list.len() as i64
            }
        };
        if emptied {
            self.subs.remove(channel);
        }
        delivered
    }

    /// Drops all of a closing connection's subscriptions.
    pub fn unsubscribe_all(&self, conn: &mut ConnectionState) {
        let channels = conn.channels();
        if channels.is_empty() {
            return;
        }
        let _guard = self.locker.locks(&channels);
        for channel in &channels {
            self.unsubscribe_one(conn, channel);
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, channel: &str) -> usize {
        self.subs.get_ref(channel).map(|list| list.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_message;

    fn client() -> (ConnectionState, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionState::new(tx), rx)
    }

    #[tokio::test]
    async fn test_subscribe_and_publish() {
        let hub = Hub::new();
        let (mut subscriber, mut inbox) = client();

        hub.subscribe(&mut subscriber, &["news".to_string()]);
        let ack = inbox.try_recv().unwrap();
        let (value, _) = parse_message(&ack).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::bulk_string("subscribe"),
                RespValue::bulk_string("news"),
                RespValue::integer(1),
            ])
        );

        assert_eq!(hub.publish("news", b"hello"), 1);
        let delivery = inbox.try_recv().unwrap();
        let (value, _) = parse_message(&delivery).unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::bulk_string("message"),
                RespValue::bulk_string("news"),
                RespValue::bulk_string("hello"),
            ])
        );
    }

    #[tokio::test]
    async fn test_publish_to_empty_channel() {
        let hub = Hub::new();
        assert_eq!(hub.publish("void", b"x"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_ignored() {
        let hub = Hub::new();
        let (mut conn, mut inbox) = client();
        hub.subscribe(&mut conn, &["c".to_string()]);
        hub.subscribe(&mut conn, &["c".to_string()]);
        assert_eq!(hub.subscriber_count("c"), 1);
        // exactly one confirmation
        assert!(inbox.try_recv().is_ok());
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_args_drops_everything() {
        let hub = Hub::new();
        let (mut conn, _inbox) = client();
        hub.subscribe(&mut conn, &["a".to_string(), "b".to_string()]);
        assert_eq!(conn.subs_count(), 2);

        hub.unsubscribe(&mut conn, &[]);
        assert_eq!(conn.subs_count(), 0);
        assert_eq!(hub.subscriber_count("a"), 0);
        assert_eq!(hub.subscriber_count("b"), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_counted() {
        let hub = Hub::new();
        let (mut a, mut inbox_a) = client();
        let (mut b, mut inbox_b) = client();
        hub.subscribe(&mut a, &["c".to_string()]);
        hub.subscribe(&mut b, &["c".to_string()]);
        assert_eq!(hub.publish("c", b"x"), 2);

        inbox_a.try_recv().unwrap(); // subscribe ack
        inbox_b.try_recv().unwrap();
        assert!(inbox_a.try_recv().is_ok());
        assert!(inbox_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_pruned_on_publish() {
        let hub = Hub::new();
        let (mut gone, inbox) = client();
        hub.subscribe(&mut gone, &["c".to_string()]);
        drop(inbox);
        assert_eq!(hub.publish("c", b"x"), 0);
        assert_eq!(hub.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_on_close() {
        let hub = Hub::new();
        let (mut conn, _inbox) = client();
        hub.subscribe(&mut conn, &["x".to_string(), "y".to_string()]);
        hub.unsubscribe_all(&mut conn);
        assert_eq!(hub.subscriber_count("x"), 0);
        assert_eq!(hub.subscriber_count("y"), 0);
    }
}
