//! End-to-end scenarios against the public store API
//!
//! Clients here are real `Client` handles whose outbound queues stand in for
//! the socket writer; a delivered message is one the I/O layer would frame
//! and send.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use embermq::{Client, Publish, QoS, SubscriptionStore};

fn store() -> SubscriptionStore {
    SubscriptionStore::new(1000)
}

fn connect(store: &SubscriptionStore, id: &str, fd: i32) -> Arc<Client> {
    let client = Arc::new(Client::new(fd, id.into(), false, Duration::from_secs(60)));
    store.register_client(&client).unwrap();
    client
}

fn publish(store: &SubscriptionStore, topic: &str, payload: &str, qos: QoS) {
    store
        .publish(&Publish::new(topic, payload.as_bytes().to_vec(), qos))
        .unwrap();
}

#[test]
fn single_level_wildcard_delivery() {
    let store = store();
    let a = connect(&store, "client-A", 1);
    let _b = connect(&store, "client-B", 2);
    store.subscribe(&a, "a/+/c", QoS::AtLeastOnce).unwrap();

    publish(&store, "a/b/c", "x", QoS::AtLeastOnce);

    let out = a.drain_outbound();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].topic, "a/b/c");
    assert_eq!(out[0].payload.as_ref(), b"x");
    assert_eq!(out[0].qos, QoS::AtLeastOnce);
}

#[test]
fn multi_level_wildcard_matches_parent_and_descendants() {
    let store = store();
    let a = connect(&store, "A", 1);
    store.subscribe(&a, "a/#", QoS::AtMostOnce).unwrap();

    publish(&store, "a", "1", QoS::AtMostOnce);
    publish(&store, "a/b", "2", QoS::AtMostOnce);
    publish(&store, "a/b/c", "3", QoS::AtMostOnce);

    let topics: Vec<_> = a.drain_outbound().into_iter().map(|m| m.topic).collect();
    assert_eq!(topics, vec!["a", "a/b", "a/b/c"]);
}

#[test]
fn dollar_topics_are_isolated_from_root_wildcards() {
    let store = store();
    let a = connect(&store, "A", 1);
    store.subscribe(&a, "#", QoS::AtMostOnce).unwrap();

    publish(&store, "$SYS/up", "1", QoS::AtMostOnce);
    assert!(a.drain_outbound().is_empty());

    let b = connect(&store, "B", 2);
    store.subscribe(&b, "$SYS/#", QoS::AtMostOnce).unwrap();
    publish(&store, "$SYS/up", "1", QoS::AtMostOnce);

    assert!(a.drain_outbound().is_empty());
    assert_eq!(b.drain_outbound().len(), 1);
}

#[test]
fn retained_message_delivered_on_subscribe() {
    let store = store();
    store
        .set_retained("a/b", Bytes::from_static(b"v1"), QoS::AtLeastOnce)
        .unwrap();

    let a = connect(&store, "A", 1);
    store.subscribe(&a, "a/+", QoS::AtMostOnce).unwrap();

    let out = a.drain_outbound();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].topic, "a/b");
    assert_eq!(out[0].payload.as_ref(), b"v1");
    assert_eq!(out[0].qos, QoS::AtMostOnce);
    assert!(out[0].retain);
}

#[test]
fn cleared_retained_message_is_gone() {
    let store = store();
    store
        .set_retained("a/b", Bytes::from_static(b"v1"), QoS::AtLeastOnce)
        .unwrap();
    store
        .set_retained("a/b", Bytes::new(), QoS::AtMostOnce)
        .unwrap();

    let a = connect(&store, "A", 1);
    store.subscribe(&a, "a/+", QoS::AtMostOnce).unwrap();
    assert!(a.drain_outbound().is_empty());
    assert_eq!(store.retained_count(), 0);
}

#[test]
fn takeover_kicks_previous_connection() {
    let store = store();
    let c1 = connect(&store, "k", 1);
    store.subscribe(&c1, "news/#", QoS::AtLeastOnce).unwrap();

    let c2 = connect(&store, "k", 2);

    assert!(c1.is_disconnecting());
    assert!(!c2.is_disconnecting());

    let session = store.get_session("k").unwrap();
    let bearer = session.active_client().unwrap();
    assert!(Arc::ptr_eq(&bearer, &c2));

    // the durable subscription now reaches the new bearer
    publish(&store, "news/tech", "headline", QoS::AtLeastOnce);
    assert!(c1.drain_outbound().is_empty());
    assert_eq!(c2.drain_outbound().len(), 1);
}

#[test]
fn resubscribe_upgrades_instead_of_duplicating() {
    let store = store();
    let a = connect(&store, "A", 1);
    store.subscribe(&a, "up/grade", QoS::AtMostOnce).unwrap();
    store.subscribe(&a, "up/grade", QoS::AtLeastOnce).unwrap();

    publish(&store, "up/grade", "x", QoS::ExactlyOnce);

    let out = a.drain_outbound();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].qos, QoS::AtLeastOnce);
}

#[test]
fn overlapping_filters_deliver_once_each() {
    let store = store();
    let a = connect(&store, "A", 1);
    store.subscribe(&a, "a/#", QoS::AtMostOnce).unwrap();
    store.subscribe(&a, "a/+", QoS::AtMostOnce).unwrap();

    publish(&store, "a/b", "x", QoS::AtMostOnce);

    // one delivery per matching subscription record
    assert_eq!(a.drain_outbound().len(), 2);
}

#[test]
fn expired_session_is_unreachable_after_sweep() {
    let store = store();
    let c = connect(&store, "gone", 1);
    store.subscribe(&c, "a/#", QoS::AtLeastOnce).unwrap();
    c.mark_disconnecting();

    store.expire_sessions(Duration::from_secs(0));

    assert_eq!(store.session_count(), 0);
    publish(&store, "a/b", "x", QoS::AtLeastOnce);
    assert!(c.drain_outbound().is_empty());
}

#[test]
fn single_publisher_order_is_preserved() {
    let store = Arc::new(store());
    let sub = connect(&store, "sub", 1);
    store.subscribe(&sub, "t", QoS::AtLeastOnce).unwrap();

    let publisher = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..100 {
                store
                    .publish(&Publish::new("t", format!("{i}").into_bytes(), QoS::AtLeastOnce))
                    .unwrap();
            }
        })
    };
    publisher.join().unwrap();

    let payloads: Vec<String> = sub
        .drain_outbound()
        .into_iter()
        .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    assert_eq!(payloads, expected);
}

#[test]
fn per_publisher_order_holds_across_concurrent_publishers() {
    let store = Arc::new(store());
    let sub = connect(&store, "sub", 1);
    store.subscribe(&sub, "t/#", QoS::AtLeastOnce).unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|p| {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let payload = format!("{p}:{i}").into_bytes();
                    store
                        .publish(&Publish::new("t/x", payload, QoS::AtLeastOnce))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in publishers {
        handle.join().unwrap();
    }

    let received: Vec<String> = sub
        .drain_outbound()
        .into_iter()
        .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
        .collect();
    assert_eq!(received.len(), 200);

    // within each publisher the sequence numbers must come out ascending
    for p in 0..4 {
        let prefix = format!("{p}:");
        let seq: Vec<usize> = received
            .iter()
            .filter_map(|m| m.strip_prefix(&prefix))
            .map(|i| i.parse().unwrap())
            .collect();
        let mut sorted = seq.clone();
        sorted.sort_unstable();
        assert_eq!(seq, sorted, "publisher {p} order broken");
        assert_eq!(seq.len(), 50);
    }
}

#[test]
fn subscription_mutations_race_with_publishers() {
    let store = Arc::new(store());
    let sub = connect(&store, "racer", 1);

    let publisher = {
        let store = store.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                store
                    .publish(&Publish::new("r/t", b"x".to_vec(), QoS::AtMostOnce))
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        store.subscribe(&sub, "r/+", QoS::AtMostOnce).unwrap();
        store.unsubscribe(&sub, "r/+").unwrap();
    }
    publisher.join().unwrap();

    // no panic, no duplicate subscription: one final subscribe must yield
    // exactly one delivery per publish
    sub.drain_outbound();
    store.subscribe(&sub, "r/+", QoS::AtMostOnce).unwrap();
    publish(&store, "r/t", "final", QoS::AtMostOnce);
    assert_eq!(sub.drain_outbound().len(), 1);
}
