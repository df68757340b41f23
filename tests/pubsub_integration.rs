//! Purpose: End-to-end pub/sub flows over the public API.
//! Role: Integration tests for publish, receive, vacuum, and control paths.
//! Invariants: Uses temporary directories; never touches shared state.
//! Invariants: Sleeps are bounded to keep CI deterministic.
use std::collections::BTreeSet;
use std::thread::sleep;
use std::time::Duration;

use postbus::api::{
    Environment, EnvironmentOptions, HighWaterMark, ReceiveOptions, Strategy,
};

fn subs(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn small_options() -> EnvironmentOptions {
    EnvironmentOptions {
        max_reader_num: 16,
        max_db_num: 32,
        max_db_size_bytes: 10 * 1024 * 1024,
    }
}

fn quick_receive() -> ReceiveOptions {
    ReceiveOptions {
        timeout: Duration::from_millis(200),
        retries: 4,
    }
}

fn open_initialized(
    dir: &std::path::Path,
    ids: &[&str],
    hwm: HighWaterMark,
    strategy: Strategy,
) -> Environment {
    let environment = Environment::with_options(dir, small_options()).expect("open environment");
    environment
        .control()
        .initialize(&subs(ids), hwm, strategy)
        .expect("initialize");
    environment
}

#[test]
fn single_pub_sub_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher().expect("publisher");
    publisher.send(b"Hello there!").expect("send");

    let subscriber = environment.subscriber("sub").expect("subscriber");
    let message = subscriber
        .receive_with(quick_receive())
        .expect("receive")
        .expect("message");
    assert_eq!(message.payload(), b"Hello there!");
    message.ack().expect("ack");

    assert!(subscriber.front().expect("front").is_none());
}

#[test]
fn broadcast_reaches_every_subscriber_independently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub1", "sub2"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher().expect("publisher");
    publisher.send(b"I'm a message.\n").expect("send");

    let sub1 = environment.subscriber("sub1").expect("sub1");
    let sub2 = environment.subscriber("sub2").expect("sub2");
    assert_eq!(sub1.front().expect("front"), Some(b"I'm a message.\n".to_vec()));
    assert_eq!(sub2.front().expect("front"), Some(b"I'm a message.\n".to_vec()));

    assert!(sub1.pop().expect("pop"));
    assert!(sub1.front().expect("front").is_none());
    assert_eq!(sub2.front().expect("front"), Some(b"I'm a message.\n".to_vec()));
}

#[test]
fn batched_send_many_delivers_both_payloads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher_with(false).expect("publisher");
    publisher
        .send_many(&[b"What's up?".as_slice(), b"Do you like the README?"])
        .expect("send_many");

    let queue = environment.queue().expect("queue");
    assert_eq!(queue.count_msgs().expect("count"), 2);

    let subscriber = environment.subscriber("sub").expect("subscriber");
    let mut seen = Vec::new();
    for _ in 0..2 {
        let message = subscriber
            .receive_with(quick_receive())
            .expect("receive")
            .expect("message");
        seen.push(message.payload().to_vec());
        message.ack().expect("ack");
    }
    seen.sort();
    let mut expected = vec![b"Do you like the README?".to_vec(), b"What's up?".to_vec()];
    expected.sort();
    assert_eq!(seen, expected);
}

#[test]
fn dangling_messages_are_reclaimed_after_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hwm = HighWaterMark {
        msg_timeout_secs: 0,
        ..HighWaterMark::default()
    };
    let environment = open_initialized(dir.path(), &["sub"], hwm, Strategy::PruneFirst);

    let publisher = environment.publisher().expect("publisher");
    publisher.send(b"short-lived").expect("send");

    sleep(Duration::from_millis(1200));
    let stats = environment
        .control()
        .prune_dangling_messages()
        .expect("prune");
    assert_eq!(stats.dangling_reclaimed, 1);

    let queue = environment.queue().expect("queue");
    assert_eq!(queue.count_msgs().expect("count"), 0);
    let subscriber = environment.subscriber("sub").expect("subscriber");
    assert!(subscriber.front().expect("front").is_none());
}

#[test]
fn overflow_converges_below_the_high_water_mark() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hwm = HighWaterMark {
        max_msgs_num: 4,
        ..HighWaterMark::default()
    };
    let environment = open_initialized(dir.path(), &["sub"], hwm, Strategy::PruneFirst);

    let publisher = environment.publisher().expect("publisher");
    let payloads: Vec<&[u8]> = vec![b"1", b"2", b"3", b"4", b"5"];
    for payload in &payloads {
        publisher.send(payload).expect("send");
    }

    let queue = environment.queue().expect("queue");
    assert!(queue.count_msgs().expect("count") <= 4);

    let subscriber = environment.subscriber("sub").expect("subscriber");
    let mut remaining = Vec::new();
    while let Some(payload) = subscriber.front().expect("front") {
        remaining.push(payload);
        subscriber.pop().expect("pop");
    }
    assert!(remaining.len() <= 3);
    for payload in &remaining {
        assert!(payloads.iter().any(|p| *p == payload.as_slice()));
    }
    // Vacuum runs before the fifth write, so the newest message survives.
    assert!(remaining.iter().any(|p| p.as_slice() == b"5"));
}

#[test]
fn receive_to_top_skips_to_newest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher().expect("publisher");
    // Sent one second apart so msg ids are strictly ordered.
    publisher.send(b"a").expect("send");
    sleep(Duration::from_millis(1100));
    publisher.send(b"b").expect("send");
    sleep(Duration::from_millis(1100));
    publisher.send(b"c").expect("send");

    let subscriber = environment.subscriber("sub").expect("subscriber");
    let top = subscriber
        .receive_to_top()
        .expect("receive_to_top")
        .expect("message");
    assert_eq!(top.payload(), b"c");
    top.ack().expect("ack");

    assert!(subscriber.front().expect("front").is_none());
}

#[test]
fn unacked_guard_leaves_message_queued() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher().expect("publisher");
    publisher.send(b"try again").expect("send");

    let subscriber = environment.subscriber("sub").expect("subscriber");
    {
        let message = subscriber
            .receive_with(quick_receive())
            .expect("receive")
            .expect("message");
        assert_eq!(message.payload(), b"try again");
        // Dropped without ack: abnormal release.
    }

    let message = subscriber
        .receive_with(quick_receive())
        .expect("receive")
        .expect("redelivered");
    assert_eq!(message.payload(), b"try again");
    message.ack().expect("ack");
    assert!(subscriber.front().expect("front").is_none());
}

#[test]
fn receive_times_out_with_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["sub"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let subscriber = environment.subscriber("sub").expect("subscriber");
    let outcome = subscriber.receive_with(quick_receive()).expect("receive");
    assert!(outcome.is_none());
}

#[test]
fn queue_stays_consistent_across_a_workload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let environment = open_initialized(
        dir.path(),
        &["a", "b", "c"],
        HighWaterMark::default(),
        Strategy::PruneFirst,
    );

    let publisher = environment.publisher().expect("publisher");
    for i in 0..20u8 {
        publisher.send(&[i]).expect("send");
    }
    let sub_a = environment.subscriber("a").expect("a");
    let sub_b = environment.subscriber("b").expect("b");
    for _ in 0..20 {
        sub_a.pop().expect("pop a");
    }
    for _ in 0..7 {
        sub_b.pop().expect("pop b");
    }
    environment
        .control()
        .prune_dangling_messages()
        .expect("prune");

    let report = environment.control().check().expect("check");
    assert!(report.is_consistent(), "issues: {:?}", report.issues);
}

#[test]
fn payloads_survive_environment_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let environment = open_initialized(
            dir.path(),
            &["sub"],
            HighWaterMark::default(),
            Strategy::PruneFirst,
        );
        let publisher = environment.publisher().expect("publisher");
        publisher.send(b"durable").expect("send");
    }

    let environment =
        Environment::with_options(dir.path(), small_options()).expect("reopen environment");
    let subscriber = environment.subscriber("sub").expect("subscriber");
    let message = subscriber
        .receive_with(quick_receive())
        .expect("receive")
        .expect("message");
    assert_eq!(message.payload(), b"durable");
}
