//! End-to-end tests for cluster routing over scripted connections.
//!
//! Each test boots a [`ClusterClient`] against a [`MemoryConnector`],
//! plays the server side of every node tick by tick, and asserts on the
//! exact bytes dispatched and the replies delivered.

use std::sync::{Arc, Mutex};

use kvlink::cluster::MigrationPlan;
use kvlink::error::ClientError;
use kvlink::protocol::command;
use kvlink::stream::MemoryConnector;
use kvlink::{ClusterClient, RespValue};

const A: &str = "127.0.0.1:7001";
const B: &str = "127.0.0.1:7002";
const C: &str = "127.0.0.1:7003";

type Reply = Arc<Mutex<Option<kvlink::Result<RespValue>>>>;

fn reply_slot() -> Reply {
    Arc::new(Mutex::new(None))
}

/// CLUSTER SLOTS reply for masters on 127.0.0.1.
fn slots_reply(entries: &[(u16, u16, i64, Option<&str>)]) -> RespValue {
    RespValue::array(
        entries
            .iter()
            .map(|(start, end, port, id)| {
                let mut master = vec![
                    RespValue::bulk_string("127.0.0.1".to_string()),
                    RespValue::integer(*port),
                ];
                if let Some(id) = id {
                    master.push(RespValue::bulk_string(id.to_string()));
                }
                RespValue::array(vec![
                    RespValue::integer(i64::from(*start)),
                    RespValue::integer(i64::from(*end)),
                    RespValue::array(master),
                ])
            })
            .collect(),
    )
}

/// Boot a client against node A owning the whole space.
async fn single_owner_client(
    connector: MemoryConnector,
) -> ClusterClient<MemoryConnector> {
    let mut client = ClusterClient::new(connector, vec![A.to_string()]);
    client.update().await;
    client
}

#[tokio::test]
async fn moved_redirect_refreshes_the_map_and_follows() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let b = connector.expect(B);
    let mut client = single_owner_client(connector).await;
    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    client.update().await;
    assert!(client.is_stable());
    a.take_written();

    let slot = reply_slot();
    let tx = slot.clone();
    client
        .send(
            command::request(&["GET", "foo"]),
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .unwrap();
    client.update().await;
    assert_eq!(
        a.take_written(),
        command::request(&["GET", "foo"]).serialize()
    );

    // The owner disagrees: the request follows the redirect and the map
    // is re-learned in the background.
    a.push_value(&RespValue::error(format!("MOVED 12182 {B}")));
    client.update().await;
    assert_eq!(
        b.take_written(),
        command::request(&["GET", "foo"]).serialize()
    );
    assert!(!client.is_stable());

    b.push_value(&RespValue::bulk_string("bar"));
    client.update().await;
    let reply = slot.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(reply, RespValue::bulk_string("bar"));

    // The refresh went to the first live node; feed it the new layout.
    assert_eq!(a.take_written(), command::cluster_slots().serialize());
    a.push_value(&slots_reply(&[
        (0, 8191, 7001, None),
        (8192, 16383, 7002, None),
    ]));
    client.update().await;
    assert!(client.is_stable());
    assert_eq!(client.topology().resolve(12182), Some(B));
}

#[tokio::test]
async fn ask_redirect_keeps_the_map_and_prefixes_asking() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let b = connector.expect(B);
    let mut client = single_owner_client(connector).await;
    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    client.update().await;
    a.take_written();

    let slot = reply_slot();
    let tx = slot.clone();
    client
        .send(
            command::request(&["GET", "foo"]),
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .unwrap();
    client.update().await;
    a.take_written();

    a.push_value(&RespValue::error(format!("ASK 12182 {B}")));
    client.update().await;
    // The retry carries the one-shot ASKING prefix.
    let mut expected = command::asking().serialize().to_vec();
    expected.extend_from_slice(&command::request(&["GET", "foo"]).serialize());
    assert_eq!(b.take_written(), expected);
    assert!(client.is_stable());

    b.push_value(&RespValue::ok());
    b.push_value(&RespValue::bulk_string("bar"));
    client.update().await;
    let reply = slot.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(reply, RespValue::bulk_string("bar"));

    // ASK is transient: the map still routes the slot to its old owner
    // and no refresh was issued.
    assert!(client.is_stable());
    assert_eq!(client.topology().resolve(12182), Some(A));
    assert!(a.take_written().is_empty());
}

#[tokio::test]
async fn redirect_chains_exhaust_their_budget() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let b = connector.expect(B);
    let mut client = single_owner_client(connector).await;
    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    client.update().await;

    let slot = reply_slot();
    let tx = slot.clone();
    client
        .send(
            command::request(&["GET", "foo"]),
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .unwrap();
    client.update().await;

    // Two nodes bounce the key back and forth with ASK. The budget
    // allows eight hops; the ninth resolves as an error.
    for i in 0..9 {
        let (from, to) = if i % 2 == 0 { (&a, B) } else { (&b, A) };
        if i > 0 {
            from.push_value(&RespValue::ok());
        }
        from.push_value(&RespValue::error(format!("ASK 12182 {to}")));
        client.update().await;
    }

    let result = slot.lock().unwrap().take().unwrap();
    assert!(matches!(result, Err(ClientError::TooManyRedirects(12182))));
    // ASK chains never invalidate the map.
    assert!(client.is_stable());
}

#[tokio::test]
async fn transactions_travel_as_one_pipeline() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let mut client = single_owner_client(connector).await;
    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    client.update().await;
    a.take_written();

    let commands = vec![
        command::request(&["SET", "{user:1}:a", "1"]),
        command::request(&["INCR", "{user:1}:b"]),
    ];
    let slot = reply_slot();
    let tx = slot.clone();
    client
        .send_transaction(
            commands.clone(),
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .unwrap();
    client.update().await;

    let mut expected = command::multi().serialize().to_vec();
    for cmd in &commands {
        expected.extend_from_slice(&cmd.serialize());
    }
    expected.extend_from_slice(&command::exec().serialize());
    assert_eq!(a.take_written(), expected);

    a.push_value(&RespValue::ok());
    a.push_value(&RespValue::simple_string("QUEUED"));
    a.push_value(&RespValue::simple_string("QUEUED"));
    let exec_reply = RespValue::array(vec![RespValue::ok(), RespValue::integer(2)]);
    a.push_value(&exec_reply);
    client.update().await;

    let reply = slot.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(reply, exec_reply);
}

#[tokio::test]
async fn map_refresh_drops_stale_nodes_and_fails_their_requests() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let c = connector.expect(C);
    let mut client = ClusterClient::new(connector, vec![A.to_string()]);

    client.update().await;
    a.push_value(&slots_reply(&[
        (0, 8191, 7001, None),
        (8192, 16383, 7003, None),
    ]));
    client.update().await;
    assert!(client.is_stable());
    a.take_written();

    // Slot 12182 lives on C; the request parks there.
    let slot = reply_slot();
    let tx = slot.clone();
    client
        .send(
            command::request(&["GET", "foo"]),
            Box::new(move |reply| {
                *tx.lock().unwrap() = Some(reply);
            }),
        )
        .unwrap();
    client.update().await;
    assert_eq!(
        c.take_written(),
        command::request(&["GET", "foo"]).serialize()
    );

    // A forced refresh reveals that C is gone entirely.
    client.invalidate_topology();
    client.update().await;
    assert_eq!(a.take_written(), command::cluster_slots().serialize());
    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    client.update().await;

    // Dropping C failed its in-flight request instead of leaving it
    // hanging.
    let result = slot.lock().unwrap().take().unwrap();
    assert!(matches!(result, Err(ClientError::NotConnected)));
    assert!(!client.topology().contains_addr(C));
    assert_eq!(client.topology().resolve(12182), Some(A));
}

#[tokio::test]
async fn pinned_requests_dispatch_before_the_map_settles() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let mut client = ClusterClient::new(connector, vec![A.to_string()]);

    let slot = reply_slot();
    let tx = slot.clone();
    client.send_to(
        A,
        command::request(&["INFO"]),
        Box::new(move |reply| {
            *tx.lock().unwrap() = Some(reply);
        }),
    );
    client.update().await;

    // Same tick, same connection: the bootstrap query goes out first,
    // the pinned request right behind it.
    let mut expected = command::cluster_slots().serialize().to_vec();
    expected.extend_from_slice(&command::request(&["INFO"]).serialize());
    assert_eq!(a.take_written(), expected);

    a.push_value(&slots_reply(&[(0, 16383, 7001, None)]));
    a.push_value(&RespValue::bulk_string("# Server"));
    client.update().await;
    assert!(client.is_stable());
    let reply = slot.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(reply, RespValue::bulk_string("# Server"));
}

#[tokio::test]
async fn cold_start_walks_seeds_until_one_answers() {
    let mut connector = MemoryConnector::new();
    // Only the second seed is up.
    let b = connector.expect(B);
    let mut client = ClusterClient::new(connector, vec![A.to_string(), B.to_string()]);

    client.update().await;
    assert_eq!(
        client.connector().connects().to_vec(),
        vec![A.to_string(), B.to_string()]
    );
    assert_eq!(b.take_written(), command::cluster_slots().serialize());

    b.push_value(&slots_reply(&[(0, 16383, 7002, None)]));
    client.update().await;
    assert!(client.is_stable());
}

fn setslot_bytes(slot: u16, action: &str, id: &str) -> Vec<u8> {
    let slot_text = slot.to_string();
    command::request(&["CLUSTER", "SETSLOT", slot_text.as_str(), action, id])
        .serialize()
        .to_vec()
}

fn getkeys_bytes(slot: u16) -> Vec<u8> {
    let slot_text = slot.to_string();
    command::request(&["CLUSTER", "GETKEYSINSLOT", slot_text.as_str(), "16"])
        .serialize()
        .to_vec()
}

fn migrate_bytes(key: &str) -> Vec<u8> {
    command::request(&["MIGRATE", "127.0.0.1", "7002", key, "0", "5000"])
        .serialize()
        .to_vec()
}

#[tokio::test]
async fn slot_migration_walks_the_handoff_protocol() {
    let mut connector = MemoryConnector::new();
    let a = connector.expect(A);
    let b = connector.expect(B);
    let mut client = ClusterClient::new(connector, vec![A.to_string()]);

    client.update().await;
    a.push_value(&slots_reply(&[
        (0, 8191, 7001, Some("node-a")),
        (8192, 16383, 7002, Some("node-b")),
    ]));
    client.update().await;
    assert!(client.is_stable());
    a.take_written();
    b.take_written();

    let done: Arc<Mutex<Option<kvlink::Result<()>>>> = Arc::new(Mutex::new(None));
    let tx = done.clone();
    client.begin_migration(
        MigrationPlan::new(42, B),
        Box::new(move |result| {
            *tx.lock().unwrap() = Some(result);
        }),
    );

    // Target learns it is importing from the source.
    client.update().await;
    assert_eq!(b.take_written(), setslot_bytes(42, "IMPORTING", "node-a"));

    // Source learns it is migrating to the target.
    b.push_value(&RespValue::ok());
    client.update().await;
    assert_eq!(a.take_written(), setslot_bytes(42, "MIGRATING", "node-b"));

    // First key batch.
    a.push_value(&RespValue::ok());
    client.update().await;
    assert_eq!(a.take_written(), getkeys_bytes(42));

    a.push_value(&RespValue::array(vec![
        RespValue::bulk_string("k1"),
        RespValue::bulk_string("k2"),
    ]));
    client.update().await;
    assert_eq!(a.take_written(), migrate_bytes("k1"));

    a.push_value(&RespValue::ok());
    client.update().await;
    assert_eq!(a.take_written(), migrate_bytes("k2"));

    // Batch drained; the source is asked again and reports empty.
    a.push_value(&RespValue::ok());
    client.update().await;
    assert_eq!(a.take_written(), getkeys_bytes(42));

    a.push_value(&RespValue::array(vec![]));
    client.update().await;
    // Ownership flips on the target first, then on the source.
    assert_eq!(b.take_written(), setslot_bytes(42, "NODE", "node-b"));

    b.push_value(&RespValue::ok());
    client.update().await;
    assert_eq!(a.take_written(), setslot_bytes(42, "NODE", "node-b"));

    a.push_value(&RespValue::ok());
    client.update().await;
    let result = done.lock().unwrap().take().unwrap();
    assert!(result.is_ok());
    // The handoff staled the map on purpose.
    assert!(!client.is_stable());

    client.update().await;
    assert_eq!(a.take_written(), command::cluster_slots().serialize());
    a.push_value(&slots_reply(&[
        (0, 41, 7001, Some("node-a")),
        (42, 42, 7002, Some("node-b")),
        (43, 8191, 7001, Some("node-a")),
        (8192, 16383, 7002, Some("node-b")),
    ]));
    client.update().await;
    assert!(client.is_stable());
    assert_eq!(client.topology().resolve(42), Some(B));
}
