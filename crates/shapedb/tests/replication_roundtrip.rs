//! Store, logger and dumper working together across a reopen.

use std::sync::Arc;

use shapedb::{
    CollectionKind, DocValue, DocumentStore, LoggerConfig, NodeKind, PlanNode, Query,
    ReplicationLogger, ServerId, Tick,
};

fn doc(value: serde_json::Value) -> DocValue {
    DocValue::from(value)
}

// RUST_LOG=shapedb=debug surfaces store and logger tracing during a run.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn parse_lines(buffer: &str) -> Vec<serde_json::Value> {
    buffer
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn a_follower_can_replay_the_log_in_chunks() {
    init_tracing();
    let store = DocumentStore::in_memory();
    let logger = ReplicationLogger::new(
        Arc::clone(&store),
        LoggerConfig::default(),
        ServerId(1),
    )
    .unwrap();
    let orders = store
        .create_collection("orders", CollectionKind::Document)
        .unwrap();
    logger.start().unwrap();

    for i in 0..20 {
        store
            .insert_document(
                &orders,
                Some(format!("k{i}")),
                &doc(serde_json::json!({ "i": i })),
            )
            .unwrap();
    }
    store.remove_document(&orders, "k0").unwrap();

    // Tail the log in small chunks, as an HTTP follower would.
    let mut from = Tick::ZERO;
    let mut types = Vec::new();
    let mut last_tick = Tick::ZERO;
    loop {
        let chunk = logger.dump_log(from, Tick::MAX, 256).unwrap();
        for line in parse_lines(&chunk.buffer) {
            let tick: u64 = line["tick"].as_str().unwrap().parse().unwrap();
            assert!(Tick(tick) > last_tick, "ticks must be strictly increasing");
            last_tick = Tick(tick);
            types.push(line["type"].as_u64().unwrap());
        }
        logger.update_client(ServerId(7), chunk.last_included_tick);
        if !chunk.has_more {
            break;
        }
        from = chunk.last_included_tick.next();
    }

    assert_eq!(types.len(), 22);
    assert_eq!(types[0], 1001);
    assert_eq!(types[1..21], [2300; 20]);
    assert_eq!(types[21], 2302);
    assert_eq!(last_tick, logger.last_log_tick());
    assert_eq!(logger.clients()[0].last_served_tick, last_tick);
}

#[test]
fn reopened_store_serves_the_same_collection_dump() {
    let dir = tempfile::tempdir().unwrap();
    let before;
    {
        let store = DocumentStore::open(dir.path()).unwrap();
        let logger = ReplicationLogger::new(
            Arc::clone(&store),
            LoggerConfig::default(),
            ServerId(1),
        )
        .unwrap();
        let people = store
            .create_collection("people", CollectionKind::Document)
            .unwrap();
        for name in ["alice", "bob", "carol"] {
            store
                .insert_document(
                    &people,
                    Some(name.into()),
                    &doc(serde_json::json!({ "name": name, "pets": [1, 2] })),
                )
                .unwrap();
        }
        store.update_document(
            &people,
            "bob",
            &doc(serde_json::json!({ "name": "bob", "pets": [] })),
        )
        .unwrap();
        before = logger
            .dump_collection(&people, Tick::ZERO, Tick::MAX, usize::MAX, true, true)
            .unwrap()
            .buffer;
        store.clear_observer();
    }

    let store = DocumentStore::open(dir.path()).unwrap();
    let logger =
        ReplicationLogger::new(Arc::clone(&store), LoggerConfig::default(), ServerId(1)).unwrap();
    let people = store.collection("people").unwrap();
    let after = logger
        .dump_collection(&people, Tick::ZERO, Tick::MAX, usize::MAX, true, true)
        .unwrap()
        .buffer;
    assert_eq!(before, after);

    // The replayed store is also queryable.
    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "people".into(),
        out: 0,
    })
    .then(NodeKind::Return { reg: 0 });
    let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
    assert_eq!(values.len(), 3);
}

#[test]
fn query_writes_reach_the_replication_log_transactionally() {
    let store = DocumentStore::in_memory();
    let logger = ReplicationLogger::new(
        Arc::clone(&store),
        LoggerConfig::default(),
        ServerId(1),
    )
    .unwrap();
    store
        .create_collection("orders", CollectionKind::Document)
        .unwrap();
    logger.start().unwrap();

    let plan = PlanNode::new(NodeKind::Singleton)
        .then(PlanNode::constant(
            doc(serde_json::json!([
                { "_key": "a", "x": 1 },
                { "_key": "b", "x": 2 },
            ])),
            0,
        ))
        .then(NodeKind::EnumerateList { list: 0, out: 1 })
        .then(NodeKind::Insert {
            collection: "orders".into(),
            reg: 1,
            ignore_errors: false,
        });
    Query::new(Arc::clone(&store), &plan)
        .unwrap()
        .execute()
        .unwrap();

    let chunk = logger.dump_log(Tick::ZERO, Tick::MAX, usize::MAX).unwrap();
    let lines = parse_lines(&chunk.buffer);
    let types: Vec<u64> = lines
        .iter()
        .map(|line| line["type"].as_u64().unwrap())
        .collect();
    assert_eq!(types, vec![1001, 2200, 2300, 2300, 2201]);
    assert_eq!(lines[2]["data"]["x"].as_u64().unwrap(), 1);
}
