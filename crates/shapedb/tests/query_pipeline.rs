//! End-to-end query pipeline tests through the public facade.

use std::sync::Arc;

use shapedb::{
    BinOp, CollectionKind, DocValue, DocumentStore, Expr, NodeKind, PlanNode, Query, ShapeDbError,
    SortCriterion,
};

fn doc(value: serde_json::Value) -> DocValue {
    DocValue::from(value)
}

fn seed_orders(store: &Arc<DocumentStore>) {
    let orders = store
        .create_collection("orders", CollectionKind::Document)
        .unwrap();
    for (key, amount, customer) in [
        ("o1", 40, "alice"),
        ("o2", 15, "bob"),
        ("o3", 75, "alice"),
        ("o4", 5, "carol"),
        ("o5", 60, "bob"),
    ] {
        store
            .insert_document(
                &orders,
                Some(key.into()),
                &doc(serde_json::json!({ "amount": amount, "customer": customer })),
            )
            .unwrap();
    }
}

#[test]
fn filter_query_returns_matching_documents() {
    let store = DocumentStore::in_memory();
    seed_orders(&store);

    // FOR o IN orders FILTER o.amount > 50 RETURN o
    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "orders".into(),
        out: 0,
    })
    .then(NodeKind::Calculation {
        expr: Expr::binary(
            BinOp::Gt,
            Expr::attribute(0, "amount"),
            Expr::Constant(DocValue::Number(50.0)),
        ),
        out: 1,
    })
    .then(NodeKind::Filter { condition: 1 })
    .then(NodeKind::Return { reg: 0 });

    let values = Query::new(Arc::clone(&store), &plan)
        .unwrap()
        .execute_values()
        .unwrap();
    let mut keys: Vec<&str> = values
        .iter()
        .map(|v| v.get("_key").and_then(DocValue::as_str).unwrap())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["o3", "o5"]);
    for value in &values {
        assert!(value.get("_rev").is_some());
    }
}

#[test]
fn sort_and_limit_pick_the_top_results() {
    let store = DocumentStore::in_memory();
    seed_orders(&store);

    // FOR o IN orders SORT o.amount DESC LIMIT 2 RETURN o.amount
    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "orders".into(),
        out: 0,
    })
    .then(NodeKind::Calculation {
        expr: Expr::attribute(0, "amount"),
        out: 1,
    })
    .then(NodeKind::Sort {
        criteria: vec![SortCriterion {
            reg: 1,
            ascending: false,
        }],
        stable: false,
    })
    .then(NodeKind::Limit {
        offset: 0,
        limit: 2,
    })
    .then(NodeKind::Return { reg: 1 });

    let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
    assert_eq!(
        values,
        vec![DocValue::Number(75.0), DocValue::Number(60.0)]
    );
}

#[test]
fn aggregate_over_sorted_groups() {
    let store = DocumentStore::in_memory();
    seed_orders(&store);

    // FOR o IN orders SORT o.customer COLLECT c = o.customer INTO g RETURN c
    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "orders".into(),
        out: 0,
    })
    .then(NodeKind::Calculation {
        expr: Expr::attribute(0, "customer"),
        out: 1,
    })
    .then(NodeKind::Sort {
        criteria: vec![SortCriterion {
            reg: 1,
            ascending: true,
        }],
        stable: true,
    })
    .then(NodeKind::Aggregate {
        groups: vec![(1, 2)],
        into: Some((0, 3)),
    })
    .then(NodeKind::Return { reg: 2 });

    let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
    assert_eq!(
        values,
        vec![
            DocValue::String("alice".into()),
            DocValue::String("bob".into()),
            DocValue::String("carol".into()),
        ]
    );
}

#[test]
fn subquery_runs_once_per_outer_row() {
    let store = DocumentStore::in_memory();
    seed_orders(&store);

    // FOR o IN orders LIMIT 2 LET sub = (FOR i IN orders LIMIT 1 RETURN i.amount) RETURN sub
    let subplan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "orders".into(),
        out: 1,
    })
    .then(NodeKind::Limit {
        offset: 0,
        limit: 1,
    })
    .then(NodeKind::Calculation {
        expr: Expr::attribute(1, "amount"),
        out: 2,
    })
    .then(NodeKind::Return { reg: 2 });

    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "orders".into(),
        out: 0,
    })
    .then(NodeKind::Limit {
        offset: 0,
        limit: 2,
    })
    .then(NodeKind::Subquery {
        subplan: Box::new(subplan),
        out: 3,
    })
    .then(NodeKind::Return { reg: 3 });

    let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
    assert_eq!(values.len(), 2);
    for value in values {
        assert_eq!(value, DocValue::List(vec![DocValue::Number(40.0)]));
    }
}

#[test]
fn modification_query_is_transactional() {
    let store = DocumentStore::in_memory();
    seed_orders(&store);
    let orders = store.collection("orders").unwrap();
    assert_eq!(orders.count(), 5);

    // Removing an existing key plus a missing one fails and rolls back.
    let plan = PlanNode::new(NodeKind::Singleton)
        .then(PlanNode::constant(
            doc(serde_json::json!(["o1", "missing"])),
            0,
        ))
        .then(NodeKind::EnumerateList { list: 0, out: 1 })
        .then(NodeKind::Remove {
            collection: "orders".into(),
            reg: 1,
            ignore_errors: false,
        });

    let result = Query::new(Arc::clone(&store), &plan).unwrap().execute();
    assert!(result.is_err());
    assert_eq!(orders.count(), 5);
}

#[test]
fn unknown_collection_fails_at_plan_time() {
    let store = DocumentStore::in_memory();
    let plan = PlanNode::new(NodeKind::EnumerateCollection {
        collection: "nope".into(),
        out: 0,
    })
    .then(NodeKind::Return { reg: 0 });
    let err = Query::new(store, &plan).err().unwrap();
    assert!(matches!(err, ShapeDbError::NotFound { .. }));
}
