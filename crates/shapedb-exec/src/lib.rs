//! Pull-based query execution over item blocks.
//!
//! A physical plan (a chain of operator descriptors with variables already
//! resolved to register indices) instantiates into a tree of execution
//! blocks implementing the `get_some`/`skip_some` contract. Blocks of rows
//! times registers flow upward; shaped documents stay unmaterialized in
//! their registers until an expression or the result boundary needs them.

pub mod block;
pub mod engine;
pub mod expr;
pub mod modify;
pub mod plan;
pub mod scan;
pub mod sort;
pub mod subquery;
pub mod transform;
pub mod value;

pub use block::{ItemBlock, RegisterId};
pub use engine::{ExecutionBlock, KillHandle, Query, QueryContext, DEFAULT_BATCH, REMAINING_UNKNOWN};
pub use expr::{BinOp, Expr};
pub use plan::{NodeKind, PlanNode, SortCriterion};
pub use value::{compare_doc_values, AqlValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use shapedb_store::{CollectionKind, DocumentStore};
    use shapedb_types::DocValue;

    fn store_with_docs(docs: &[serde_json::Value]) -> Arc<DocumentStore> {
        let store = DocumentStore::in_memory();
        let coll = store
            .create_collection("c", CollectionKind::Document)
            .unwrap();
        for doc in docs {
            let mut value = DocValue::from(doc.clone());
            let key = value.get("_key").and_then(DocValue::as_str).map(str::to_owned);
            if let DocValue::Object(attrs) = &mut value {
                attrs.retain(|(k, _)| k != "_key");
            }
            store.insert_document(&coll, key, &value).unwrap();
        }
        store
    }

    fn two_docs() -> Arc<DocumentStore> {
        store_with_docs(&[
            serde_json::json!({"_key": "a", "x": 1}),
            serde_json::json!({"_key": "b", "x": 2}),
        ])
    }

    fn filter_plan() -> PlanNode {
        PlanNode::new(NodeKind::EnumerateCollection {
            collection: "c".into(),
            out: 0,
        })
        .then(NodeKind::Calculation {
            expr: Expr::binary(
                BinOp::Gt,
                Expr::attribute(0, "x"),
                Expr::Constant(DocValue::Number(1.0)),
            ),
            out: 1,
        })
        .then(NodeKind::Filter { condition: 1 })
        .then(NodeKind::Return { reg: 0 })
    }

    #[test]
    fn enumerate_filter_return() {
        let store = two_docs();
        let query = Query::new(Arc::clone(&store), &filter_plan()).unwrap();
        let values = query.execute_values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].get("_key"),
            Some(&DocValue::String("b".into()))
        );
        assert_eq!(values[0].get("x"), Some(&DocValue::Number(2.0)));
    }

    #[test]
    fn sort_desc_limit_one() {
        let store = two_docs();
        let plan = PlanNode::new(NodeKind::EnumerateCollection {
            collection: "c".into(),
            out: 0,
        })
        .then(NodeKind::Calculation {
            expr: Expr::attribute(0, "x"),
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
            limit: 1,
        })
        .then(NodeKind::Return { reg: 0 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values[0].get("_key"),
            Some(&DocValue::String("b".into()))
        );
        assert_eq!(values[0].get("x"), Some(&DocValue::Number(2.0)));
    }

    #[test]
    fn scan_snapshot_waits_for_the_collection_write_lock() {
        let store = two_docs();
        let coll = store.collection("c").unwrap();
        let guard = coll.begin_write();
        let (tx, rx) = std::sync::mpsc::channel();
        let query_store = Arc::clone(&store);
        let handle = std::thread::spawn(move || {
            let values = Query::new(query_store, &filter_plan())
                .unwrap()
                .execute_values()
                .unwrap();
            tx.send(values.len()).unwrap();
        });
        // The snapshot cannot be taken while a write holds the lock.
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(100))
            .is_err());
        drop(guard);
        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(),
            1
        );
        handle.join().unwrap();
    }

    #[test]
    fn batched_pulls_match_one_big_pull() {
        let docs: Vec<serde_json::Value> = (0..57)
            .map(|i| serde_json::json!({"_key": format!("k{i}"), "x": i}))
            .collect();
        let store = store_with_docs(&docs);

        let big = Query::new(Arc::clone(&store), &filter_plan())
            .unwrap()
            .execute_values()
            .unwrap();

        let ctx = QueryContext::new(Arc::clone(&store));
        let mut root = plan::instantiate(&filter_plan(), &ctx).unwrap();
        root.initialize().unwrap();
        root.init_cursor(None).unwrap();
        let mut small = Vec::new();
        while let Some(block) = root.get_some(1, 3).unwrap() {
            assert!(block.rows() >= 1);
            for row in 0..block.rows() {
                small.push(
                    block
                        .get(row, 0)
                        .unwrap()
                        .materialize(ctx.store())
                        .unwrap(),
                );
            }
        }
        assert_eq!(small.len(), big.len());
        assert_eq!(small, big);
    }

    #[test]
    fn limit_state_machine_window() {
        let docs: Vec<serde_json::Value> = (0..10)
            .map(|i| serde_json::json!({"_key": format!("k{i:02}"), "x": i}))
            .collect();
        let store = store_with_docs(&docs);
        let plan = PlanNode::new(NodeKind::EnumerateCollection {
            collection: "c".into(),
            out: 0,
        })
        .then(NodeKind::Limit {
            offset: 2,
            limit: 3,
        })
        .then(NodeKind::Calculation {
            expr: Expr::attribute(0, "x"),
            out: 1,
        })
        .then(NodeKind::Return { reg: 1 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(
            values,
            vec![
                DocValue::Number(2.0),
                DocValue::Number(3.0),
                DocValue::Number(4.0)
            ]
        );
    }

    #[test]
    fn index_range_scan() {
        let store = store_with_docs(&[
            serde_json::json!({"_key": "a"}),
            serde_json::json!({"_key": "b"}),
            serde_json::json!({"_key": "c"}),
            serde_json::json!({"_key": "d"}),
        ]);
        let plan = PlanNode::new(NodeKind::IndexRange {
            collection: "c".into(),
            from_key: "b".into(),
            to_key: "c".into(),
            out: 0,
        })
        .then(NodeKind::Return { reg: 0 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        let keys: Vec<_> = values
            .iter()
            .map(|v| v.get("_key").and_then(DocValue::as_str).unwrap().to_owned())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn enumerate_list_flattens() {
        let store = DocumentStore::in_memory();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::Number(10.0),
                    DocValue::Number(20.0),
                    DocValue::Number(30.0),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Return { reg: 1 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(
            values,
            vec![
                DocValue::Number(10.0),
                DocValue::Number(20.0),
                DocValue::Number(30.0)
            ]
        );
    }

    #[test]
    fn sort_is_stable_when_requested() {
        let store = store_with_docs(&[
            serde_json::json!({"_key": "a", "g": 1, "i": 0}),
            serde_json::json!({"_key": "b", "g": 1, "i": 1}),
            serde_json::json!({"_key": "c", "g": 0, "i": 2}),
            serde_json::json!({"_key": "d", "g": 1, "i": 3}),
        ]);
        let plan = PlanNode::new(NodeKind::EnumerateCollection {
            collection: "c".into(),
            out: 0,
        })
        .then(NodeKind::Calculation {
            expr: Expr::attribute(0, "g"),
            out: 1,
        })
        .then(NodeKind::Sort {
            criteria: vec![SortCriterion {
                reg: 1,
                ascending: true,
            }],
            stable: true,
        })
        .then(NodeKind::Calculation {
            expr: Expr::attribute(0, "i"),
            out: 2,
        })
        .then(NodeKind::Return { reg: 2 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(
            values,
            vec![
                DocValue::Number(2.0),
                DocValue::Number(0.0),
                DocValue::Number(1.0),
                DocValue::Number(3.0)
            ]
        );
    }

    #[test]
    fn aggregate_groups_sorted_input() {
        let store = DocumentStore::in_memory();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::Number(1.0),
                    DocValue::Number(1.0),
                    DocValue::Number(2.0),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Aggregate {
                groups: vec![(1, 2)],
                into: Some((1, 3)),
            })
            .then(NodeKind::Return { reg: 3 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(
            values,
            vec![
                DocValue::List(vec![DocValue::Number(1.0), DocValue::Number(1.0)]),
                DocValue::List(vec![DocValue::Number(2.0)]),
            ]
        );
    }

    #[test]
    fn aggregate_rejects_recurring_group_key() {
        let store = DocumentStore::in_memory();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::Number(1.0),
                    DocValue::Number(2.0),
                    DocValue::Number(1.0),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Aggregate {
                groups: vec![(1, 2)],
                into: None,
            })
            .then(NodeKind::Return { reg: 2 });
        let err = Query::new(store, &plan).unwrap().execute().unwrap_err();
        assert!(matches!(
            err,
            shapedb_error::ShapeDbError::GroupOrderViolated { row: 2 }
        ));
    }

    #[test]
    fn subquery_per_outer_row() {
        let store = DocumentStore::in_memory();
        let body = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::binary(
                    BinOp::Mul,
                    Expr::Reference(1),
                    Expr::Constant(DocValue::Number(10.0)),
                ),
                out: 2,
            })
            .then(NodeKind::Return { reg: 2 });
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::Number(1.0),
                    DocValue::Number(2.0),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Subquery {
                subplan: Box::new(body),
                out: 3,
            })
            .then(NodeKind::Return { reg: 3 });
        let values = Query::new(store, &plan).unwrap().execute_values().unwrap();
        assert_eq!(
            values,
            vec![
                DocValue::List(vec![DocValue::Number(10.0)]),
                DocValue::List(vec![DocValue::Number(20.0)]),
            ]
        );
    }

    #[test]
    fn insert_plan_writes_documents() {
        let store = DocumentStore::in_memory();
        store
            .create_collection("c", CollectionKind::Document)
            .unwrap();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::from(serde_json::json!({"_key": "a", "x": 1})),
                    DocValue::from(serde_json::json!({"_key": "b", "x": 2})),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Insert {
                collection: "c".into(),
                reg: 1,
                ignore_errors: false,
            });
        let blocks = Query::new(Arc::clone(&store), &plan).unwrap().execute().unwrap();
        assert!(blocks.is_empty());
        let coll = store.collection("c").unwrap();
        assert_eq!(coll.count(), 2);
        assert!(coll.read("a").is_some());
    }

    #[test]
    fn failed_insert_rolls_back_whole_transaction() {
        let store = DocumentStore::in_memory();
        let coll = store
            .create_collection("c", CollectionKind::Document)
            .unwrap();
        store
            .insert_document(
                &coll,
                Some("dup".into()),
                &DocValue::from(serde_json::json!({})),
            )
            .unwrap();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::from(serde_json::json!({"_key": "fresh"})),
                    DocValue::from(serde_json::json!({"_key": "dup"})),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Insert {
                collection: "c".into(),
                reg: 1,
                ignore_errors: false,
            });
        let err = Query::new(Arc::clone(&store), &plan).unwrap().execute();
        assert!(err.is_err());
        // "fresh" rolled back with the transaction.
        assert!(coll.read("fresh").is_none());
        assert_eq!(coll.count(), 1);
    }

    #[test]
    fn ignore_errors_continues_past_failures() {
        let store = DocumentStore::in_memory();
        let coll = store
            .create_collection("c", CollectionKind::Document)
            .unwrap();
        store
            .insert_document(
                &coll,
                Some("dup".into()),
                &DocValue::from(serde_json::json!({})),
            )
            .unwrap();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![
                    DocValue::from(serde_json::json!({"_key": "dup"})),
                    DocValue::from(serde_json::json!({"_key": "fresh"})),
                ])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Insert {
                collection: "c".into(),
                reg: 1,
                ignore_errors: true,
            });
        Query::new(Arc::clone(&store), &plan).unwrap().execute().unwrap();
        assert!(coll.read("fresh").is_some());
        assert_eq!(coll.count(), 2);
    }

    #[test]
    fn remove_plan_by_key_string() {
        let store = two_docs();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![DocValue::String("a".into())])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Remove {
                collection: "c".into(),
                reg: 1,
                ignore_errors: false,
            });
        Query::new(Arc::clone(&store), &plan).unwrap().execute().unwrap();
        let coll = store.collection("c").unwrap();
        assert_eq!(coll.count(), 1);
        assert!(coll.read("a").is_none());
    }

    #[test]
    fn update_merges_attributes() {
        let store = two_docs();
        let plan = PlanNode::new(NodeKind::Singleton)
            .then(NodeKind::Calculation {
                expr: Expr::Constant(DocValue::List(vec![DocValue::from(
                    serde_json::json!({"_key": "a", "y": 9}),
                )])),
                out: 0,
            })
            .then(NodeKind::EnumerateList { list: 0, out: 1 })
            .then(NodeKind::Update {
                collection: "c".into(),
                reg: 1,
                ignore_errors: false,
            });
        Query::new(Arc::clone(&store), &plan).unwrap().execute().unwrap();
        let coll = store.collection("c").unwrap();
        let marker = coll.read("a").unwrap();
        let doc = coll.shaper().unshape(marker.shaped().unwrap()).unwrap();
        assert_eq!(doc.get("x"), Some(&DocValue::Number(1.0)));
        assert_eq!(doc.get("y"), Some(&DocValue::Number(9.0)));
    }

    #[test]
    fn killed_query_aborts_at_block_boundary() {
        let store = two_docs();
        let query = Query::new(store, &filter_plan()).unwrap();
        query.kill_handle().kill();
        let err = query.execute().unwrap_err();
        assert!(matches!(err, shapedb_error::ShapeDbError::QueryKilled));
    }

    #[test]
    fn no_results_short_circuits() {
        let store = DocumentStore::in_memory();
        let plan = PlanNode::new(NodeKind::NoResults);
        let blocks = Query::new(store, &plan).unwrap().execute().unwrap();
        assert!(blocks.is_empty());
    }
}
