//! Adapter equivalence tests
//!
//! The disk adapter evaluates every query by brute force with
//! [`protos_db::pattern::matches`]. The document and relational adapters
//! translate queries natively; for any data set and pattern they must
//! return the same records.

use proptest::prelude::*;
use protos_db::docstore::MemoryServer;
#[cfg(feature = "relational")]
use protos_db::storage::RelationalStore;
use protos_db::storage::{DiskStore, DocumentStore, StorageAdapter};
use protos_db::{Bundle, Metadata};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

// ============================================================================
// Generators
// ============================================================================

/// Keys mix relational string columns with free-form ones.
fn arb_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("user"),
        Just("host"),
        Just("progress"),
        Just("tags"),
        Just("run"),
    ]
    .prop_map(String::from)
}

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        prop_oneof![Just("a"), Just("b")].prop_map(Value::from),
        (0i64..3).prop_map(Value::from),
        Just(Value::from(1.0)),
        any::<bool>().prop_map(Value::from),
        Just(Value::Null),
    ]
}

fn arb_field() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => arb_scalar(),
        1 => proptest::collection::vec(arb_scalar(), 0..3).prop_map(Value::Array),
        1 => proptest::collection::btree_map(
            prop_oneof![Just("n"), Just("m")].prop_map(String::from),
            arb_scalar(),
            0..3,
        )
        .prop_map(|m| Value::Object(m.into_iter().collect())),
    ]
}

fn arb_fields(max: usize) -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map(arb_key(), arb_field(), 0..max)
        .prop_map(|m| m.into_iter().collect())
}

fn arb_experiment_pattern() -> impl Strategy<Value = Value> {
    prop_oneof![
        4 => arb_fields(3).prop_map(|m| json!({ "metadata": m })),
        1 => Just(json!({})),
        1 => Just(json!([])),
        1 => arb_fields(2).prop_map(Value::Object),
    ]
}

fn arb_bundle_pattern() -> impl Strategy<Value = Value> {
    prop_oneof![
        2 => arb_fields(3).prop_map(|m| json!({ "data": m })),
        1 => prop_oneof![Just("raw"), Just("fit")]
            .prop_map(|t| json!({ "metadata": { "bundle_type": t } })),
        1 => Just(json!({})),
        1 => Just(json!({"files": []})),
    ]
}

// ============================================================================
// Harness
// ============================================================================

struct Adapters {
    _dir: TempDir,
    stores: Vec<Box<dyn StorageAdapter>>,
}

fn adapters() -> Adapters {
    let dir = TempDir::new().unwrap();
    let mut stores: Vec<Box<dyn StorageAdapter>> = vec![
        Box::new(DiskStore::open(dir.path(), "equivalence").unwrap()),
        Box::new(DocumentStore::new(
            MemoryServer::new().connect().unwrap(),
            "equivalence",
        )),
    ];
    #[cfg(feature = "relational")]
    stores.push(Box::new(
        RelationalStore::open(":memory:", "equivalence").unwrap(),
    ));
    Adapters { _dir: dir, stores }
}

/// Experiments carry a `label` so results compare across adapters whose
/// ids differ.
fn load(storage: &mut dyn StorageAdapter, experiments: &[Map<String, Value>]) {
    for (label, fields) in experiments.iter().enumerate() {
        let xid = storage.create_experiment_id("equivalence").unwrap();
        let mut md = Metadata::new();
        md.insert("id".to_string(), json!(xid));
        md.insert("label".to_string(), json!(label));
        md.extend(fields.clone());
        storage.write_experiment_metadata(&md, &xid).unwrap();
    }
}

fn labels(storage: &mut dyn StorageAdapter, pattern: &Value) -> Vec<u64> {
    let mut found: Vec<u64> = storage
        .find_experiments(pattern)
        .unwrap()
        .iter()
        .map(|xid| {
            storage.read_experiment_metadata(xid).unwrap()["label"]
                .as_u64()
                .unwrap()
        })
        .collect();
    found.sort_unstable();
    found
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: every adapter selects the same experiments
    #[test]
    fn prop_find_experiments_agrees(
        experiments in proptest::collection::vec(arb_fields(4), 0..6),
        pattern in arb_experiment_pattern(),
    ) {
        let mut adapters = adapters();
        for store in &mut adapters.stores {
            load(store.as_mut(), &experiments);
        }

        let (reference, rest) = adapters.stores.split_first_mut().unwrap();
        let expected = labels(reference.as_mut(), &pattern);
        for store in rest {
            prop_assert_eq!(
                labels(store.as_mut(), &pattern),
                expected.clone(),
                "adapter {} pattern {}", store.name(), pattern
            );
        }
    }

    /// Property: every adapter selects the same bundles
    #[test]
    fn prop_find_bundles_agrees(
        bundles in proptest::collection::vec(
            (prop_oneof![Just("raw"), Just("fit")], arb_fields(4)),
            0..6,
        ),
        pattern in arb_bundle_pattern(),
    ) {
        let mut adapters = adapters();
        let mut results = Vec::new();
        for store in &mut adapters.stores {
            let storage = store.as_mut();
            let xid = storage.create_experiment_id("bundles").unwrap();
            let mut md = Metadata::new();
            md.insert("id".to_string(), json!(xid));
            storage.write_experiment_metadata(&md, &xid).unwrap();
            for (i, (bundle_type, data)) in bundles.iter().enumerate() {
                let mut bundle = Bundle::with_id(format!("b{i}"), *bundle_type);
                bundle.data_mut().extend(data.clone());
                storage.write_bundle(&bundle, &xid).unwrap();
            }

            let mut ids: Vec<String> = storage
                .find_bundles(&pattern, &xid)
                .unwrap()
                .iter()
                .map(|b| b.id().to_string())
                .collect();
            ids.sort();
            results.push((storage.name(), ids));
        }

        let (_, expected) = &results[0];
        for (name, ids) in &results[1..] {
            prop_assert_eq!(ids, expected, "adapter {} pattern {}", name, pattern);
        }
    }
}
