//! Property-based tests for the comparison engine and id handling
//!
//! These use proptest to verify algebraic invariants hold for arbitrary
//! inputs: flatten idempotence, noise monotonicity, comparator symmetry on
//! passing inputs, natural sort order and HPACK block round-tripping.

use proptest::prelude::*;
use retrace::compare::{compare, flatten_json, left_join_noise};
use retrace::models::{HttpResp, NoiseMap};
use retrace::storage::natural_sort_ids;
use std::collections::BTreeMap;

fn json_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,8}"
}

fn json_scalar() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 _.-]{0,16}"
}

fn flat_object() -> impl Strategy<Value = BTreeMap<String, String>> {
    proptest::collection::btree_map(json_key(), json_scalar(), 0..8)
}

fn resp_with_body(body: String) -> HttpResp {
    HttpResp {
        status_code: 200,
        body,
        ..Default::default()
    }
}

proptest! {
    /// Flattening a map already in flat form is a no-op modulo key order
    #[test]
    fn prop_flatten_idempotent(map in flat_object()) {
        let value = serde_json::to_value(&map).unwrap();
        let once = flatten_json(&value);

        let reassembled: BTreeMap<String, String> = once
            .iter()
            .map(|(k, v)| (k.clone(), v[0].clone()))
            .collect();
        let twice = flatten_json(&serde_json::to_value(&reassembled).unwrap());
        prop_assert_eq!(once, twice);
    }

    /// Adding a noise path can turn a fail into a pass, never the reverse
    #[test]
    fn prop_noise_monotonic(
        expected in flat_object(),
        actual in flat_object(),
        extra_key in json_key(),
    ) {
        let e = resp_with_body(serde_json::to_string(&expected).unwrap());
        let a = resp_with_body(serde_json::to_string(&actual).unwrap());

        let before = compare(&e, &a, &NoiseMap::new(), false);
        let noise = NoiseMap::from([(format!("body.{}", extra_key), Vec::new())]);
        let after = compare(&e, &a, &noise, false);

        prop_assert!(!(before.passed && !after.passed),
            "noise turned a pass into a fail");
    }

    /// If a comparison passes, it also passes with the roles swapped
    #[test]
    fn prop_symmetric_on_pass(
        base in flat_object(),
        mutations in proptest::collection::btree_map(json_key(), json_scalar(), 0..4),
    ) {
        let mut mutated = base.clone();
        let mut noise = NoiseMap::new();
        for (key, value) in &mutations {
            mutated.insert(key.clone(), value.clone());
            noise.insert(format!("body.{}", key), Vec::new());
        }

        let e = resp_with_body(serde_json::to_string(&base).unwrap());
        let a = resp_with_body(serde_json::to_string(&mutated).unwrap());

        let forward = compare(&e, &a, &noise, false);
        prop_assert!(forward.passed);
        let backward = compare(&a, &e, &noise, false);
        prop_assert!(backward.passed);
    }

    /// Identical responses always pass, whatever the noise policy
    #[test]
    fn prop_reflexive(body in flat_object(), noise_key in json_key()) {
        let resp = resp_with_body(serde_json::to_string(&body).unwrap());
        let noise = NoiseMap::from([(format!("body.{}", noise_key), Vec::new())]);
        prop_assert!(compare(&resp, &resp.clone(), &noise, false).passed);
        prop_assert!(compare(&resp, &resp.clone(), &NoiseMap::new(), true).passed);
    }

    /// Natural sort orders ids by numeric suffix, not lexicographically
    #[test]
    fn prop_natural_sort(mut suffixes in proptest::collection::vec(0u64..10_000, 1..20)) {
        suffixes.sort_unstable();
        suffixes.dedup();

        let mut ids: Vec<String> = suffixes.iter().map(|n| format!("test-set-{}", n)).collect();
        ids.reverse();
        natural_sort_ids(&mut ids);

        let sorted: Vec<String> = suffixes.iter().map(|n| format!("test-set-{}", n)).collect();
        prop_assert_eq!(ids, sorted);
    }

    /// Per-set noise always wins over the global entry for the same path
    #[test]
    fn prop_left_join_prefers_right(
        global in flat_object(),
        per_set in flat_object(),
    ) {
        let global: NoiseMap = global
            .into_iter()
            .map(|(k, v)| (k, vec![v]))
            .collect();
        let per_set: NoiseMap = per_set
            .into_iter()
            .map(|(k, v)| (k, vec![v]))
            .collect();

        let merged = left_join_noise(&global, &per_set);
        for (key, value) in &per_set {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for (key, value) in &global {
            if !per_set.contains_key(key) {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
    }
}

mod hpack_props {
    use super::*;
    use retrace::proxy::hpack::{encode_literal_block, HpackDecoder};

    fn header_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,20}"
    }

    fn header_value() -> impl Strategy<Value = String> {
        "[ -~]{0,64}"
    }

    proptest! {
        /// Encoded literal blocks decode back to the same header list
        #[test]
        fn prop_literal_block_round_trip(
            headers in proptest::collection::vec((header_name(), header_value()), 0..12)
        ) {
            let block = encode_literal_block(&headers);
            let mut decoder = HpackDecoder::new();
            let decoded = decoder.decode(&block).unwrap();
            prop_assert_eq!(decoded, headers);
        }
    }
}
