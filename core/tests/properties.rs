use std::collections::{BTreeMap, BTreeSet};

use discodb_core::{Clause, DbBuilder, DbConfig, DbReader, Literal, Query, QueryEngine};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

type Model = BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>;

fn random_bytes(rng: &mut StdRng, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(0..=max_len);
    (0..len).map(|_| rng.gen()).collect()
}

/// Random pairs with plenty of repeated keys and values.
fn random_pairs(seed: u64, count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let keys: Vec<Vec<u8>> = (0..(count / 3).max(1))
        .map(|_| random_bytes(&mut rng, 12))
        .collect();
    let values: Vec<Vec<u8>> = (0..(count / 2).max(1))
        .map(|_| random_bytes(&mut rng, 20))
        .collect();
    (0..count)
        .map(|_| {
            let key = keys[rng.gen_range(0..keys.len())].clone();
            let value = values[rng.gen_range(0..values.len())].clone();
            (key, value)
        })
        .collect()
}

fn model(pairs: &[(Vec<u8>, Vec<u8>)]) -> Model {
    let mut model = Model::new();
    for (k, v) in pairs {
        model.entry(k.clone()).or_default().insert(v.clone());
    }
    model
}

fn build(pairs: &[(Vec<u8>, Vec<u8>)], config: DbConfig) -> Vec<u8> {
    let mut builder: DbBuilder = config.build();
    for (k, v) in pairs {
        builder.add(k, v);
    }
    builder.finalize().unwrap()
}

#[test]
fn test_lookup_matches_model() {
    for seed in 0..20_u64 {
        let pairs = random_pairs(seed, 50 + seed as usize * 40);
        let expected = model(&pairs);
        for config in [DbConfig::new(), DbConfig::new().dedup_values()] {
            let artifact = build(&pairs, config);
            let reader: DbReader<&[u8]> = DbReader::open(artifact.as_slice()).unwrap();
            assert_eq!(reader.size(), expected.len() as u64);
            for (key, values) in &expected {
                let got: Vec<&[u8]> = reader.lookup(key).unwrap().unwrap().collect();
                let want: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
                assert_eq!(got, want, "seed {}", seed);
            }
            let keys: Vec<&[u8]> = reader.keys().collect();
            let want: Vec<&[u8]> = expected.keys().map(|k| k.as_slice()).collect();
            assert_eq!(keys, want);
        }
    }
}

#[test]
fn test_foreign_keys_not_found() {
    let mut rng = StdRng::seed_from_u64(99);
    for seed in 0..10_u64 {
        let pairs = random_pairs(seed, 300);
        let expected = model(&pairs);
        let artifact = build(&pairs, DbConfig::new());
        let reader: DbReader<&[u8]> = DbReader::open(artifact.as_slice()).unwrap();
        for _ in 0..2_000 {
            let key = random_bytes(&mut rng, 14);
            if !expected.contains_key(&key) {
                assert!(reader.lookup(&key).unwrap().is_none());
            }
        }
        // Near misses of real keys.
        for key in expected.keys() {
            let mut longer = key.clone();
            longer.push(0);
            assert!(!reader.contains(&longer).unwrap() || expected.contains_key(&longer));
        }
    }
}

#[test]
fn test_insert_order_and_repeats() {
    for seed in 0..10_u64 {
        let pairs = random_pairs(seed, 400);
        let once = build(&pairs, DbConfig::new());
        let mut rng = StdRng::seed_from_u64(seed + 1_000);
        let mut shuffled = pairs.clone();
        shuffled.extend(pairs.iter().take(100).cloned());
        shuffled.shuffle(&mut rng);
        assert_eq!(build(&shuffled, DbConfig::new()), once);
    }
}

/// Query semantics over the model: each clause is the union of its keys minus its negated keys,
/// clauses with a positive key intersect, purely negated clauses then subtract.
fn expected_query(model: &Model, clauses: &[Clause]) -> BTreeSet<Vec<u8>> {
    let values = |literal: &Literal| model.get(literal.key()).cloned().unwrap_or_default();
    let mut running: Option<BTreeSet<Vec<u8>>> = None;
    let mut subtract = BTreeSet::new();
    for clause in clauses {
        let mut positive = BTreeSet::new();
        let mut negative = BTreeSet::new();
        for literal in clause.literals() {
            if literal.is_negated() {
                negative.extend(values(literal));
            } else {
                positive.extend(values(literal));
            }
        }
        if clause.is_negative() {
            subtract.extend(negative);
            continue;
        }
        let set: BTreeSet<Vec<u8>> = positive.difference(&negative).cloned().collect();
        running = Some(match running {
            Some(running) => running.intersection(&set).cloned().collect(),
            None => set,
        });
    }
    running
        .map(|running| running.difference(&subtract).cloned().collect())
        .unwrap_or_default()
}

fn random_query(rng: &mut StdRng, keys: &[Vec<u8>]) -> Vec<Clause> {
    (0..rng.gen_range(1..5))
        .map(|_| {
            let literals = (0..rng.gen_range(1..4))
                .map(|_| {
                    let key = keys[rng.gen_range(0..keys.len())].clone();
                    if rng.gen_bool(0.3) {
                        Literal::not(key)
                    } else {
                        Literal::new(key)
                    }
                })
                .collect();
            Clause::new(literals)
        })
        .collect()
}

#[test]
fn test_query_matches_model() {
    let mut rng = StdRng::seed_from_u64(11);
    for seed in 0..5_u64 {
        // One byte values so keys share values and intersections are rarely empty.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = random_pairs(seed, 400)
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().take(1).collect()))
            .collect();
        let expected = model(&pairs);
        let keys: Vec<Vec<u8>> = expected.keys().cloned().collect();
        let plain = build(&pairs, DbConfig::new());
        let dedup = build(&pairs, DbConfig::new().dedup_values());
        let plain: DbReader<&[u8]> = DbReader::open(plain.as_slice()).unwrap();
        let dedup: DbReader<&[u8]> = DbReader::open(dedup.as_slice()).unwrap();
        for _ in 0..100 {
            let clauses = random_query(&mut rng, &keys);
            let want: Vec<Vec<u8>> = expected_query(&expected, &clauses).into_iter().collect();
            let query = Query::new(clauses);
            for reader in [&plain, &dedup] {
                let result = QueryEngine::new(reader).evaluate(&query).unwrap();
                assert!(result.is_complete());
                assert_eq!(result.to_vecs(), want, "query {}", query);
            }
        }
    }
}

#[test]
fn test_query_clause_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let pairs = random_pairs(3, 600);
    let expected = model(&pairs);
    let artifact = build(&pairs, DbConfig::new());
    let reader: DbReader<&[u8]> = DbReader::open(artifact.as_slice()).unwrap();
    let keys: Vec<Vec<u8>> = expected.keys().cloned().collect();
    for _ in 0..50 {
        let clauses = random_query(&mut rng, &keys);
        let engine = QueryEngine::new(&reader);
        let first = engine.evaluate(&Query::new(clauses.clone())).unwrap();
        let mut shuffled = clauses.clone();
        shuffled.shuffle(&mut rng);
        let second = engine.evaluate(&Query::new(shuffled)).unwrap();
        assert_eq!(first.values(), second.values());
        assert_eq!(first.to_vecs(), Vec::from_iter(expected_query(&expected, &clauses)));
    }
}
