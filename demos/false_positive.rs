use std::collections::HashSet;
use std::env;
use std::time::Instant;

mod bench_common;

use bench_common::{generate_seed, init_tracing, key, random_keys, SplitMix64};
use cuckoo_filter::{Filter, FilterConfig};

fn main() {
    init_tracing();

    let mut key_count = 1_000_000_usize;
    let mut query_count = 10_000_000_usize;
    let mut seed: Option<u64> = None;

    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        fn parse<T: std::str::FromStr>(value: Option<String>, name: &str) -> T
        where
            T::Err: std::fmt::Display,
        {
            let value = value.unwrap_or_else(|| panic!("expected value after {name}"));
            value
                .parse::<T>()
                .unwrap_or_else(|err| panic!("invalid value for {name}: {err}"))
        }

        match flag.as_str() {
            "--keys" => key_count = parse(args.next(), "--keys"),
            "--queries" => query_count = parse(args.next(), "--queries"),
            "--seed" => seed = Some(parse(args.next(), "--seed")),
            other => panic!("unknown flag: {other}"),
        }
    }

    let seed = seed.unwrap_or_else(generate_seed);
    let config = FilterConfig {
        seed: Some(seed),
        ..FilterConfig::default()
    };
    println!("seed: {seed}");

    let keys: Vec<[u8; 8]> = (0..key_count as u64).map(key).collect();
    let key_set: HashSet<[u8; 8]> = keys.iter().copied().collect();

    let build_start = Instant::now();
    let mut filter = Filter::with_config(key_count, &config).expect("default config is valid");
    let inserted = filter
        .add_all(&keys)
        .expect("filter sized for the key count should not fill up");
    let build_time = build_start.elapsed();

    let stats = filter.stats();
    println!("inserted {inserted} keys in {build_time:?}");
    println!(
        "buckets: {} | slots: {} | load factor: {:.4}",
        stats.bucket_count, stats.capacity, stats.load_factor
    );
    println!(
        "table bytes: {} (bytes per key: {:.4})",
        stats.fingerprint_bytes,
        stats.fingerprint_bytes as f64 / key_count.max(1) as f64
    );

    let mut generator = SplitMix64::new(seed ^ 0xDEAD_BEEF);
    let probes = random_keys(query_count, &mut generator);

    report("before deletes", &filter, &keys, &key_set, &probes);

    // Remove the first half and make sure the rest are still found.
    let half = keys.len() / 2;
    for k in &keys[..half] {
        assert!(filter.delete(k), "delete of an inserted key should succeed");
    }
    let remaining: HashSet<[u8; 8]> = keys[half..].iter().copied().collect();

    println!();
    report("after deletes", &filter, &keys[half..], &remaining, &probes);
}

fn report(
    label: &str,
    filter: &Filter,
    members: &[[u8; 8]],
    member_set: &HashSet<[u8; 8]>,
    probes: &[[u8; 8]],
) {
    println!("=== {label} ===");

    let false_negatives = filter
        .contains_batch(members)
        .into_iter()
        .filter(|&hit| !hit)
        .count();
    assert!(
        false_negatives == 0,
        "filter missed {false_negatives} inserted keys"
    );

    let query_start = Instant::now();
    let hits = filter.contains_batch(probes);
    let query_time = query_start.elapsed();

    let false_positives = probes
        .iter()
        .zip(hits)
        .filter(|(probe, hit)| *hit && !member_set.contains(*probe))
        .count();
    let fp_rate = if probes.is_empty() {
        0.0
    } else {
        false_positives as f64 / probes.len() as f64
    };
    let qps = probes.len() as f64 / query_time.as_secs_f64().max(f64::EPSILON);

    println!(
        "parallel query time: {query_time:?} ({:.3} Mquery/s)",
        qps / 1_000_000.0
    );
    println!(
        "false positives: {false_positives} / {} ({:.5}%)",
        probes.len(),
        fp_rate * 100.0
    );
}
