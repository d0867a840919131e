use std::env;

mod bench_common;

use bench_common::{init_tracing, key};
use cuckoo_filter::{Error, Filter};

fn main() {
    init_tracing();

    // ------------------------------------------------------------
    // 1) Size a filter for a small number of keys.
    // ------------------------------------------------------------
    let max_keys: usize = env::args()
        .nth(1)
        .map(|arg| arg.parse().expect("max keys must be an integer"))
        .unwrap_or(10_000);
    let mut filter = Filter::with_seed(max_keys, 0xC0FFEE);
    println!(
        "sized for {max_keys} keys: {} buckets, {} slots",
        filter.bucket_count(),
        filter.capacity()
    );

    // ------------------------------------------------------------
    // 2) Keep adding keys past the sizing target until the
    //    eviction walk gives up.
    // ------------------------------------------------------------
    let mut added = 0_u64;
    loop {
        match filter.add(key(added)) {
            Ok(()) => added += 1,
            Err(Error::TooFull) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    println!(
        "too full after {added} keys (load factor {:.4})",
        filter.load_factor()
    );

    // ------------------------------------------------------------
    // 3) The failed add dropped one fingerprint, so at most one
    //    earlier key may now be missing.
    // ------------------------------------------------------------
    let missing = (0..added).filter(|&i| !filter.contains(key(i))).count();
    println!("keys lost to the failed add: {missing}");

    // ------------------------------------------------------------
    // 4) Rebuild at twice the size and re-insert the working set.
    // ------------------------------------------------------------
    let mut rebuilt = Filter::with_seed(max_keys * 2, 0xC0FFEE);
    rebuilt
        .add_all((0..added).map(key))
        .expect("doubled filter should hold the working set");
    println!(
        "rebuilt: {} buckets, load factor {:.4}",
        rebuilt.bucket_count(),
        rebuilt.load_factor()
    );
}
