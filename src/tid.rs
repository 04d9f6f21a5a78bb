//! Transaction id allocation.
//!
//! Ids are decimal strings drawn from a process-wide monotonic counter that
//! starts at a uniformly-random seed and wraps below `2^53 - 1`, keeping
//! every id representable as an exact integer on the other side of the wire.
//! Uniqueness is exact within a process and probabilistic across processes.

use once_cell::sync::Lazy;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

const MAX_SAFE: u64 = (1 << 53) - 1;

static NEXT: Lazy<AtomicU64> =
    Lazy::new(|| AtomicU64::new(rand::thread_rng().gen_range(0..MAX_SAFE)));

pub fn generate() -> String {
    let id = NEXT.fetch_add(1, Ordering::Relaxed) % MAX_SAFE;
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    // The counter is process-wide; serialize tests that touch it.
    static COUNTER_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn ids_are_decimal_strings_below_the_ceiling() {
        let _lock = COUNTER_MUTEX.lock().unwrap();
        for _ in 0..100 {
            let id = generate();
            let parsed: u64 = id.parse().expect("decimal id");
            assert!(parsed < MAX_SAFE);
        }
    }

    #[test]
    fn ids_are_unique_within_a_run() {
        let _lock = COUNTER_MUTEX.lock().unwrap();
        NEXT.store(0, Ordering::Relaxed);
        let ids: HashSet<String> = (0..1000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn counter_wraps_at_the_ceiling() {
        let _lock = COUNTER_MUTEX.lock().unwrap();
        NEXT.store(MAX_SAFE - 1, Ordering::Relaxed);
        let last = generate();
        let wrapped = generate();
        assert_eq!(last, (MAX_SAFE - 1).to_string());
        assert_eq!(wrapped, "0");
    }
}
