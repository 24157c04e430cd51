use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tether_core::{ManualClock, SharedClock};
use tether_storage::{CacheConfig, InvalidationEvent, VersionedCache};

#[derive(Debug, Clone)]
enum Op {
    Set(u8),
    Get(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16).prop_map(Op::Set),
        (0u8..16).prop_map(Op::Get),
    ]
}

fn key(k: u8) -> String {
    format!("item:{}", k)
}

fn cache(max_size: usize) -> (Arc<ManualClock>, VersionedCache) {
    let clock = ManualClock::starting_now();
    let shared: SharedClock = clock.clone();
    let config = CacheConfig::default().with_max_size(max_size);
    (clock, VersionedCache::new(config, shared))
}

proptest! {
    #[test]
    fn lru_bound_and_eviction_order(max_size in 1usize..8, ops in prop::collection::vec(arb_op(), 1..64)) {
        let (_, cache) = cache(max_size);
        let mut model: VecDeque<String> = VecDeque::new();

        for op in ops {
            match op {
                Op::Set(k) => {
                    let key = key(k);
                    cache.set(&key, &k, None, None).unwrap();
                    if let Some(pos) = model.iter().position(|existing| *existing == key) {
                        model.remove(pos);
                    } else if model.len() >= max_size {
                        model.pop_front();
                    }
                    model.push_back(key);
                }
                Op::Get(k) => {
                    let key = key(k);
                    let hit = cache.get::<u8>(&key, None);
                    match model.iter().position(|existing| *existing == key) {
                        Some(pos) => {
                            prop_assert_eq!(hit, Some(k));
                            model.remove(pos);
                            model.push_back(key);
                        }
                        None => prop_assert_eq!(hit, None),
                    }
                }
            }
            prop_assert!(cache.len() <= max_size);
            prop_assert_eq!(cache.lru_order(), model.iter().cloned().collect::<Vec<_>>());
        }
    }

    #[test]
    fn ttl_decides_hit_or_purge(ttl_ms in 0u64..10_000, elapsed_ms in 0u64..20_000) {
        let (clock, cache) = cache(16);
        cache.set("k", &"v", Some(Duration::from_millis(ttl_ms)), None).unwrap();
        clock.advance(Duration::from_millis(elapsed_ms));

        let hit = cache.get::<String>("k", None);
        if elapsed_ms > ttl_ms {
            prop_assert!(hit.is_none());
            prop_assert!(cache.entry("k").is_none());
        } else {
            prop_assert_eq!(hit.as_deref(), Some("v"));
        }
    }

    #[test]
    fn version_mismatch_always_purges(stored in "[a-c]", requested in "[a-c]") {
        let (_, cache) = cache(16);
        cache.set("k", &1, None, Some(stored.as_str())).unwrap();
        let hit = cache.get::<i32>("k", Some(requested.as_str()));
        if stored == requested {
            prop_assert_eq!(hit, Some(1));
        } else {
            prop_assert_eq!(hit, None);
            prop_assert!(cache.is_empty());
        }
    }
}

#[test]
fn inserting_past_capacity_keeps_max_size() {
    let (_, cache) = cache(100);
    for i in 0..101 {
        cache.set(&format!("k{}", i), &i, None, None).unwrap();
    }
    assert_eq!(cache.len(), 100);
    assert!(cache.entry("k0").is_none());
    assert!(cache.entry("k100").is_some());
}

#[test]
fn invalidation_scope_leaves_unrelated_keys() {
    let (_, cache) = cache(100);
    for key in [
        "profile:42",
        "user:42",
        "sessions:42",
        "providers:github",
        "linked-providers:42",
        "courses:1",
    ] {
        cache.set(key, &key, None, None).unwrap();
    }

    cache.invalidate(InvalidationEvent::ProfileUpdate);
    assert!(cache.has("sessions:42", None));
    assert!(!cache.has("profile:42", None));
    assert!(!cache.has("user:42", None));

    cache.invalidate(InvalidationEvent::ProviderUnlink);
    assert_eq!(cache.keys(), vec!["courses:1", "sessions:42"]);

    cache.invalidate(InvalidationEvent::SessionChange);
    assert_eq!(cache.keys(), vec!["courses:1"]);

    cache.invalidate(InvalidationEvent::Login);
    assert!(cache.is_empty());
}
