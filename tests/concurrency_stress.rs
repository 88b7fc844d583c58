//! Concurrent open/close/create stress tests

use hivecore::{
    HiveSpec, HiveState, Registry, RegistryConfig, StorageKind, UnloadOutcome, WorkQueue,
};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const MOUNT: &str = "\\registry\\machine\\system";

fn registry(config: RegistryConfig) -> Arc<Registry> {
    let registry = Registry::new(config).unwrap();
    let keys: Vec<String> = (0..16)
        .map(|i| format!("control\\set{}\\services", i))
        .collect();
    registry
        .load_hive(MOUNT, &HiveSpec::new("SYSTEM").with_keys(keys))
        .unwrap();
    registry
}

#[test]
fn test_concurrent_open_close() {
    for delay_close in [0, 4, 512] {
        let registry = registry(
            RegistryConfig::default()
                .with_hash_table_size(8)
                .with_delay_close_size(delay_close),
        );

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut held = Vec::new();
                    for _ in 0..500 {
                        if held.len() < 8 && rng.gen_bool(0.6) {
                            let set = rng.gen_range(0..16);
                            let depth = rng.gen_range(0..3);
                            let path = match depth {
                                0 => format!("{}\\control", MOUNT),
                                1 => format!("{}\\control\\set{}", MOUNT, set),
                                _ => format!("{}\\control\\SET{}\\Services", MOUNT, set),
                            };
                            held.push(registry.open_key(&path).unwrap());
                        } else if !held.is_empty() {
                            let victim = rng.gen_range(0..held.len());
                            held.swap_remove(victim).close();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = registry.stats();
        assert_eq!(stats.open_handles, 0);
        if delay_close == 0 {
            assert_eq!(stats.cached_nodes, 0);
        } else {
            assert!(stats.delayed_close_nodes <= delay_close);
        }
    }
}

#[test]
fn test_concurrent_create_and_delete() {
    let registry = registry(RegistryConfig::default().with_hash_table_size(16));
    let id = registry.mounted(MOUNT).unwrap().id();
    let charged = registry.quota().charged();

    let workers: Vec<_> = (0..6)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let parent = registry
                    .open_key(&format!("{}\\control\\set{}", MOUNT, t))
                    .unwrap();
                for i in 0..50 {
                    let child = registry.create_key(&parent, &format!("tmp{}", i)).unwrap();
                    registry.delete_key(&child).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let hive = registry.hive(id).unwrap();
    assert!(hive.lookup_key("control\\set0\\tmp0").is_none());
    // freed bins stay charged until shrunk or unloaded
    assert!(registry.quota().charged() > charged);
    assert!(hive.storage().space(StorageKind::Stable).free_bin_count() > 0);
    assert_eq!(registry.stats().open_handles, 0);
}

#[test]
fn test_late_unload_on_worker_thread() {
    let registry = registry(RegistryConfig::default().with_hash_table_size(32));
    let id = registry.mounted(MOUNT).unwrap().id();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            registry
                .open_key(&format!("{}\\control\\set{}\\services", MOUNT, i))
                .unwrap()
        })
        .collect();
    let root = registry.open_key(MOUNT).unwrap();
    assert_eq!(
        registry.unload_hive_late(&root).unwrap(),
        UnloadOutcome::Pending
    );
    let hive = registry.hive(id).unwrap();
    drop(root);

    let barrier = Arc::new(Barrier::new(handles.len()));
    let closers: Vec<_> = handles
        .into_iter()
        .map(|handle| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                drop(handle);
            })
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    registry.drain_queue();
    assert_eq!(hive.state(), HiveState::Released);
    assert!(registry.hive(id).is_none());
    assert_eq!(registry.stats().live_unload_tasks, 0);
    assert_eq!(registry.quota().charged(), 0);
}

#[test]
fn test_work_queue_standalone() {
    let queue = WorkQueue::new(4).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..1_000 {
        let counter = Arc::clone(&counter);
        hivecore::TaskQueue::schedule(
            &queue,
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();
    }
    hivecore::TaskQueue::drain(&queue);
    assert_eq!(counter.load(Ordering::Relaxed), 1_000);
}
