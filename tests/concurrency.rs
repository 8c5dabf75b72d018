use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use tempfile::tempdir;
use vanta::{Config, Engine, Result, ANY_LABEL};

const WORKERS: u64 = 8;
const TXS_PER_WORKER: u64 = 25;

#[test]
fn concurrent_commits_apply_exactly_once_each() -> Result<()> {
    let dir = tempdir()?;
    // skip per-commit fsync, this test is about ordering not durability
    let engine = Engine::open_with_config(
        dir.path(),
        Config {
            sync_on_commit: false,
            ..Config::default()
        },
    )?;

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            scope.spawn(move || {
                for _ in 0..TXS_PER_WORKER {
                    let mut tx = engine.begin().unwrap();
                    tx.create_node(&[worker as u32], &[]).unwrap();
                    tx.commit().unwrap();
                }
            });
        }
    });

    let total = WORKERS * TXS_PER_WORKER;
    assert_eq!(engine.node_count(ANY_LABEL), total as i64);
    for worker in 0..WORKERS {
        assert_eq!(engine.node_count(worker as u32), TXS_PER_WORKER as i64);
    }
    assert_eq!(engine.last_committed_tx_id(), total);
    // every id closed, none twice
    assert_eq!(engine.last_closed_tx_id(), total);
    assert_eq!(engine.transactions_closed(), total);
    Ok(())
}

#[test]
fn concurrent_counter_deltas_sum_algebraically() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open_with_config(
        dir.path(),
        Config {
            sync_on_commit: false,
            ..Config::default()
        },
    )?;
    let expected = AtomicI64::new(0);

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let engine = &engine;
            let expected = &expected;
            scope.spawn(move || {
                for i in 0..TXS_PER_WORKER {
                    let mut tx = engine.begin().unwrap();
                    let id = tx.create_node(&[1], &[]).unwrap();
                    if (worker + i) % 3 == 0 {
                        // create and delete in one transaction, a net no-op
                        tx.delete_node(id).unwrap();
                    } else {
                        expected.fetch_add(1, Ordering::SeqCst);
                    }
                    tx.commit().unwrap();
                }
            });
        }
    });

    assert_eq!(engine.node_count(1), expected.load(Ordering::SeqCst));
    assert_eq!(engine.node_count(ANY_LABEL), expected.load(Ordering::SeqCst));
    assert_eq!(
        engine.nodes_with_label(1).len() as i64,
        expected.load(Ordering::SeqCst)
    );
    Ok(())
}

#[test]
fn counts_survive_restart_after_concurrent_load() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open_with_config(
            dir.path(),
            Config {
                sync_on_commit: false,
                ..Config::default()
            },
        )?;
        std::thread::scope(|scope| {
            for _ in 0..WORKERS {
                let engine = &engine;
                scope.spawn(move || {
                    for _ in 0..TXS_PER_WORKER {
                        let mut tx = engine.begin().unwrap();
                        tx.create_node(&[2], &[]).unwrap();
                        tx.commit().unwrap();
                    }
                });
            }
        });
        engine.shutdown()?;
    }

    let engine = Engine::open(dir.path())?;
    let total = (WORKERS * TXS_PER_WORKER) as i64;
    assert_eq!(engine.node_count(2), total);
    assert_eq!(engine.nodes_with_label(2).len() as i64, total);
    Ok(())
}

#[test]
fn pooled_objects_cycle_under_concurrent_churn() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open_with_config(
        dir.path(),
        Config {
            sync_on_commit: false,
            pool_capacity: 4,
            local_pool_capacity: 1,
            ..Config::default()
        },
    )?;

    let committed = AtomicI64::new(0);
    std::thread::scope(|scope| {
        for _ in 0..WORKERS {
            let engine = &engine;
            let committed = &committed;
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..TXS_PER_WORKER {
                    let mut tx = engine.begin().unwrap();
                    if rng.gen_bool(0.5) {
                        tx.create_node(&[3], &[]).unwrap();
                        tx.commit().unwrap();
                        committed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        tx.rollback();
                    }
                }
            });
        }
    });

    assert_eq!(engine.node_count(3), committed.load(Ordering::SeqCst));
    assert!(engine.active_transactions().is_empty());
    Ok(())
}
