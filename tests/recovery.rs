use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use vanta::{
    AuxChange, AuxIndexProvider, Config, Engine, EntityRef, PropertyValue, Result, ANY_LABEL,
    ANY_REL_TYPE,
};

const PERSON: u32 = 1;
const KNOWS: u32 = 7;

#[test]
fn replay_restores_data_and_counts_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let (alice, rel);
    {
        // dropped without shutdown: no checkpoint, everything lives in the log
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        alice = tx.create_node(
            &[PERSON],
            &[("name", PropertyValue::String("Alice".into()))],
        )?;
        let bob = tx.create_node(&[PERSON], &[])?;
        rel = tx.create_relationship(alice, KNOWS, bob)?;
        tx.commit()?;
    }

    let engine = Engine::open(dir.path())?;
    assert!(engine.node(alice).is_some());
    assert!(engine.relationship(rel).is_some());
    assert_eq!(engine.node_count(PERSON), 2);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, ANY_LABEL), 1);
    assert_eq!(engine.nodes_with_label(PERSON).len(), 2);
    assert_eq!(engine.last_committed_tx_id(), 1);

    // replaying again on the next open must not double count
    drop(engine);
    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.node_count(PERSON), 2);
    Ok(())
}

#[test]
fn create_then_delete_recovers_to_nothing() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        let id = tx.create_node(&[PERSON], &[])?;
        tx.commit()?;
        let mut tx = engine.begin()?;
        tx.delete_node(id)?;
        tx.commit()?;
    }

    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.node_count(ANY_LABEL), 0);
    assert_eq!(engine.node_count(PERSON), 0);
    assert!(engine.nodes_with_label(PERSON).is_empty());
    Ok(())
}

#[test]
fn checkpoint_truncates_log_and_restart_uses_snapshot() -> Result<()> {
    let dir = tempdir()?;
    let id;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        id = tx.create_node(&[PERSON], &[("age", PropertyValue::Int(30))])?;
        tx.commit()?;
        engine.checkpoint()?;

        // one more commit after the checkpoint lands in the fresh log
        let mut tx = engine.begin()?;
        tx.set_node_property(id, "age", PropertyValue::Int(31))?;
        tx.commit()?;
    }

    let engine = Engine::open(dir.path())?;
    let node = engine.node(id).expect("node survives restart");
    assert_eq!(node.properties.get("age"), Some(&PropertyValue::Int(31)));
    assert_eq!(engine.node_count(PERSON), 1);
    assert_eq!(engine.last_committed_tx_id(), 2);

    // new ids never collide with recovered ones
    let mut tx = engine.begin()?;
    let fresh = tx.create_node(&[PERSON], &[])?;
    tx.commit()?;
    assert_ne!(fresh, id);
    Ok(())
}

#[test]
fn schema_rules_survive_checkpoint_and_replay() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        tx.create_index(PERSON, "email", true)?;
        tx.commit()?;
        let mut tx = engine.begin()?;
        tx.create_node(
            &[PERSON],
            &[("email", PropertyValue::String("a@x".into()))],
        )?;
        tx.commit()?;
        engine.checkpoint()?;
    }

    let engine = Engine::open(dir.path())?;
    assert_eq!(
        engine
            .find_nodes_by_property(PERSON, "email", &PropertyValue::String("a@x".into()))
            .len(),
        1
    );
    // the uniqueness constraint is still enforced after restart
    let mut tx = engine.begin()?;
    tx.create_node(
        &[PERSON],
        &[("email", PropertyValue::String("a@x".into()))],
    )?;
    assert!(tx.commit().is_err());
    Ok(())
}

#[test]
fn torn_log_tail_is_discarded_with_the_rest_intact() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        tx.create_node(&[PERSON], &[])?;
        tx.commit()?;
        let mut tx = engine.begin()?;
        tx.create_node(&[PERSON], &[])?;
        tx.commit()?;
    }

    // simulate a torn final write
    let wal = dir.path().join("wal");
    let len = std::fs::metadata(&wal)?.len();
    let file = OpenOptions::new().write(true).open(&wal)?;
    file.set_len(len - 4)?;

    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.node_count(PERSON), 1);
    assert_eq!(engine.last_committed_tx_id(), 1);

    // commits continue cleanly past the repaired tail
    let mut tx = engine.begin()?;
    tx.create_node(&[PERSON], &[])?;
    tx.commit()?;
    assert_eq!(engine.node_count(PERSON), 2);
    assert_eq!(engine.last_committed_tx_id(), 2);
    Ok(())
}

#[test]
fn garbage_appended_to_log_is_treated_as_tail_damage() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        tx.create_node(&[PERSON], &[])?;
        tx.commit()?;
    }
    let wal = dir.path().join("wal");
    let mut file = OpenOptions::new().append(true).open(&wal)?;
    file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02])?;
    drop(file);

    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.node_count(PERSON), 1);
    Ok(())
}

#[test]
fn automatic_checkpoints_keep_the_log_short() -> Result<()> {
    let dir = tempdir()?;
    let config = Config {
        checkpoint_interval_txs: Some(2),
        ..Config::default()
    };
    {
        let engine = Engine::open_with_config(dir.path(), config.clone())?;
        for _ in 0..5 {
            let mut tx = engine.begin()?;
            tx.create_node(&[PERSON], &[])?;
            tx.commit()?;
        }
    }
    // 4 of the 5 commits were checkpointed away; the log holds at most one
    let engine = Engine::open_with_config(dir.path(), config)?;
    assert_eq!(engine.node_count(PERSON), 5);
    assert_eq!(engine.last_committed_tx_id(), 5);
    Ok(())
}

#[test]
fn relationship_counts_recover_through_snapshot_plus_log() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let mut tx = engine.begin()?;
        let a = tx.create_node(&[PERSON], &[])?;
        let b = tx.create_node(&[PERSON], &[])?;
        tx.create_relationship(a, KNOWS, b)?;
        tx.commit()?;
        engine.checkpoint()?;
        let mut tx = engine.begin()?;
        tx.create_relationship(b, KNOWS, a)?;
        tx.commit()?;
    }

    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.relationship_count(ANY_LABEL, ANY_REL_TYPE, ANY_LABEL), 2);
    assert_eq!(engine.relationship_count(PERSON, KNOWS, ANY_LABEL), 2);
    Ok(())
}

/// Auxiliary index that parks every apply until released, holding a commit
/// open mid-application.
struct GateIndex {
    open: AtomicBool,
}

impl AuxIndexProvider for GateIndex {
    fn apply(&self, _entity: EntityRef, _key: &str, _change: &AuxChange) -> Result<()> {
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn lookup(&self, _key: &str, _value: &PropertyValue) -> Vec<EntityRef> {
        Vec::new()
    }
}

#[test]
fn checkpoint_drains_in_flight_applies_before_truncating() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::open(dir.path())?;
        let gate = Arc::new(GateIndex {
            open: AtomicBool::new(false),
        });
        engine.register_aux_index_provider("gate", Arc::clone(&gate) as Arc<dyn AuxIndexProvider>);

        std::thread::scope(|scope| -> Result<()> {
            let committer = scope.spawn(|| -> Result<()> {
                let mut tx = engine.begin()?;
                let id = tx.create_node(&[PERSON], &[])?;
                tx.add_to_aux_index(
                    "gate",
                    EntityRef::Node(id),
                    "k",
                    AuxChange::Add(PropertyValue::Int(1)),
                )?;
                tx.commit()?;
                Ok(())
            });

            // wait until the commit is appended but parked mid-apply
            while !(engine.last_committed_tx_id() == 1 && engine.last_closed_tx_id() == 0) {
                std::thread::sleep(Duration::from_millis(1));
            }

            let checkpointer = scope.spawn(|| engine.checkpoint());
            std::thread::sleep(Duration::from_millis(20));
            gate.open.store(true, Ordering::SeqCst);

            committer.join().unwrap()?;
            checkpointer.join().unwrap()
        })?;
    }

    // the log was truncated at the checkpoint, so the snapshot and counter
    // files must carry the commit that was still applying when it started
    let engine = Engine::open(dir.path())?;
    assert_eq!(engine.node_count(PERSON), 1);
    assert_eq!(engine.last_committed_tx_id(), 1);
    Ok(())
}
