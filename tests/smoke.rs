use vanta::{
    AuxChange, Engine, EngineError, EntityRef, PropertyValue, Result, ANY_LABEL, ANY_REL_TYPE,
};
use tempfile::tempdir;

const PERSON: u32 = 1;
const CITY: u32 = 2;
const KNOWS: u32 = 7;

#[test]
fn create_commit_and_read_back() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let alice = tx.create_node(
        &[PERSON],
        &[("name", PropertyValue::String("Alice".into()))],
    )?;
    let bob = tx.create_node(&[PERSON], &[("name", PropertyValue::String("Bob".into()))])?;
    let knows = tx.create_relationship(alice, KNOWS, bob)?;
    let tx_id = tx.commit()?;
    assert!(tx_id.is_some());

    let node = engine.node(alice).expect("alice exists");
    assert_eq!(
        node.properties.get("name"),
        Some(&PropertyValue::String("Alice".into()))
    );
    assert!(node.has_label(PERSON));
    let rel = engine.relationship(knows).expect("relationship exists");
    assert_eq!(rel.start, alice);
    assert_eq!(rel.end, bob);

    assert_eq!(engine.node_count(ANY_LABEL), 2);
    assert_eq!(engine.node_count(PERSON), 2);
    assert_eq!(engine.relationship_count(ANY_LABEL, ANY_REL_TYPE, ANY_LABEL), 1);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, ANY_LABEL), 1);
    assert_eq!(engine.relationship_count(PERSON, KNOWS, ANY_LABEL), 1);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, PERSON), 1);
    assert_eq!(engine.nodes_with_label(PERSON), vec![alice, bob]);

    engine.shutdown()?;
    Ok(())
}

#[test]
fn rollback_discards_everything() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    tx.create_node(&[PERSON], &[])?;
    tx.rollback();

    assert_eq!(engine.node_count(ANY_LABEL), 0);
    assert_eq!(engine.last_committed_tx_id(), 0);

    // an implicitly dropped handle rolls back too
    {
        let mut tx = engine.begin()?;
        tx.create_node(&[PERSON], &[])?;
    }
    assert_eq!(engine.node_count(ANY_LABEL), 0);
    Ok(())
}

#[test]
fn read_only_commit_skips_the_log() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;
    let tx = engine.begin()?;
    assert_eq!(tx.commit()?, None);
    assert_eq!(engine.last_committed_tx_id(), 0);
    assert_eq!(engine.transactions_closed(), 0);
    Ok(())
}

#[test]
fn delete_node_reverses_counts_and_label_scan() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let id = tx.create_node(&[PERSON, CITY], &[])?;
    tx.commit()?;
    assert_eq!(engine.node_count(PERSON), 1);
    assert_eq!(engine.node_count(CITY), 1);

    let mut tx = engine.begin()?;
    tx.delete_node(id)?;
    tx.commit()?;

    assert!(engine.node(id).is_none());
    assert_eq!(engine.node_count(ANY_LABEL), 0);
    assert_eq!(engine.node_count(PERSON), 0);
    assert_eq!(engine.node_count(CITY), 0);
    assert!(engine.nodes_with_label(PERSON).is_empty());
    Ok(())
}

#[test]
fn label_changes_move_counts_without_touching_totals() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let id = tx.create_node(&[PERSON], &[])?;
    tx.commit()?;

    let mut tx = engine.begin()?;
    tx.remove_label(id, PERSON)?;
    tx.add_label(id, CITY)?;
    tx.commit()?;

    assert_eq!(engine.node_count(ANY_LABEL), 1);
    assert_eq!(engine.node_count(PERSON), 0);
    assert_eq!(engine.node_count(CITY), 1);
    assert_eq!(engine.nodes_with_label(CITY), vec![id]);
    Ok(())
}

#[test]
fn deleting_a_relationship_decrements_every_key() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let a = tx.create_node(&[PERSON], &[])?;
    let b = tx.create_node(&[CITY], &[])?;
    let rel = tx.create_relationship(a, KNOWS, b)?;
    tx.commit()?;

    let mut tx = engine.begin()?;
    tx.delete_relationship(rel)?;
    tx.commit()?;

    assert!(engine.relationship(rel).is_none());
    assert_eq!(engine.relationship_count(ANY_LABEL, ANY_REL_TYPE, ANY_LABEL), 0);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, ANY_LABEL), 0);
    assert_eq!(engine.relationship_count(PERSON, KNOWS, ANY_LABEL), 0);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, CITY), 0);
    Ok(())
}

#[test]
fn relationship_to_missing_node_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;
    let mut tx = engine.begin()?;
    let a = tx.create_node(&[PERSON], &[])?;
    tx.create_relationship(a, KNOWS, 999)?;
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation(_)));
    // nothing from the failed transaction leaked
    assert_eq!(engine.node_count(ANY_LABEL), 0);
    Ok(())
}

#[test]
fn deleting_a_node_with_relationships_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;
    let mut tx = engine.begin()?;
    let a = tx.create_node(&[PERSON], &[])?;
    let b = tx.create_node(&[PERSON], &[])?;
    let rel = tx.create_relationship(a, KNOWS, b)?;
    tx.commit()?;

    let mut tx = engine.begin()?;
    tx.delete_node(a)?;
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation(_)));
    assert!(engine.node(a).is_some());
    assert_eq!(engine.node_count(PERSON), 2);

    // deleting the relationship in the same transaction clears the way
    let mut tx = engine.begin()?;
    tx.delete_relationship(rel)?;
    tx.delete_node(a)?;
    tx.commit()?;
    assert!(engine.node(a).is_none());
    assert_eq!(engine.node_count(PERSON), 1);
    assert_eq!(engine.relationship_count(ANY_LABEL, KNOWS, ANY_LABEL), 0);
    Ok(())
}

#[test]
fn schema_index_serves_lookups() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    tx.create_index(PERSON, "name", false)?;
    tx.commit()?;

    let mut tx = engine.begin()?;
    let alice = tx.create_node(
        &[PERSON],
        &[("name", PropertyValue::String("Alice".into()))],
    )?;
    tx.create_node(&[PERSON], &[("name", PropertyValue::String("Bob".into()))])?;
    tx.commit()?;

    assert_eq!(
        engine.find_nodes_by_property(PERSON, "name", &PropertyValue::String("Alice".into())),
        vec![alice]
    );

    // index created and used within the same transaction
    let mut tx = engine.begin()?;
    tx.create_index(CITY, "zip", false)?;
    let c = tx.create_node(&[CITY], &[("zip", PropertyValue::Int(12))])?;
    tx.commit()?;
    assert_eq!(
        engine.find_nodes_by_property(CITY, "zip", &PropertyValue::Int(12)),
        vec![c]
    );
    Ok(())
}

#[test]
fn unique_index_rejects_duplicates() -> Result<()> {
    let dir = tempdir()?;
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

    let mut tx = engine.begin()?;
    tx.create_node(
        &[PERSON],
        &[("email", PropertyValue::String("a@x".into()))],
    )?;
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, EngineError::ConstraintViolation(_)));
    assert_eq!(engine.node_count(PERSON), 1);

    // releasing the value in the same transaction another node takes it is fine
    let holder = engine.find_nodes_by_property(
        PERSON,
        "email",
        &PropertyValue::String("a@x".into()),
    )[0];
    let mut tx = engine.begin()?;
    tx.remove_node_property(holder, "email")?;
    tx.create_node(
        &[PERSON],
        &[("email", PropertyValue::String("a@x".into()))],
    )?;
    tx.commit()?;
    Ok(())
}

#[test]
fn dropped_index_stops_serving() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let rule = tx.create_index(PERSON, "name", false)?;
    tx.commit()?;
    let mut tx = engine.begin()?;
    tx.create_node(&[PERSON], &[("name", PropertyValue::Int(5))])?;
    tx.commit()?;

    let mut tx = engine.begin()?;
    tx.drop_index(rule)?;
    tx.commit()?;

    // the label-scan fallback still answers
    assert_eq!(
        engine
            .find_nodes_by_property(PERSON, "name", &PropertyValue::Int(5))
            .len(),
        1
    );
    Ok(())
}

#[test]
fn aux_index_changes_flow_through_commit() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    let id = tx.create_node(&[PERSON], &[])?;
    tx.add_to_aux_index(
        "memory",
        EntityRef::Node(id),
        "nickname",
        AuxChange::Add(PropertyValue::String("al".into())),
    )?;
    tx.commit()?;

    assert_eq!(
        engine.aux_lookup("memory", "nickname", &PropertyValue::String("al".into()))?,
        vec![EntityRef::Node(id)]
    );

    // unknown providers are rejected before anything is recorded
    let mut tx = engine.begin()?;
    assert!(tx
        .add_to_aux_index(
            "missing",
            EntityRef::Node(id),
            "k",
            AuxChange::Remove,
        )
        .is_err());
    tx.rollback();
    Ok(())
}

#[test]
fn terminated_transaction_refuses_work_and_commit() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    tx.create_node(&[PERSON], &[])?;
    tx.inner().mark_for_termination();
    assert!(matches!(
        tx.create_node(&[PERSON], &[]),
        Err(EngineError::Terminated)
    ));
    let err = tx.commit().unwrap_err();
    assert!(matches!(err, EngineError::Terminated));
    assert_eq!(engine.node_count(ANY_LABEL), 0);
    Ok(())
}

#[test]
fn shutdown_terminates_open_transactions() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;

    let mut tx = engine.begin()?;
    tx.create_node(&[PERSON], &[])?;
    engine.shutdown()?;

    assert!(tx.commit().is_err());
    assert!(engine.begin().is_err());
    Ok(())
}

#[test]
fn logging_installs_one_subscriber_per_process() {
    // no other test in this binary installs a subscriber
    assert!(vanta::logging::init_logging("warn").is_ok());
    assert!(vanta::logging::init_logging("warn").is_err());
    assert!(vanta::logging::init_logging("not a filter !!").is_err());
}

#[test]
fn second_engine_on_same_directory_is_refused() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(dir.path())?;
    match Engine::open(dir.path()) {
        Err(EngineError::DatabaseUnavailable(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("second open must be refused"),
    }
    drop(engine);
    // the lock dies with the engine
    let _engine = Engine::open(dir.path())?;
    Ok(())
}
