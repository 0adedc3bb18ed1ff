use notesync_core::model::change_record::{ChangeRecord, ColumnKey};
use notesync_core::sync::column_merge::ApplyOutcome;
use notesync_core::{
    ColumnType, ColumnValue, ColumnVersionMerger, LocalStore, SchemaRegistry, SiteId, SyncRules,
    TableSchema,
};

fn registry(rules: SyncRules) -> SchemaRegistry {
    let mut registry = SchemaRegistry::new(rules);
    registry
        .register(
            TableSchema::new("tasks")
                .column("title", ColumnType::Text)
                .column("priority", ColumnType::Integer),
        )
        .unwrap();
    registry
        .register(
            TableSchema::new("ui_state")
                .column("scroll", ColumnType::Integer)
                .local_only(),
        )
        .unwrap();
    registry
        .register(TableSchema::new("audit").column("line", ColumnType::Text))
        .unwrap();
    registry
}

fn merger(site: &str) -> ColumnVersionMerger {
    let rules = SyncRules {
        include_tables: Vec::new(),
        exclude_tables: vec!["audit".to_string()],
    };
    ColumnVersionMerger::new(SiteId::new(site).unwrap(), registry(rules))
}

fn text(value: &str) -> ColumnValue {
    ColumnValue::Text(value.to_string())
}

fn title(value: &str) -> Vec<(String, ColumnValue)> {
    vec![("title".to_string(), text(value))]
}

fn record(site: &str, db_version: u64, causal_length: u64, value: &str) -> ChangeRecord {
    ChangeRecord {
        table: "tasks".to_string(),
        primary_key: "1".to_string(),
        column: "title".to_string(),
        value: text(value),
        column_version: 1,
        db_version,
        site_id: SiteId::new(site).unwrap(),
        causal_length,
        sequence: 0,
    }
}

fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut result = Vec::new();
    for index in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(index);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            result.push(tail);
        }
    }
    result
}

#[test]
fn concurrent_writes_at_same_db_version_resolve_by_site_id() {
    let mut s1 = merger("s1");
    let mut s2 = merger("s2");

    let from_s1 = s1.write_local("tasks", "1", title("from s1")).unwrap();
    let from_s2 = s2.write_local("tasks", "1", title("from s2")).unwrap();
    assert!(from_s1.iter().all(|record| record.db_version == 1));
    assert!(from_s2.iter().all(|record| record.db_version == 1));

    s1.apply_batch(s2.changes_since(0));
    s2.apply_batch(from_s1);

    assert_eq!(s1.value("tasks", "1", "title"), Some(&text("from s2")));
    assert_eq!(s2.value("tasks", "1", "title"), Some(&text("from s2")));
    assert_eq!(s1.changes_since(0), s2.changes_since(0));
}

#[test]
fn any_delivery_order_converges_and_replay_changes_nothing() {
    let records = vec![
        record("s1", 1, 1, "a"),
        record("s2", 1, 1, "b"),
        record("s1", 3, 1, "c"),
        record("s3", 2, 1, "d"),
        record("s2", 2, 1, "e"),
    ];

    for order in permutations(&records) {
        let mut merger = merger("observer");
        merger.apply_batch(order.clone());
        assert_eq!(merger.value("tasks", "1", "title"), Some(&text("c")));

        let replay = merger.apply_batch(order);
        assert_eq!(replay.applied, 0);
        assert_eq!(replay.duplicate, 1);
        assert_eq!(replay.superseded, 4);
        assert_eq!(merger.value("tasks", "1", "title"), Some(&text("c")));
    }
}

#[test]
fn greater_causal_length_wins_over_greater_db_version() {
    let mut merger = merger("observer");
    merger.apply(record("s1", 9, 1, "late update"));
    assert_eq!(
        merger.apply(record("s2", 2, 3, "resurrected")),
        ApplyOutcome::Applied
    );
    assert_eq!(
        merger.apply(record("s3", 50, 1, "stale")),
        ApplyOutcome::Superseded
    );
    assert_eq!(merger.value("tasks", "1", "title"), Some(&text("resurrected")));
}

#[test]
fn concurrent_delete_and_update_converge() {
    let mut s1 = merger("s1");
    let mut s2 = merger("s2");
    let created = s1.write_local("tasks", "1", title("shared")).unwrap();
    s2.apply_batch(created);

    let tombstone = s1.delete_row("tasks", "1").unwrap();
    let update = s2.write_local("tasks", "1", title("edited")).unwrap();

    s1.apply_batch(update);
    s2.apply(tombstone);

    assert!(!s1.is_row_live("tasks", "1"));
    assert!(!s2.is_row_live("tasks", "1"));
    assert_eq!(s1.value("tasks", "1", "title"), None);
    assert_eq!(s1.changes_since(0), s2.changes_since(0));
}

#[test]
fn local_only_and_excluded_tables_never_emit_or_accept() {
    let mut merger = merger("s1");
    let local = merger
        .write_local(
            "ui_state",
            "main",
            vec![("scroll".to_string(), ColumnValue::Integer(10))],
        )
        .unwrap();
    assert!(local.is_empty());
    let excluded = merger
        .write_local("audit", "1", vec![("line".to_string(), text("x"))])
        .unwrap();
    assert!(excluded.is_empty());

    let mut foreign = record("s2", 1, 1, "x");
    foreign.table = "ui_state".to_string();
    foreign.column = "scroll".to_string();
    foreign.value = ColumnValue::Integer(3);
    assert_eq!(merger.apply(foreign), ApplyOutcome::Ignored);
    assert!(merger.changes_since(0).is_empty());
    assert_eq!(merger.db_version(), 0);
}

#[test]
fn local_db_version_follows_observed_versions() {
    let mut merger = merger("s1");
    merger.apply(record("s2", 41, 1, "remote"));
    let written = merger.write_local("tasks", "2", title("mine")).unwrap();
    assert!(written.iter().all(|record| record.db_version == 42));
    assert_eq!(merger.db_version(), 42);
    assert_eq!(merger.changes_since(41).len(), written.len());
}

#[test]
fn winners_survive_persist_and_restore() {
    let store = LocalStore::open_in_memory(SiteId::new("s1").unwrap()).unwrap();
    let mut merger = merger("s1");
    merger.write_local("tasks", "1", title("kept")).unwrap();
    merger
        .write_local(
            "tasks",
            "1",
            vec![("priority".to_string(), ColumnValue::Integer(2))],
        )
        .unwrap();

    assert_eq!(merger.persist(&store).unwrap(), 3);
    assert_eq!(merger.persist(&store).unwrap(), 0);

    let rules = SyncRules {
        include_tables: Vec::new(),
        exclude_tables: vec!["audit".to_string()],
    };
    let restored = ColumnVersionMerger::load(&store, registry(rules)).unwrap();
    assert_eq!(restored.db_version(), 2);
    assert_eq!(restored.value("tasks", "1", "title"), Some(&text("kept")));
    assert_eq!(
        restored.value("tasks", "1", "priority"),
        Some(&ColumnValue::Integer(2))
    );
    let key = ColumnKey {
        table: "tasks".to_string(),
        primary_key: "1".to_string(),
        column: "title".to_string(),
    };
    assert_eq!(restored.winner(&key).unwrap().column_version, 1);
    assert_eq!(restored.changes_since(0), merger.changes_since(0));
}
