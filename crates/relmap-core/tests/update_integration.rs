//! Integration tests for saving entity changes.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use relmap_core::proto::{BatchResult, ResultSet, Value};
use relmap_core::{
    BatchOptions, Cancellation, EntityEntry, EntityState, EntityType, Error, Model, Property,
    RelationalDatabase, RelationalOptions, ScalarType, ScriptedConnection, SqlServerDialect,
    SqliteDialect,
};

/// Route compiler and executor logs to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_blog_model() -> Model {
    Model::new().with_entity_type(
        EntityType::new("Post")
            .with_table("Posts")
            .with_key(Property::new("PostId", ScalarType::Int32).identity())
            .with_property(Property::new("Title", ScalarType::String)),
    )
}

fn sql_server() -> RelationalDatabase {
    init_tracing();
    RelationalDatabase::new(Arc::new(create_blog_model()), Arc::new(SqlServerDialect::new()))
}

fn single_value(value: Value) -> ResultSet {
    ResultSet::new([""]).with_row(vec![value]).unwrap()
}

fn post_ids(ids: &[i32]) -> ResultSet {
    let mut set = ResultSet::new(["PostId"]);
    for id in ids {
        set.push_row(vec![Value::Int32(*id)]).unwrap();
    }
    set
}

fn pending_changes() -> Vec<EntityEntry> {
    vec![
        EntityEntry::added("Post").with_value("Title", "first"),
        EntityEntry::added("Post").with_value("Title", "second"),
        EntityEntry::modified("Post")
            .with_value("PostId", 7)
            .with_change("Title", "draft", "final"),
        EntityEntry::deleted("Post").with_value("PostId", 8),
    ]
}

#[test]
fn test_mixed_changes_share_one_round_trip() {
    let db = sql_server();
    let mut entries = pending_changes();
    let connection = ScriptedConnection::new().with_batch_result(
        BatchResult::affected(4)
            .with_result_set(post_ids(&[1, 2]))
            .with_result_set(single_value(Value::Int32(1)))
            .with_result_set(single_value(Value::Int32(1))),
    );

    let saved = db.save_changes(&connection, &mut entries).unwrap();

    assert_eq!(saved, 4);
    let sent = connection.commands();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].text,
        "SET NOCOUNT ON;\n\
         DECLARE @generated0 TABLE ([PostId] int);\n\
         INSERT INTO [Posts] ([Title])\n\
         OUTPUT INSERTED.[PostId]\n\
         INTO @generated0\n\
         VALUES (@p0),\n\
         (@p1);\n\
         SELECT [PostId] FROM @generated0;\n\
         UPDATE [Posts] SET [Title] = @p2\n\
         WHERE [PostId] = @p3;\n\
         SELECT @@ROWCOUNT;\n\
         DELETE FROM [Posts]\n\
         WHERE [PostId] = @p4;\n\
         SELECT @@ROWCOUNT;\n"
    );
    assert_eq!(sent[0].parameter("@p1"), Some(&Value::from("second")));
    assert_eq!(sent[0].parameter("@p2"), Some(&Value::from("final")));
    assert_eq!(sent[0].parameter("@p4"), Some(&Value::Int32(8)));

    assert_eq!(entries[0].current("PostId"), Some(&Value::Int32(1)));
    assert_eq!(entries[1].current("PostId"), Some(&Value::Int32(2)));
    assert_eq!(entries[2].state, EntityState::Unchanged);
    assert_eq!(entries[3].state, EntityState::Detached);
}

#[test]
fn test_stale_delete_reports_concurrency_failure() {
    let db = sql_server();
    let mut entries = vec![EntityEntry::deleted("Post").with_value("PostId", 8)];
    let connection = ScriptedConnection::new()
        .with_batch_result(BatchResult::affected(0).with_result_set(single_value(Value::Int32(0))));

    let err = db.save_changes(&connection, &mut entries).unwrap_err();

    assert!(matches!(err, Error::Concurrency { expected: 1, actual: 0, .. }));
    assert_eq!(entries[0].state, EntityState::Deleted);
}

#[test]
fn test_batches_split_at_max_size() {
    let options = RelationalOptions::default().with_batch(BatchOptions::default().with_max_batch_size(1));
    let db = RelationalDatabase::with_options(
        Arc::new(create_blog_model()),
        Arc::new(SqlServerDialect::new()),
        options,
    );
    let mut entries = vec![
        EntityEntry::added("Post").with_value("Title", "first"),
        EntityEntry::added("Post").with_value("Title", "second"),
    ];
    let connection = ScriptedConnection::new()
        .with_batch_result(BatchResult::affected(1).with_result_set(post_ids(&[3])))
        .with_batch_result(BatchResult::affected(1).with_result_set(post_ids(&[4])));

    db.save_changes(&connection, &mut entries).unwrap();

    let sent = connection.commands();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|c| c.parameters.len() == 1 && c.parameters[0].name == "@p0"));
    assert_eq!(entries[1].current("PostId"), Some(&Value::Int32(4)));
}

#[test]
fn test_unchanged_entries_send_nothing() {
    let db = sql_server();
    let mut entries = vec![
        EntityEntry::new("Post", EntityState::Unchanged).with_value("PostId", 1),
        EntityEntry::modified("Post").with_value("PostId", 2).with_value("Title", "same"),
    ];
    let connection = ScriptedConnection::new();

    let saved = db.save_changes(&connection, &mut entries).unwrap();

    assert_eq!(saved, 0);
    assert!(connection.sql().is_empty());
}

#[tokio::test]
async fn test_async_save_reads_generated_keys() {
    let db = RelationalDatabase::new(Arc::new(create_blog_model()), Arc::new(SqliteDialect::new()));
    let mut entries = vec![EntityEntry::added("Post").with_value("Title", "first")];
    let connection =
        ScriptedConnection::new().with_batch_result(BatchResult::affected(1).with_result_set(post_ids(&[9])));

    let saved = db
        .save_changes_async(&connection, &mut entries, &Cancellation::new())
        .await
        .unwrap();

    assert_eq!(saved, 1);
    assert_eq!(entries[0].current("PostId"), Some(&Value::Int32(9)));
    assert_eq!(entries[0].state, EntityState::Unchanged);
}

#[tokio::test]
async fn test_async_save_honours_cancellation() {
    let db = sql_server();
    let mut entries = pending_changes();
    let connection = ScriptedConnection::new();
    let cancellation = Cancellation::new();
    cancellation.cancel();

    let err = db
        .save_changes_async(&connection, &mut entries, &cancellation)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(connection.commands().is_empty());
}
