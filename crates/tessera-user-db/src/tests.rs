use futures::StreamExt as _;
use proptest::prelude::*;
use tempfile::{TempDir, tempdir};
use tessera_core::Timestamp;
use tessera_core::event::Event;
use tessera_core::id::{EventId, UserId};
use tessera_core::stream::StreamId;

use crate::query::{
    AndBlock, EventsQuery, Field, Operand, QueryClause, StreamQuery, StreamQueryItem,
    compile_streams_match,
};
use crate::{DbResult, UNIVERSAL_TAG, UserDbPool, UserEventDb};

async fn temp_db() -> DbResult<(TempDir, UserEventDb)> {
    let dir = tempdir().expect("tempdir");
    let db = UserEventDb::open(dir.path().join("events.sqlite")).await?;
    Ok((dir, db))
}

fn build_event(streams: &[&str], time: f64) -> Event {
    Event {
        id: EventId::generate(),
        stream_ids: streams.iter().map(|s| StreamId::from(*s)).collect(),
        event_type: "note/txt".into(),
        content: Some(serde_json::json!("content")),
        time: Timestamp::from_secs(time),
        end_time: None,
        created: Timestamp::from_secs(time),
        created_by: "test".into(),
        modified: Timestamp::from_secs(time),
        modified_by: "test".into(),
        trashed: false,
        deleted: None,
        head_id: None,
        integrity: None,
        attachments: vec![],
        description: None,
        client_data: None,
    }
}

fn streams_clause(query: StreamQuery) -> QueryClause {
    QueryClause::StreamsQuery { query }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn create_and_read_back() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let mut event = build_event(&["diary", "work"], 100.0);
    event.client_data = Some(serde_json::json!({"color": "blue"}));
    db.create_event(&event).await?;

    let found = db.get_event(&event.id).await?.expect("event exists");
    assert_eq!(found, event);

    // stored stream list is space-joined and terminated by the universal tag
    let raw = db.raw_stream_ids(&event.id).await?.unwrap();
    assert_eq!(raw, format!("diary work {UNIVERSAL_TAG}"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn update_requires_existing_row() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let missing = build_event(&["diary"], 1.0);
    let err = db.update_event(&missing).await.unwrap_err();
    assert!(matches!(err, crate::DbError::EventNotFound { .. }));

    let mut event = build_event(&["diary"], 1.0);
    db.create_event(&event).await?;
    event.content = Some(serde_json::json!("edited"));
    event.modified = Timestamp::from_secs(2.0);
    db.update_event(&event).await?;
    assert_eq!(
        db.get_event(&event.id).await?.unwrap().content,
        Some(serde_json::json!("edited"))
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn history_capture_and_minimize() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let mut event = build_event(&["diary"], 1.0);
    db.create_event(&event).await?;

    let original_content = event.content.clone();
    event.content = Some(serde_json::json!("v2"));
    let frozen = db.update_event_with_history(&event).await?;
    assert_eq!(frozen.head_id, Some(event.id.clone()));
    assert_eq!(frozen.content, original_content);

    let history = db.get_history(&event.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, frozen.id);

    // history rows never show up in listings
    let listed = db.get_events(&EventsQuery::default()).await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, event.id);

    db.minimize_history(&event.id).await?;
    let history = db.get_history(&event.id).await?;
    assert_eq!(history[0].content, None);
    assert!(history[0].stream_ids.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn tombstones_leave_listings_and_surface_as_deletions() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let event = build_event(&["diary"], 1.0);
    db.create_event(&event).await?;
    db.tombstone_event(&event.id, Timestamp::from_secs(50.0))
        .await?;

    assert!(db.get_event(&event.id).await?.is_none());
    assert!(db.get_events(&EventsQuery::default()).await?.is_empty());

    let deletions = db.get_deletions_since(Timestamp::from_secs(0.0)).await?;
    assert_eq!(deletions.len(), 1);
    assert_eq!(deletions[0].id, event.id);
    assert!(deletions[0].stream_ids.is_empty());

    // double delete is "not found", not a second tombstone
    let err = db
        .tombstone_event(&event.id, Timestamp::from_secs(60.0))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::DbError::EventNotFound { .. }));

    // TTL purge drops the tombstone row for good
    let purged = db
        .purge_tombstones_before(Timestamp::from_secs(100.0))
        .await?;
    assert_eq!(purged, 1);
    assert!(
        db.get_deletions_since(Timestamp::from_secs(0.0))
            .await?
            .is_empty()
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stream_queries_go_through_fts() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let in_diary = build_event(&["diary"], 1.0);
    let in_both = build_event(&["diary", "work"], 2.0);
    let in_work = build_event(&["work"], 3.0);
    for event in [&in_diary, &in_both, &in_work] {
        db.create_event(event).await?;
    }

    let query = EventsQuery::new(vec![streams_clause(StreamQuery::any_of(["diary"]))]);
    let found = db.get_events(&query).await?;
    assert_eq!(found.len(), 2);

    // `[[{any:["*"]}, {any:["work"]}]]` is equivalent to plain `"work"`
    let with_wildcard = StreamQuery(vec![AndBlock(vec![
        StreamQueryItem::Any(vec!["*".into()]),
        StreamQueryItem::Any(vec!["work".into()]),
    ])]);
    assert_eq!(compile_streams_match(&with_wildcard), "\"work\"");
    let found = db
        .get_events(&EventsQuery::new(vec![streams_clause(with_wildcard)]))
        .await?;
    assert_eq!(found.len(), 2);

    // negation composes within the AND-block
    let not_work = StreamQuery(vec![AndBlock(vec![
        StreamQueryItem::Any(vec!["diary".into()]),
        StreamQueryItem::Not(vec!["work".into()]),
    ])]);
    let found = db
        .get_events(&EventsQuery::new(vec![streams_clause(not_work)]))
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, in_diary.id);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn open_ended_end_time_is_selected_by_greater_or_equal_or_null() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    let mut finished = build_event(&["diary"], 1.0);
    finished.end_time = Some(Timestamp::from_secs(5.0));
    let running = build_event(&["diary"], 2.0);
    db.create_event(&finished).await?;
    db.create_event(&running).await?;

    let query = EventsQuery::new(vec![QueryClause::GreaterOrEqualOrNull {
        field: Field::EndTime,
        value: Operand::Number(10.0),
    }]);
    let found = db.get_events(&query).await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, running.id);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_branches_on_stream_match() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;

    for event in [
        build_event(&["diary"], 1.0),
        build_event(&["work"], 2.0),
        build_event(&["work"], 3.0),
    ] {
        db.create_event(&event).await?;
    }

    // no stream condition: single bulk DELETE
    let removed = db
        .delete_by_query(&[QueryClause::LowerOrEqual {
            field: Field::Time,
            value: Operand::Number(1.0),
        }])
        .await?;
    assert_eq!(removed, 1);

    // stream condition: row-by-row branch
    let removed = db
        .delete_by_query(&[streams_clause(StreamQuery::any_of(["work"]))])
        .await?;
    assert_eq!(removed, 2);
    assert!(db.get_events(&EventsQuery::default()).await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn listing_options_and_count() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;
    for t in 1..=5 {
        db.create_event(&build_event(&["diary"], f64::from(t)))
            .await?;
    }

    let mut query = EventsQuery::default();
    query.limit = Some(2);
    query.skip = Some(1);
    let newest_first = db.get_events(&query).await?;
    assert_eq!(newest_first.len(), 2);
    assert_eq!(newest_first[0].time, Timestamp::from_secs(4.0));

    query.sort_ascending = true;
    let oldest_first = db.get_events(&query).await?;
    assert_eq!(oldest_first[0].time, Timestamp::from_secs(2.0));

    assert_eq!(db.count_events(&[]).await?, 5);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn streaming_reads_are_lazy_and_finite() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;
    for t in 1..=100 {
        db.create_event(&build_event(&["diary"], f64::from(t)))
            .await?;
    }

    let mut stream = db.stream_events(EventsQuery::default()).await?;
    let mut seen = 0;
    while let Some(event) = stream.next().await {
        event?;
        seen += 1;
    }
    assert_eq!(seen, 100);

    // dropping the consumer early stops the producer without error
    let mut stream = db.stream_events(EventsQuery::default()).await?;
    let first = stream.next().await.expect("one item")?;
    assert_eq!(first.time, Timestamp::from_secs(100.0));
    drop(stream);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn vocabulary_lists_known_stream_tokens() -> DbResult<()> {
    let (_dir, db) = temp_db().await?;
    db.create_event(&build_event(&[":_audit:access-one", "diary"], 1.0))
        .await?;
    db.create_event(&build_event(&[":_audit:access-two"], 2.0))
        .await?;

    let terms = db.terms_matching(":_audit:%").await?;
    assert_eq!(terms, vec![":_audit:access-one", ":_audit:access-two"]);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pool_reuses_and_evicts() -> DbResult<()> {
    let dir = tempdir().expect("tempdir");
    let pool = UserDbPool::new(dir.path(), 1).await?;

    let alice = UserId::generate();
    let bob = UserId::generate();

    let db_a = pool.get_or_open(&alice).await?;
    let db_a_again = pool.get_or_open(&alice).await?;
    assert!(std::sync::Arc::ptr_eq(&db_a, &db_a_again));

    // capacity 1: opening bob evicts alice; reopening alice yields a fresh
    // handle over the same file
    let event = build_event(&["diary"], 1.0);
    db_a.create_event(&event).await?;
    let _db_b = pool.get_or_open(&bob).await?;
    let db_a_fresh = pool.get_or_open(&alice).await?;
    assert!(!std::sync::Arc::ptr_eq(&db_a, &db_a_fresh));
    assert!(db_a_fresh.get_event(&event.id).await?.is_some());

    pool.delete_user_db(&alice).await?;
    assert!(!UserEventDb::db_path(dir.path(), &alice).exists());
    Ok(())
}

// --- property: compiled MATCH agrees with the reference evaluator ---------

fn stream_pool() -> Vec<&'static str> {
    vec!["s-a", "s-b", "s-c", ":_system:email", ".active"]
}

fn arb_item() -> impl Strategy<Value = StreamQueryItem> {
    let ids = prop::collection::vec(
        prop_oneof![
            4 => prop::sample::select(stream_pool()).prop_map(str::to_owned),
            1 => Just("*".to_owned()),
        ],
        1..3,
    );
    prop_oneof![
        3 => ids.clone().prop_map(StreamQueryItem::Any),
        1 => prop::collection::vec(
            prop::sample::select(stream_pool()).prop_map(str::to_owned),
            1..3,
        )
        .prop_map(StreamQueryItem::Not),
    ]
}

fn arb_query() -> impl Strategy<Value = StreamQuery> {
    prop::collection::vec(prop::collection::vec(arb_item(), 1..4).prop_map(AndBlock), 1..4)
        .prop_map(StreamQuery)
}

fn arb_event_streams() -> impl Strategy<Value = Vec<&'static str>> {
    prop::sample::subsequence(stream_pool(), 1..stream_pool().len())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fts_match_agrees_with_reference(
        query in arb_query(),
        events in prop::collection::vec(arb_event_streams(), 1..12),
    ) {
        let conn = rusqlite::Connection::open_in_memory().expect("open");
        crate::schema::init(&conn).expect("schema");

        for (i, streams) in events.iter().enumerate() {
            let joined = crate::codec::join_stream_ids(
                &streams.iter().map(|s| StreamId::from(*s)).collect::<Vec<_>>(),
            );
            conn.execute(
                "INSERT INTO events (eventid, streamIds, time, type, created, createdBy, \
                 modified, modifiedBy) VALUES (?1, ?2, ?3, 'note/txt', ?3, 't', ?3, 't')",
                rusqlite::params![format!("ev-{i}"), joined, i as f64],
            )
            .expect("insert");
        }

        let match_expr = compile_streams_match(&query);
        let sql = format!(
            "SELECT eventid FROM events WHERE rowid IN \
             (SELECT rowid FROM events_fts WHERE events_fts MATCH '{}') ORDER BY eventid",
            match_expr.replace('\'', "''"),
        );
        let mut stmt = conn.prepare(&sql).expect("prepare");
        let matched: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");

        let mut expected: Vec<String> = events
            .iter()
            .enumerate()
            .filter(|(_, streams)| query.matches(streams))
            .map(|(i, _)| format!("ev-{i}"))
            .collect();
        expected.sort();

        prop_assert_eq!(matched, expected);
    }
}
