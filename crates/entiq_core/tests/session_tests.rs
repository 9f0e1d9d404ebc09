//! Session behaviour against the scripted transport.

use entiq_core::{
    Entity, EntityAction, EntityKey, EntityQuery, EntityState, EntityType, MappingError,
    MergeStrategy, Predicate, ResultShape, SavePolicy, SaveResult, ServiceEndpoint, Session,
    SessionConfig, SessionError,
};
use entiq_transport::{DeferredReply, Method, MockTransport, RawResponse, TransportError};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn session_with(config: SessionConfig, mock: &Arc<MockTransport>) -> Session {
    let session = Session::new(config, mock.clone());
    session
        .registry()
        .register(EntityType::new("Todo").identity().with_resource("Todos"));
    session
}

fn session(mock: &Arc<MockTransport>) -> Session {
    session_with(SessionConfig::default(), mock)
}

fn todo_json(id: i64, title: &str) -> Value {
    json!({"$type": "Demo.Models.Todo, Demo", "Id": id, "Title": title, "IsDone": false})
}

fn snapshot(session: &Session) -> Vec<(EntityState, Map<String, Value>)> {
    session
        .entities(None, &[])
        .iter()
        .map(|e| (e.state(), e.values()))
        .collect()
}

async fn load_todos(session: &Session, mock: &MockTransport, ids: &[i64]) -> Vec<Entity> {
    let body: Vec<Value> = ids.iter().map(|id| todo_json(*id, "todo")).collect();
    mock.push_json(200, &Value::Array(body));
    session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap()
        .entities()
}

// ----------------------------------------------------------------------
// Queries
// ----------------------------------------------------------------------

#[tokio::test]
async fn anonymous_array_yields_untyped_results() {
    let mock = Arc::new(MockTransport::new());
    let session = Session::new(SessionConfig::default(), mock.clone());
    mock.push_json(
        200,
        &json!([{"Title": "a"}, {"Title": "b"}, {"Title": "c"}]),
    );

    let result = session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    assert!(result.results.iter().all(|r| !r.is_entity()));
    assert_eq!(session.tracked_count(), 0);
}

#[tokio::test]
async fn typed_results_are_tracked_as_unchanged() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);

    let todos = load_todos(&session, &mock, &[1, 2]).await;

    assert_eq!(todos.len(), 2);
    assert!(todos.iter().all(|t| t.state() == EntityState::Unchanged));
    assert_eq!(todos[0].key(), Some(EntityKey::single("Todo", 1)));
    assert_eq!(todos[0].get("Title"), Some(json!("todo")));
    assert!(todos[0].get("$type").is_none());
}

#[tokio::test]
async fn query_request_carries_rendered_options() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    mock.push_json(200, &json!([]));

    let query = EntityQuery::from("Todos")
        .with_filter(Predicate::property("IsDone").eq(false))
        .order_by("Title")
        .take(2);
    session.execute_query(&query).await.unwrap();

    let request = &mock.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(
        request.url,
        "api/Todos?%24filter=IsDone+eq+false&%24orderby=Title&%24top=2"
    );
    assert_eq!(request.resource_name(), "Todos");
}

#[tokio::test]
async fn identity_is_preserved_across_queries() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);

    let first = load_todos(&session, &mock, &[1, 2]).await;
    mock.push_json(200, &json!([todo_json(2, "renamed"), todo_json(1, "todo")]));
    let second = session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap()
        .entities();

    assert!(Entity::ptr_eq(&first[0], &second[1]));
    assert!(Entity::ptr_eq(&first[1], &second[0]));
    assert_eq!(first[1].get("Title"), Some(json!("renamed")));
    assert_eq!(session.tracked_count(), 2);
}

#[tokio::test]
async fn duplicate_records_in_one_response_share_an_instance() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);

    let todos = load_todos(&session, &mock, &[5, 5]).await;
    assert!(Entity::ptr_eq(&todos[0], &todos[1]));
    assert_eq!(session.tracked_count(), 1);
}

#[tokio::test]
async fn overwrite_changes_is_the_default_merge() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    todo.set("Title", "local").unwrap();

    mock.push_json(200, &json!([todo_json(1, "server")]));
    session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap();

    assert_eq!(todo.get("Title"), Some(json!("server")));
    assert_eq!(todo.state(), EntityState::Unchanged);
    assert!(todo.original_values().is_empty());
}

#[tokio::test]
async fn preserve_changes_keeps_pending_edits() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todos = load_todos(&session, &mock, &[1, 2]).await;
    todos[0].set("Title", "local").unwrap();

    mock.push_json(200, &json!([todo_json(1, "server"), todo_json(2, "server")]));
    session
        .execute_query(
            &EntityQuery::from("Todos").with_merge_strategy(MergeStrategy::PreserveChanges),
        )
        .await
        .unwrap();

    assert_eq!(todos[0].get("Title"), Some(json!("local")));
    assert_eq!(todos[0].state(), EntityState::Modified);
    assert_eq!(todos[1].get("Title"), Some(json!("server")));
}

#[tokio::test]
async fn inline_count_is_reported() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    mock.push_json(
        200,
        &json!({"Results": [todo_json(1, "a")], "InlineCount": 12}),
    );

    let result = session
        .execute_query(&EntityQuery::from("Todos").take(1).with_inline_count())
        .await
        .unwrap();

    assert_eq!(result.inline_count, Some(12));
    assert_eq!(result.entities().len(), 1);
    assert!(mock.requests()[0].url.contains("%24inlinecount=allpages"));
}

#[tokio::test]
async fn single_entity_shape_rejects_arrays() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    let before = snapshot(&session);

    mock.push_json(200, &json!([todo_json(1, "changed"), todo_json(2, "new")]));
    let err = session
        .execute_query(&EntityQuery::from("Todos").expecting(ResultShape::SingleEntity))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Mapping(MappingError::ShapeMismatch { .. })
    ));
    assert_eq!(snapshot(&session), before);
    assert_eq!(todo.get("Title"), Some(json!("todo")));
}

#[tokio::test]
async fn failed_record_aborts_the_whole_merge() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    mock.push_json(200, &json!([todo_json(1, "a"), {"$type": "Todo", "Title": "no key"}]));

    let err = session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Mapping(MappingError::MissingKey { .. })
    ));
    assert_eq!(session.tracked_count(), 0);
}

#[tokio::test]
async fn unknown_types_need_registration_when_metadata_is_expected() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    mock.push_json(200, &json!([{"$type": "Ns.Order, Ns", "Id": 1}]));

    let err = session
        .execute_query(&EntityQuery::from("Orders"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Mapping(MappingError::UnknownEntityType(ref name)) if name == "Order"
    ));
}

#[tokio::test]
async fn types_are_inferred_without_server_metadata() {
    let mock = Arc::new(MockTransport::new());
    let config =
        SessionConfig::new(ServiceEndpoint::new("svc/").with_server_metadata(false));
    let session = Session::new(config, mock.clone());
    mock.push_json(200, &json!([{"$type": "Ns.Order, Ns", "OrderId": 3, "Total": 9.5}]));

    let result = session
        .execute_query(&EntityQuery::from("Orders"))
        .await
        .unwrap();

    let order = &result.entities()[0];
    assert_eq!(order.key(), Some(EntityKey::single("Order", 3)));
    assert_eq!(
        session.registry().get("Order").unwrap().key_properties(),
        &["OrderId".to_string()]
    );
}

#[tokio::test]
async fn exhausted_double_rejects_extra_calls() {
    let mock = Arc::new(MockTransport::with_replies([RawResponse::ok_json(&json!([]))]));
    let session = session(&mock);

    session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap();
    let err = session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Exhausted { calls: 2 })
    ));
}

#[tokio::test]
async fn local_queries_filter_order_and_page() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    mock.push_json(
        200,
        &json!([
            {"$type": "Todo", "Id": 1, "Title": "b", "Priority": 2},
            {"$type": "Todo", "Id": 2, "Title": "a", "Priority": 3},
            {"$type": "Todo", "Id": 3, "Title": "c", "Priority": 1},
            {"$type": "Todo", "Id": 4, "Title": "d", "Priority": 5}
        ]),
    );
    let todos = session
        .execute_query(&EntityQuery::from("Todos"))
        .await
        .unwrap()
        .entities();
    session.mark_for_delete(&todos[3]).unwrap();

    let query = EntityQuery::from("Todos")
        .with_filter(Predicate::property("Priority").ge(2))
        .order_by("Title");
    let titles: Vec<Value> = session
        .execute_query_locally(&query)
        .unwrap()
        .iter()
        .filter_map(|t| t.get("Title"))
        .collect();
    assert_eq!(titles, vec![json!("a"), json!("b")]);

    let paged = session
        .execute_query_locally(&EntityQuery::from("Todos").order_by_desc("Priority").skip(1).take(1))
        .unwrap();
    assert_eq!(paged, vec![todos[0].clone()]);

    assert!(session
        .execute_query_locally(&EntityQuery::from("Unknown"))
        .is_err());
    assert_eq!(mock.call_count(), 1);
}

// ----------------------------------------------------------------------
// Saves
// ----------------------------------------------------------------------

#[tokio::test]
async fn added_entity_receives_server_key() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = session
        .create_entity("Todo", json!({"Title": "write tests"}))
        .unwrap();
    assert_eq!(todo.key(), Some(EntityKey::single("Todo", -1)));

    mock.push_json(
        200,
        &json!({
            "Entities": [{"$type": "Demo.Models.Todo, Demo", "Id": 42, "Title": "write tests", "Created": "2026-01-01"}],
            "KeyMappings": [{"EntityTypeName": "Demo.Models.Todo, Demo", "TempValue": -1, "RealValue": 42}]
        }),
    );
    let result = session.save_changes(None).await.unwrap();

    assert_eq!(todo.state(), EntityState::Unchanged);
    assert_eq!(todo.get("Id"), Some(json!(42)));
    assert_eq!(todo.key(), Some(EntityKey::single("Todo", 42)));
    assert_eq!(todo.get("Created"), Some(json!("2026-01-01")));
    assert_eq!(result.entities, vec![todo.clone()]);
    assert_eq!(result.key_mappings.len(), 1);
    assert!(session
        .find_entity_by_key(&EntityKey::single("Todo", -1))
        .is_none());
    assert_eq!(
        session.find_entity_by_key(&EntityKey::single("Todo", 42)),
        Some(todo)
    );
    assert!(!session.has_changes());
}

#[tokio::test]
async fn unreadable_saved_entities_fail_before_commit() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = session
        .create_entity("Todo", json!({"Title": "write tests"}))
        .unwrap();
    let before = snapshot(&session);

    mock.push_json(
        200,
        &json!({
            "Entities": [{"$type": "Demo.Models.Todo, Demo", "Title": "write tests"}],
            "KeyMappings": [{"EntityTypeName": "Demo.Models.Todo, Demo", "TempValue": -1, "RealValue": 42}]
        }),
    );
    let err = session.save_changes(None).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Mapping(MappingError::MissingKey { .. })
    ));
    assert_eq!(todo.key(), Some(EntityKey::single("Todo", -1)));
    assert_eq!(snapshot(&session), before);
    assert!(!session.is_saving());
}

#[tokio::test]
async fn save_request_is_one_ordered_bundle() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todos = load_todos(&session, &mock, &[1, 2]).await;
    todos[1].set("Title", "edited").unwrap();
    session.mark_for_delete(&todos[0]).unwrap();
    session.create_entity("Todo", json!({"Title": "new"})).unwrap();

    mock.push_json(200, &json!({"Entities": [], "KeyMappings": []}));
    session.save_changes(None).await.unwrap();

    let request = &mock.requests()[1];
    assert_eq!(request.method, Method::Post);
    assert_eq!(request.url, "api/SaveChanges");
    assert_eq!(request.header("Content-Type"), Some("application/json"));

    let bundle: Value = serde_json::from_str(request.body_text().unwrap()).unwrap();
    let states: Vec<&str> = bundle["entities"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["entityAspect"]["entityState"].as_str().unwrap())
        .collect();
    assert_eq!(states, vec!["Deleted", "Modified", "Added"]);
    assert_eq!(
        bundle["entities"][1]["entityAspect"]["originalValuesMap"],
        json!({"Title": "todo"})
    );
    assert_eq!(bundle["saveOptions"], json!({"allowConcurrentSaves": false}));
}

#[tokio::test]
async fn deleted_entities_are_detached_after_save() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[7]).await.remove(0);
    session.mark_for_delete(&todo).unwrap();

    mock.push_json(200, &json!({"Entities": [todo_json(7, "todo")]}));
    session.save_changes(None).await.unwrap();

    assert_eq!(todo.state(), EntityState::Detached);
    assert_eq!(session.tracked_count(), 0);
}

#[tokio::test]
async fn empty_change_set_does_not_contact_the_service() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);

    let result = session.save_changes(None).await.unwrap();

    assert!(result.is_empty());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn scoped_save_sends_only_the_given_entities() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todos = load_todos(&session, &mock, &[1, 2]).await;
    todos[0].set("Title", "one").unwrap();
    todos[1].set("Title", "two").unwrap();

    mock.push_json(200, &json!({}));
    session
        .save_changes(Some(&[todos[0].clone(), todos[0].clone()]))
        .await
        .unwrap();

    let bundle: Value =
        serde_json::from_str(mock.requests()[1].body_text().unwrap()).unwrap();
    assert_eq!(bundle["entities"].as_array().unwrap().len(), 1);
    assert_eq!(todos[0].state(), EntityState::Unchanged);
    assert_eq!(todos[1].state(), EntityState::Modified);

    let stranger = Entity::from_json("Todo", json!({"Id": 9}));
    let err = session.save_changes(Some(&[stranger])).await.unwrap_err();
    assert!(matches!(err, SessionError::NotTracked));
}

#[tokio::test]
async fn http_failure_leaves_entities_modified() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    todo.set("Title", "edited").unwrap();
    let before = snapshot(&session);

    mock.push_response(RawResponse::json(500, &json!({"Message": "database offline"})));
    let err = session.save_changes(None).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Status { status: 500, .. })
    ));
    assert_eq!(todo.state(), EntityState::Modified);
    assert_eq!(todo.original_values().get("Title"), Some(&json!("todo")));
    assert_eq!(snapshot(&session), before);
    assert!(!session.is_saving());
}

#[tokio::test]
async fn network_failure_is_a_transport_error() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    session.create_entity("Todo", json!({"Title": "x"})).unwrap();

    mock.push_failure(TransportError::network_retryable("connection reset"));
    let err = session.save_changes(None).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(session.changes().len(), 1);
}

#[tokio::test]
async fn entity_errors_become_a_save_error() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = session.create_entity("Todo", json!({"Title": ""})).unwrap();
    let before = snapshot(&session);

    mock.push_response(RawResponse::json(
        403,
        &json!({
            "Message": "Validation error",
            "EntityErrors": [{
                "ErrorName": "Required",
                "EntityTypeName": "Demo.Models.Todo, Demo",
                "KeyValues": [-1],
                "PropertyName": "Title",
                "ErrorMessage": "Title is required"
            }]
        }),
    ));
    let err = session.save_changes(None).await.unwrap_err();

    let save = err.save_error().expect("save rejection");
    assert_eq!(save.status, Some(403));
    assert_eq!(save.message, "Validation error");
    assert!(save.is_atomic());
    assert_eq!(save.entity_errors[0].entity, Some(todo.clone()));
    assert_eq!(save.implicated(), vec![todo.clone()]);
    assert_eq!(todo.state(), EntityState::Added);
    assert_eq!(snapshot(&session), before);
}

fn mixed_outcome() -> Value {
    json!({
        "Entities": [{"$type": "Todo", "Id": 10, "Title": "good"}],
        "KeyMappings": [{"EntityTypeName": "Todo", "TempValue": -1, "RealValue": 10}],
        "Errors": [{"EntityTypeName": "Todo", "KeyValues": [-2], "ErrorMessage": "bad title"}]
    })
}

#[tokio::test]
async fn mixed_outcome_is_all_or_nothing_by_default() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let good = session.create_entity("Todo", json!({"Title": "good"})).unwrap();
    let bad = session.create_entity("Todo", json!({"Title": "bad"})).unwrap();
    let before = snapshot(&session);

    mock.push_json(200, &mixed_outcome());
    let err = session.save_changes(None).await.unwrap_err();

    let save = err.save_error().unwrap();
    assert!(save.committed.is_empty());
    assert_eq!(save.implicated(), vec![bad.clone()]);
    assert_eq!(good.state(), EntityState::Added);
    assert_eq!(snapshot(&session), before);
}

#[tokio::test]
async fn partial_commit_commits_entities_without_errors() {
    let mock = Arc::new(MockTransport::new());
    let session = session_with(
        SessionConfig::default().with_save_policy(SavePolicy::PartialCommit),
        &mock,
    );
    let good = session.create_entity("Todo", json!({"Title": "good"})).unwrap();
    let bad = session.create_entity("Todo", json!({"Title": "bad"})).unwrap();

    mock.push_json(200, &mixed_outcome());
    let err = session.save_changes(None).await.unwrap_err();

    let save = err.save_error().unwrap();
    assert_eq!(save.committed, vec![EntityKey::single("Todo", 10)]);
    assert_eq!(good.state(), EntityState::Unchanged);
    assert_eq!(good.get("Id"), Some(json!(10)));
    assert_eq!(bad.state(), EntityState::Added);
    assert_eq!(bad.key(), Some(EntityKey::single("Todo", -2)));
}

#[tokio::test]
async fn concurrent_save_is_rejected_as_busy() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = session.create_entity("Todo", json!({"Title": "x"})).unwrap();
    let pending = mock.defer();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.save_changes(None).await })
    };
    while mock.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(session.is_saving());

    let err = session.save_changes(None).await.unwrap_err();
    assert!(matches!(err, SessionError::Busy));
    assert_eq!(mock.call_count(), 1);

    assert!(pending.respond(RawResponse::ok_json(&json!({
        "KeyMappings": [{"EntityTypeName": "Todo", "TempValue": -1, "RealValue": 1}]
    }))));
    first.await.unwrap().unwrap();

    assert_eq!(todo.state(), EntityState::Unchanged);
    assert!(!session.is_saving());
}

/// Starts a save whose reply is held back until the returned handle
/// responds, and waits until the request reaches the double.
async fn save_in_flight(
    session: &Session,
    mock: &Arc<MockTransport>,
) -> (
    DeferredReply,
    tokio::task::JoinHandle<Result<SaveResult, SessionError>>,
) {
    let calls = mock.call_count();
    let pending = mock.defer();
    let save = {
        let session = session.clone();
        tokio::spawn(async move { session.save_changes(None).await })
    };
    while mock.call_count() == calls {
        tokio::task::yield_now().await;
    }
    (pending, save)
}

#[tokio::test]
async fn edits_made_during_a_save_stay_pending() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    todo.set("Title", "first edit").unwrap();

    let (pending, save) = save_in_flight(&session, &mock).await;
    todo.set("Title", "second edit").unwrap();
    assert!(pending.respond(RawResponse::ok_json(&json!({"Entities": [], "KeyMappings": []}))));
    save.await.unwrap().unwrap();

    let sent: Value = serde_json::from_str(mock.requests()[1].body_text().unwrap()).unwrap();
    assert_eq!(sent["entities"][0]["Title"], json!("first edit"));
    assert_eq!(todo.get("Title"), Some(json!("second edit")));
    assert_eq!(todo.state(), EntityState::Modified);
    assert_eq!(
        todo.original_values().get("Title"),
        Some(&json!("first edit"))
    );
    assert_eq!(session.changes(), vec![todo.clone()]);

    session.reject_changes(&todo).unwrap();
    assert_eq!(todo.get("Title"), Some(json!("first edit")));
}

#[tokio::test]
async fn delete_marked_during_a_save_is_not_committed() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    todo.set("Title", "edited").unwrap();

    let (pending, save) = save_in_flight(&session, &mock).await;
    session.mark_for_delete(&todo).unwrap();
    assert!(pending.respond(RawResponse::ok_json(&json!({
        "Entities": [todo_json(1, "edited")]
    }))));
    let result = save.await.unwrap().unwrap();

    assert_eq!(result.entities, vec![todo.clone()]);
    assert_eq!(todo.state(), EntityState::Deleted);
    assert_eq!(session.tracked_count(), 1);
    assert_eq!(
        session.find_entity_by_key(&EntityKey::single("Todo", 1)),
        Some(todo.clone())
    );
    assert!(session.has_changes());

    session.reject_changes(&todo).unwrap();
    assert_eq!(todo.state(), EntityState::Unchanged);
    assert_eq!(todo.get("Title"), Some(json!("edited")));
}

#[tokio::test]
async fn rejecting_during_a_save_leaves_the_local_values_pending() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let todo = load_todos(&session, &mock, &[1]).await.remove(0);
    todo.set("Title", "edited").unwrap();

    let (pending, save) = save_in_flight(&session, &mock).await;
    session.reject_changes(&todo).unwrap();
    assert!(pending.respond(RawResponse::ok_json(&json!({}))));
    save.await.unwrap().unwrap();

    assert_eq!(todo.get("Title"), Some(json!("todo")));
    assert_eq!(todo.state(), EntityState::Modified);
    assert_eq!(todo.original_values().get("Title"), Some(&json!("edited")));
}

#[tokio::test]
async fn added_key_cannot_change_while_saving() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    session
        .registry()
        .register(EntityType::new("Tag").with_key(["Name"]));
    let tag = session.create_entity("Tag", json!({"Name": "a"})).unwrap();

    let (pending, save) = save_in_flight(&session, &mock).await;
    let err = tag.set("Name", "b").unwrap_err();
    assert!(matches!(err, SessionError::InvalidOperation(_)));
    assert!(pending.respond(RawResponse::ok_json(&json!({}))));
    save.await.unwrap().unwrap();

    assert_eq!(tag.state(), EntityState::Unchanged);
    assert_eq!(tag.key(), Some(EntityKey::single("Tag", "a")));
}

#[test]
fn changing_an_added_key_reindexes_the_entity() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    session
        .registry()
        .register(EntityType::new("Tag").with_key(["Name"]));
    let changes = session.subscribe();
    let tag = session.create_entity("Tag", json!({"Name": "a"})).unwrap();

    tag.set("Name", "b").unwrap();

    assert_eq!(tag.key(), Some(EntityKey::single("Tag", "b")));
    assert_eq!(
        session.find_entity_by_key(&EntityKey::single("Tag", "b")),
        Some(tag.clone())
    );
    assert!(session
        .find_entity_by_key(&EntityKey::single("Tag", "a"))
        .is_none());
    let actions: Vec<_> = changes.try_iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        vec![
            EntityAction::Added,
            EntityAction::KeyChanged,
            EntityAction::PropertyChanged
        ]
    );

    let twin = Entity::from_json("Tag", json!({"Name": "b"}));
    assert!(matches!(
        session.attach_entity(&twin),
        Err(SessionError::DuplicateKey { .. })
    ));
    let other = session.create_entity("Tag", json!({"Name": "c"})).unwrap();
    assert!(matches!(
        other.set("Name", "b"),
        Err(SessionError::DuplicateKey { .. })
    ));
    assert_eq!(other.get("Name"), Some(json!("c")));
    assert_eq!(other.key(), Some(EntityKey::single("Tag", "c")));
    assert_eq!(session.tracked_count(), 2);
}

#[tokio::test]
async fn disabling_the_double_fails_a_pending_save() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    session.create_entity("Todo", json!({"Title": "x"})).unwrap();
    let _pending = mock.defer();

    let save = {
        let session = session.clone();
        tokio::spawn(async move { session.save_changes(None).await })
    };
    while mock.call_count() == 0 {
        tokio::task::yield_now().await;
    }
    mock.disable();

    let err = save.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::DisabledWhilePending)
    ));
    assert_eq!(session.changes().len(), 1);
}

#[tokio::test]
async fn save_emits_change_notifications() {
    let mock = Arc::new(MockTransport::new());
    let session = session(&mock);
    let changes = session.subscribe();
    session.create_entity("Todo", json!({"Title": "x"})).unwrap();

    mock.push_json(
        200,
        &json!({"KeyMappings": [{"EntityTypeName": "Todo", "TempValue": -1, "RealValue": 3}]}),
    );
    session.save_changes(None).await.unwrap();

    let actions: Vec<EntityAction> = changes.try_iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        vec![EntityAction::Added, EntityAction::KeyChanged, EntityAction::Saved]
    );
    assert_eq!(
        session.recent_changes(0, 10).last().unwrap().key,
        EntityKey::single("Todo", 3)
    );
}

// ----------------------------------------------------------------------
// Adapters
// ----------------------------------------------------------------------

/// Types every untyped record returned for `Todos` as a `Todo`.
struct TodoOnlyAdapter;

impl entiq_core::ResultsAdapter for TodoOnlyAdapter {
    fn map(
        &self,
        response: &RawResponse,
        shape: ResultShape,
        _declared_type: Option<&str>,
    ) -> Result<entiq_core::MappedResult, MappingError> {
        entiq_core::ResultMapper::new().map_body(&response.body, shape, Some("Todo"))
    }

    fn map_saved(&self, entities: Vec<Value>) -> Result<entiq_core::MappedResult, MappingError> {
        entiq_core::ResultMapper::new().map_payload(
            entiq_core::ResponsePayload::Array(entities),
            ResultShape::EntityArray,
            Some("Todo"),
        )
    }

    fn name(&self) -> &str {
        "todo-only"
    }
}

#[tokio::test]
async fn custom_results_adapter_is_used() {
    let mock = Arc::new(MockTransport::new());
    let session = Session::with_results_adapter(
        SessionConfig::default(),
        mock.clone(),
        Arc::new(TodoOnlyAdapter),
    );
    session.registry().register(EntityType::new("Todo"));
    mock.push_json(200, &json!([{"Id": 1, "Title": "untyped"}]));

    let todos = session
        .execute_query(&EntityQuery::from("Items"))
        .await
        .unwrap()
        .entities();

    assert_eq!(todos[0].key(), Some(EntityKey::single("Todo", 1)));
    assert!(format!("{session:?}").contains("tracked: 1"));
}
