//! Session fixtures.
//!
//! Wires sessions to the scripted [`MockTransport`] or to a
//! [`FakeService`] served over the loopback HTTP client.

use crate::fake_service::{FakeService, ValidationFailure};
use entiq_core::{EntityType, Session, SessionConfig};
use entiq_transport::{HttpTransport, LoopbackClient, MockTransport, ServiceEndpoint};
use serde_json::{json, Value};
use std::sync::Arc;

/// Namespace used in fixture type tags.
pub const NAMESPACE: &str = "Demo.Models";

/// Transport type of loopback sessions.
pub type LoopbackTransport = HttpTransport<LoopbackClient<Arc<FakeService>>>;

/// The `Todo` type: identity key `Id`, served at `Todos`.
pub fn todo_type() -> EntityType {
    EntityType::new("Todo").identity().with_resource("Todos")
}

/// The `Category` type: caller-assigned key `Id`, served at `Categories`.
pub fn category_type() -> EntityType {
    EntityType::new("Category").with_resource("Categories")
}

/// A `Todo` record as the service sends it.
pub fn todo_json(id: i64, title: &str) -> Value {
    json!({
        "$type": format!("{NAMESPACE}.Todo, {NAMESPACE}"),
        "Id": id,
        "Title": title,
        "IsDone": false,
    })
}

/// A session over a fresh scripted transport, with the fixture types
/// registered.
pub fn mock_session() -> (Session, Arc<MockTransport>) {
    mock_session_with(SessionConfig::default())
}

/// Like [`mock_session`] with a custom configuration.
pub fn mock_session_with(config: SessionConfig) -> (Session, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new());
    let session = Session::new(config, mock.clone());
    session.registry().register(todo_type());
    session.registry().register(category_type());
    (session, mock)
}

/// A fake service with the fixture types and five seeded todos
/// (`Id` 1 to 5, even ids done) and two categories. Empty titles are
/// rejected.
pub fn todo_service() -> Arc<FakeService> {
    let service = FakeService::new(NAMESPACE)
        .with_entity_type(todo_type())
        .with_entity_type(category_type())
        .with_validator(|_, values| {
            (values.get("Title") == Some(&json!("")))
                .then(|| ValidationFailure::on("Title", "Title is required"))
        });
    service.seed(
        "Todo",
        (1..=5).map(|id| {
            json!({
                "Id": id,
                "Title": format!("todo {id}"),
                "IsDone": id % 2 == 0,
                "Priority": 6 - id,
            })
        }),
    );
    service.seed(
        "Category",
        [
            json!({"Id": 1, "Name": "home"}),
            json!({"Id": 2, "Name": "work"}),
        ],
    );
    Arc::new(service)
}

/// A session talking to `service` over the loopback HTTP client, with
/// the service's types registered.
pub fn loopback_session(service: &Arc<FakeService>) -> Session {
    loopback_session_with(service, SessionConfig::default())
}

/// Like [`loopback_session`] with a custom configuration.
pub fn loopback_session_with(service: &Arc<FakeService>, config: SessionConfig) -> Session {
    let transport: LoopbackTransport =
        HttpTransport::for_endpoint(&config.endpoint, LoopbackClient::new(Arc::clone(service)));
    let session = Session::new(config, Arc::new(transport));
    for entity_type in service.entity_types() {
        session.registry().register(entity_type);
    }
    session
}

/// A loopback session that learns entity types from payloads.
pub fn metadata_free_session(service: &Arc<FakeService>) -> Session {
    let config = SessionConfig::new(ServiceEndpoint::new("api/").with_server_metadata(false));
    let transport: LoopbackTransport =
        HttpTransport::for_endpoint(&config.endpoint, LoopbackClient::new(Arc::clone(service)));
    Session::new(config, Arc::new(transport))
}
