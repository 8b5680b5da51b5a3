use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use tempfile::TempDir;
use tessera_catalog::{Catalogue, CatalogueOptions};
use tessera_core::config::{Config, CustomStreamsConfig, StreamSeed};
use tessera_core::id::EventId;
use tessera_core::stream::{ACTIVE_MARKER, StreamId};
use tessera_registry::{
    CreateUser, RegisterError, RegisterResult, ServiceRegister, UserUpdate, ValidateUser,
};
use tessera_user_db::UserDbPool;
use tower::ServiceExt as _;

use crate::{AppState, LogMailer, SharedState, routes};

// --- fixtures -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateFailure {
    Conflict,
    ServerError,
}

/// In-memory register double: records every call, fails on demand.
#[derive(Default)]
struct FakeRegister {
    calls: Mutex<Vec<String>>,
    updates: Mutex<Vec<UserUpdate>>,
    fail_update: Mutex<Option<UpdateFailure>>,
    conflict_data: Mutex<Option<serde_json::Value>>,
}

impl FakeRegister {
    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn updates(&self) -> Vec<UserUpdate> {
        self.updates.lock().unwrap().clone()
    }

    fn fail_next_update(&self, failure: UpdateFailure, data: Option<serde_json::Value>) {
        *self.fail_update.lock().unwrap() = Some(failure);
        *self.conflict_data.lock().unwrap() = data;
    }
}

#[async_trait::async_trait]
impl ServiceRegister for FakeRegister {
    async fn validate_user(&self, request: &ValidateUser) -> RegisterResult<()> {
        self.log(format!("validate {}", request.username));
        Ok(())
    }

    async fn check_username(&self, _username: &str) -> RegisterResult<bool> {
        Ok(false)
    }

    async fn create_user(&self, payload: &CreateUser) -> RegisterResult<()> {
        self.log(format!("create {}", payload.username));
        Ok(())
    }

    async fn update_user(&self, update: &UserUpdate) -> RegisterResult<()> {
        self.log(format!("update {}", update.username));
        self.updates.lock().unwrap().push(update.clone());
        match self.fail_update.lock().unwrap().take() {
            Some(UpdateFailure::Conflict) => Err(RegisterError::ItemAlreadyExists {
                data: self
                    .conflict_data
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or(serde_json::Value::Null),
            }),
            Some(UpdateFailure::ServerError) => Err(RegisterError::Unavailable {
                message: "register replied 500".to_owned(),
            }),
            None => Ok(()),
        }
    }

    async fn delete_user(&self, username: &str, only_reg: bool) -> RegisterResult<()> {
        self.log(format!("delete {username} onlyReg={only_reg}"));
        Ok(())
    }
}

fn custom_streams() -> CustomStreamsConfig {
    let mut email = StreamSeed {
        id: "email".to_owned(),
        name: None,
        event_type: "email/string".to_owned(),
        is_indexed: Some(true),
        is_unique: Some(true),
        is_shown: Some(true),
        is_editable: Some(true),
        is_required_in_validation: Some(true),
        regex_validation: None,
        default: None,
        children: Vec::new(),
    };
    email.regex_validation = Some(r"^[^@\s]+@[^@\s]+$".to_owned());
    let insurancenumber = StreamSeed {
        id: "insurancenumber".to_owned(),
        name: None,
        event_type: "identifier/string".to_owned(),
        is_indexed: Some(true),
        is_unique: Some(false),
        is_shown: Some(true),
        is_editable: Some(true),
        is_required_in_validation: Some(false),
        regex_validation: None,
        default: None,
        children: Vec::new(),
    };
    let phone_number = StreamSeed {
        id: "phoneNumber".to_owned(),
        name: None,
        event_type: "identifier/string".to_owned(),
        is_indexed: Some(false),
        is_unique: Some(false),
        is_shown: Some(true),
        is_editable: Some(true),
        is_required_in_validation: Some(false),
        regex_validation: None,
        default: None,
        children: Vec::new(),
    };
    CustomStreamsConfig {
        account: vec![email, insurancenumber, phone_number],
        other: vec![],
    }
}

async fn test_state(register: Arc<dyn ServiceRegister>) -> (TempDir, SharedState) {
    let dir = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(
        Catalogue::build(CatalogueOptions {
            custom: custom_streams(),
            ..Default::default()
        })
        .expect("valid catalogue"),
    );
    let accounts = Arc::new(
        tessera_accounts::AccountsDb::open_in_memory()
            .await
            .expect("accounts db"),
    );
    let user_dbs = Arc::new(
        UserDbPool::new(dir.path().join("users"), 16)
            .await
            .expect("pool"),
    );
    let state = Arc::new(AppState::new(
        Config::default(),
        catalog,
        accounts,
        user_dbs,
        register,
        Arc::new(LogMailer),
    ));
    (dir, state)
}

// --- HTTP harness ---------------------------------------------------------

async fn send(
    router: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

fn registration_body(username: &str, email: &str) -> serde_json::Value {
    serde_json::json!({
        "username": username,
        "password": "secret-pass",
        "appId": "test-app",
        "email": email,
        "insurancenumber": "123",
    })
}

async fn register_and_login(router: &Router, username: &str, email: &str) -> String {
    let (status, _) = send(router, "POST", "/users", None, Some(registration_body(username, email))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(
        router,
        "POST",
        &format!("/{username}/auth/login"),
        None,
        Some(serde_json::json!({
            "username": username,
            "password": "secret-pass",
            "appId": "test-app",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().expect("token").to_owned()
}

// --- registration ---------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registration_creates_user_and_pushes_indexed_fields() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());

    let (status, body) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("u1", "a@b.io")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    assert_eq!(body["username"], "u1");
    assert!(body["apiEndpoint"].as_str().unwrap().contains("/u1/"));

    // register saw validate, create, then the creation PUT
    let calls = register.calls();
    assert_eq!(calls[0], "validate u1");
    assert!(calls.contains(&"create u1".to_owned()));
    let updates = register.updates();
    assert_eq!(updates.len(), 1);
    let email_entries = &updates[0].user["email"];
    assert_eq!(email_entries.len(), 1);
    assert_eq!(email_entries[0].value, serde_json::json!("a@b.io"));
    assert!(email_entries[0].is_unique);
    assert!(email_entries[0].is_active);
    assert!(email_entries[0].creation);
    // non-unique indexed fields ride along without the unique flag
    assert!(!updates[0].user["insurancenumber"][0].is_unique);

    // exactly one personal access
    let user_id = state.accounts.get_user_id("u1").await.unwrap().unwrap();
    let accesses = state.accounts.list_accesses(&user_id, false).await.unwrap();
    assert_eq!(accesses.len(), 1);
    assert_eq!(
        accesses[0].access_type,
        tessera_core::access::AccessType::Personal
    );

    // the account is recomposed from events
    let email = state.account_value(&user_id, "email").await.unwrap();
    assert_eq!(email, Some(serde_json::json!("a@b.io")));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registration_rejects_bad_params() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state);

    // missing required email
    let mut body = registration_body("u1", "a@b.io");
    body.as_object_mut().unwrap().remove("email");
    let (status, body) = send(&router, "POST", "/users", None, Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["id"], "invalid-parameters-format");

    // malformed email
    let (status, _) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("u1", "not-an-email")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // malformed username
    let (status, _) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("U!", "a@b.io")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn reregistration_precleans_local_orphan() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());

    // a half-finished registration left local state but nothing on the
    // register
    let orphan_id = tessera_core::id::UserId::generate();
    state.accounts.add_user("u1", &orphan_id).await.unwrap();
    let mut values = BTreeMap::new();
    values.insert("email".to_owned(), serde_json::json!("a@b.io"));
    values.insert("username".to_owned(), serde_json::json!("u1"));
    state
        .create_account_events(&orphan_id, &values, "system", tessera_core::Timestamp::now())
        .await
        .unwrap();

    // second attempt with a different email succeeds
    let (status, _) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("u1", "c@d.io")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // the register-side shadow was cleaned before re-creating
    assert!(
        register
            .calls()
            .contains(&"delete u1 onlyReg=true".to_owned())
    );

    // exactly one local user remains, with the new email
    let user_id = state.accounts.get_user_id("u1").await.unwrap().unwrap();
    assert_ne!(user_id, orphan_id);
    let email = state.account_value(&user_id, "email").await.unwrap();
    assert_eq!(email, Some(serde_json::json!("c@d.io")));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registration_rolls_back_local_user_on_register_conflict() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());

    register.fail_next_update(
        UpdateFailure::Conflict,
        Some(serde_json::json!({"email": "a@b.io", "phone": "other-users-value"})),
    );
    let (status, body) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("u1", "a@b.io")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["id"], "item-already-exists");
    // sanitised: only values this request submitted survive
    assert_eq!(body["error"]["data"]["email"], "a@b.io");
    assert!(body["error"]["data"].get("phone").is_none());

    // rollback removed the local user and told the register to forget it
    assert!(state.accounts.get_user_id("u1").await.unwrap().is_none());
    assert!(
        register
            .calls()
            .contains(&"delete u1 onlyReg=true".to_owned())
    );
}

// --- account events -------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn account_event_creation_moves_the_active_marker() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;
    let updates_before = register.updates().len();

    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": [":system:phoneNumber"],
            "type": "identifier/string",
            "content": "555-0001",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let first_id = body["event"]["id"].as_str().unwrap().to_owned();
    assert_eq!(
        body["event"]["streamIds"],
        serde_json::json!([":system:phoneNumber", ".active"])
    );

    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": [":system:phoneNumber"],
            "type": "identifier/string",
            "content": "555-0002",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body["event"]["streamIds"],
        serde_json::json!([":system:phoneNumber", ".active"])
    );

    // the first event lost the marker
    let (status, body) = send(
        &router,
        "GET",
        &format!("/u1/events/{first_id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["event"]["streamIds"],
        serde_json::json!([":system:phoneNumber"])
    );

    // phoneNumber is not indexed: no register traffic for it
    assert_eq!(register.updates().len(), updates_before);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unique_conflict_rolls_back_account_event() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    register.fail_next_update(
        UpdateFailure::Conflict,
        Some(serde_json::json!({"email": "taken@b.io"})),
    );
    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": [":system:email"],
            "type": "email/string",
            "content": "taken@b.io",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["data"]["email"], "taken@b.io");

    // no new event persisted; the original email is still the active one
    let user_id = state.accounts.get_user_id("u1").await.unwrap().unwrap();
    let email = state.account_value(&user_id, "email").await.unwrap();
    assert_eq!(email, Some(serde_json::json!("a@b.io")));
    let db = state.user_dbs.get_or_open(&user_id).await.unwrap();
    let events = db.get_events_on_stream(":system:email").await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(
        events[0]
            .stream_ids
            .iter()
            .any(|s| s.as_str() == ACTIVE_MARKER)
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn indexed_account_update_pushes_and_rolls_back_on_server_error() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    // find the language event
    let (status, body) = send(
        &router,
        "GET",
        "/u1/events?limit=100",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let language_event = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| {
            e["streamIds"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!(":_system:language"))
        })
        .expect("language event")
        .clone();
    let language_id = language_event["id"].as_str().unwrap();

    // a good update goes through and reaches the register
    let (status, body) = send(
        &router,
        "PUT",
        &format!("/u1/events/{language_id}"),
        Some(&token),
        Some(serde_json::json!({"content": "fr"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    let update = register.updates().last().cloned().unwrap();
    let entry = &update.user["language"][0];
    assert_eq!(entry.value, serde_json::json!("fr"));
    assert!(!entry.is_unique);
    assert!(entry.is_active);
    assert!(!entry.creation);

    // a failing register rolls the local value back
    register.fail_next_update(UpdateFailure::ServerError, None);
    let (status, _) = send(
        &router,
        "PUT",
        &format!("/u1/events/{language_id}"),
        Some(&token),
        Some(serde_json::json!({"content": "de"})),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let user_id = state.accounts.get_user_id("u1").await.unwrap().unwrap();
    let language = state.account_value(&user_id, "language").await.unwrap();
    assert_eq!(language, Some(serde_json::json!("fr")));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn active_account_event_cannot_be_deleted() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    let (_, body) = send(&router, "GET", "/u1/events?limit=100", Some(&token), None).await;
    let email_event_id = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| {
            e["streamIds"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!(":system:email"))
        })
        .expect("email event")["id"]
        .as_str()
        .unwrap()
        .to_owned();

    let (status, body) = send(
        &router,
        "DELETE",
        &format!("/u1/events/{email_event_id}"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["id"], "invalid-operation");
}

// --- permissions over HTTP ------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn wildcard_shared_access_never_sees_account_events() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    // a plain event next to the account events
    let (status, _) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": ["diary"],
            "type": "note/txt",
            "content": "hello",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // personal sees both kinds
    let (_, body) = send(&router, "GET", "/u1/events?limit=100", Some(&token), None).await;
    let personal_view = body["events"].as_array().unwrap().len();
    assert!(personal_view > 1, "personal should see account events too");

    // shared access with a blanket read grant
    let (status, body) = send(
        &router,
        "POST",
        "/u1/accesses",
        Some(&token),
        Some(serde_json::json!({
            "name": "reader",
            "type": "shared",
            "permissions": [{"streamId": "*", "level": "read"}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let shared_token = body["access"]["token"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &router,
        "GET",
        "/u1/events?limit=100",
        Some(&shared_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1, "only the diary event: {events:?}");
    for event in events {
        for stream_id in event["streamIds"].as_array().unwrap() {
            let stream_id = stream_id.as_str().unwrap();
            assert!(
                !stream_id.starts_with(":_system:") && !stream_id.starts_with(":system:"),
                "leaked account stream {stream_id}"
            );
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mixed_account_events_reject_and_never_leak() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    // an account leaf may not share an event with an unrelated stream
    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": [":_system:language", "project-x"],
            "type": "note/txt",
            "content": "nope",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["error"]["id"], "invalid-operation");

    // nor may an update move an account event onto one
    let (_, body) = send(&router, "GET", "/u1/events?limit=100", Some(&token), None).await;
    let language_id = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| {
            e["streamIds"]
                .as_array()
                .unwrap()
                .contains(&serde_json::json!(":_system:language"))
        })
        .expect("language event")["id"]
        .as_str()
        .unwrap()
        .to_owned();
    let (status, body) = send(
        &router,
        "PUT",
        &format!("/u1/events/{language_id}"),
        Some(&token),
        Some(serde_json::json!({
            "streamIds": [":_system:language", ".active", "project-x"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert_eq!(body["error"]["id"], "invalid-operation");

    // force the corrupt shape straight into the store, the way legacy data
    // could carry it, and check it still cannot leak
    let user_id = state.accounts.get_user_id("u1").await.unwrap().unwrap();
    let db = state.user_dbs.get_or_open(&user_id).await.unwrap();
    let language_event_id: EventId = language_id.parse().unwrap();
    db.rewrite_stream_ids(
        &language_event_id,
        &[
            StreamId::from(":_system:language"),
            StreamId::from(ACTIVE_MARKER),
            StreamId::from("project-x"),
        ],
    )
    .await
    .unwrap();

    let (status, body) = send(
        &router,
        "POST",
        "/u1/accesses",
        Some(&token),
        Some(serde_json::json!({
            "name": "px-reader",
            "type": "shared",
            "permissions": [{"streamId": "project-x", "level": "read"}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let px_token = body["access"]["token"].as_str().unwrap().to_owned();

    // the single-event fetch must refuse: the event also sits on an
    // account stream this access cannot read
    let (status, body) = send(
        &router,
        "GET",
        &format!("/u1/events/{language_id}"),
        Some(&px_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "body: {body}");

    // and listings stay clean of it too
    let (status, body) = send(
        &router,
        "GET",
        "/u1/events?limit=100",
        Some(&px_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 0, "body: {body}");

    // a genuinely plain event on the granted stream is still readable
    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&token),
        Some(serde_json::json!({
            "streamIds": ["project-x"],
            "type": "note/txt",
            "content": "plain",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let plain_id = body["event"]["id"].as_str().unwrap().to_owned();
    let (status, _) = send(
        &router,
        "GET",
        &format!("/u1/events/{plain_id}"),
        Some(&px_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn create_only_access_cannot_read_back() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    let (_, body) = send(
        &router,
        "POST",
        "/u1/accesses",
        Some(&token),
        Some(serde_json::json!({
            "name": "dropbox",
            "type": "shared",
            "permissions": [{"streamId": "inbox", "level": "create-only"}],
        })),
    )
    .await;
    let drop_token = body["access"]["token"].as_str().unwrap().to_owned();

    let (status, body) = send(
        &router,
        "POST",
        "/u1/events",
        Some(&drop_token),
        Some(serde_json::json!({
            "streamIds": ["inbox"],
            "type": "note/txt",
            "content": "dropped",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let event_id = body["event"]["id"].as_str().unwrap().to_owned();

    // reads and updates stay closed
    let (status, body) = send(&router, "GET", "/u1/events", Some(&drop_token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["events"].as_array().unwrap().len(), 0);

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/u1/events/{event_id}"),
        Some(&drop_token),
        Some(serde_json::json!({"content": "changed"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// --- auth flows -----------------------------------------------------------

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn auth_failures_map_to_the_taxonomy() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    // unknown user
    let (status, body) = send(&router, "GET", "/nobody/events", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["id"], "unknown-resource");

    // missing token
    let (status, body) = send(&router, "GET", "/u1/events", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["id"], "invalid-access-token");

    // bogus token
    let (status, _) = send(&router, "GET", "/u1/events", Some("nope"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // wrong password
    let (status, _) = send(
        &router,
        "POST",
        "/u1/auth/login",
        None,
        Some(serde_json::json!({
            "username": "u1",
            "password": "wrong",
            "appId": "test-app",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // logout kills the session and with it the personal token
    let (status, _) = send(&router, "POST", "/u1/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&router, "GET", "/u1/events", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "body: {body}");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn user_deletion_removes_everything_and_notifies_register() {
    let register = Arc::new(FakeRegister::default());
    let (_dir, state) = test_state(register.clone()).await;
    let router = routes::router(state.clone());
    let token = register_and_login(&router, "u1", "a@b.io").await;

    let (status, body) = send(&router, "DELETE", "/users/u1", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["userDeletion"]["username"], "u1");

    assert!(state.accounts.get_user_id("u1").await.unwrap().is_none());
    assert!(
        register
            .calls()
            .contains(&"delete u1 onlyReg=true".to_owned())
    );

    // and the name is free to take again
    let (status, _) = send(
        &router,
        "POST",
        "/users",
        None,
        Some(registration_body("u1", "x@y.io")),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}
