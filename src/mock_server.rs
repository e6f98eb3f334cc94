//! In-memory feature-voting API built on Axum.
//!
//! Implements the same endpoints as the real backend (auth, feature list,
//! create, detail, delete, vote toggle, voters) over plain in-process state,
//! so the coordinators can be exercised end to end without a live server.
//! A recording middleware logs every request and can replace or delay the
//! response for a given method and path.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{header, request::Parts, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{
    AuthResponse, AuthTokens, Author, CreateFeatureRequest, Feature, FeatureListResponse,
    FeatureVoters, LoginRequest, RegisterRequest, User, Vote, VoteRequest, VoteType,
};

/// One request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

/// A scripted response for the next request to a method + path. Without a
/// status the request is delayed and then handled normally.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    delay: Option<Duration>,
    status: Option<StatusCode>,
    body: Option<ReplyBody>,
}

#[derive(Debug, Clone)]
enum ReplyBody {
    Json(Value),
    Text(String),
}

impl Reply {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Let the request through after `delay`.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(ReplyBody::Json(body));
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(ReplyBody::Text(body.into()));
        self
    }

    fn into_response(self) -> Option<Response> {
        let status = self.status?;
        Some(match self.body {
            Some(ReplyBody::Json(value)) => (status, Json(value)).into_response(),
            Some(ReplyBody::Text(text)) => (status, text).into_response(),
            None => status.into_response(),
        })
    }
}

struct UserRecord {
    id: i64,
    username: String,
    email: String,
    password: String,
    date_joined: DateTime<Utc>,
}

struct FeatureRecord {
    id: Uuid,
    seq: u64,
    title: String,
    description: String,
    author_id: i64,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct VoteRecord {
    id: i64,
    user_id: i64,
    feature_id: Uuid,
    vote_type: VoteType,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Db {
    users: Vec<UserRecord>,
    tokens: HashMap<String, i64>,
    features: Vec<FeatureRecord>,
    votes: Vec<VoteRecord>,
    next_seq: u64,
    next_vote_id: i64,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Db {
    fn user(&self, id: i64) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.id == id)
    }

    fn add_user(&mut self, username: &str, email: &str, password: &str) -> i64 {
        let id = self.users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        self.users.push(UserRecord {
            id,
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            date_joined: Utc::now(),
        });
        id
    }

    fn issue_tokens(&mut self, user_id: i64) -> AuthTokens {
        let tokens = AuthTokens {
            access: format!("access-{}", Uuid::new_v4()),
            refresh: format!("refresh-{}", Uuid::new_v4()),
        };
        self.tokens.insert(tokens.access.clone(), user_id);
        tokens
    }

    fn auth_response(&mut self, user_id: i64, message: &str) -> Option<AuthResponse> {
        let tokens = self.issue_tokens(user_id);
        let user = self.user_view(user_id)?;
        Some(AuthResponse {
            message: message.to_string(),
            user,
            tokens,
        })
    }

    fn user_view(&self, id: i64) -> Option<User> {
        self.user(id).map(|u| User {
            id: u.id,
            username: u.username.clone(),
            email: u.email.clone(),
            date_joined: timestamp(&u.date_joined),
        })
    }

    fn author(&self, id: i64) -> Author {
        Author {
            id,
            username: self.user(id).map(|u| u.username.clone()).unwrap_or_default(),
        }
    }

    fn add_feature(&mut self, author_id: i64, title: &str, description: &str) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.next_seq += 1;
        self.features.push(FeatureRecord {
            id,
            seq: self.next_seq,
            title: title.to_string(),
            description: description.to_string(),
            author_id,
            active: true,
            created_at: now,
            updated_at: now,
        });
        id
    }

    fn active_feature(&self, id: &str) -> Option<&FeatureRecord> {
        let id = Uuid::parse_str(id).ok()?;
        self.features.iter().find(|f| f.id == id && f.active)
    }

    fn count(&self, feature_id: Uuid, vote_type: VoteType) -> i64 {
        self.votes
            .iter()
            .filter(|v| v.feature_id == feature_id && v.vote_type == vote_type)
            .count() as i64
    }

    fn feature_view(&self, record: &FeatureRecord, viewer: Option<i64>) -> Feature {
        let upvotes = self.count(record.id, VoteType::Upvote);
        let downvotes = self.count(record.id, VoteType::Downvote);
        let user_vote = viewer.and_then(|user_id| {
            self.votes
                .iter()
                .find(|v| v.user_id == user_id && v.feature_id == record.id)
                .map(|v| v.vote_type)
        });
        Feature {
            id: record.id.to_string(),
            title: record.title.clone(),
            description: Some(record.description.clone()),
            upvote_count: upvotes,
            downvote_count: downvotes,
            total_score: upvotes - downvotes,
            author: self.author(record.author_id),
            created_at: timestamp(&record.created_at),
            updated_at: Some(timestamp(&record.updated_at)),
            user_vote,
        }
    }

    fn add_vote(&mut self, user_id: i64, feature_id: Uuid, vote_type: VoteType) {
        self.next_vote_id += 1;
        self.votes.push(VoteRecord {
            id: self.next_vote_id,
            user_id,
            feature_id,
            vote_type,
            created_at: Utc::now(),
        });
    }
}

/// Shared server state. Clones share everything.
#[derive(Clone, Default)]
pub struct MockApi {
    db: Arc<Mutex<Db>>,
    scripts: Arc<Mutex<HashMap<(Method, String), VecDeque<Reply>>>>,
    log: Arc<Mutex<Vec<RecordedRequest>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user directly and returns its id.
    pub fn seed_user(&self, username: &str, email: &str, password: &str) -> i64 {
        lock(&self.db).add_user(username, email, password)
    }

    /// Adds a feature with no votes and returns its id.
    pub fn seed_feature(&self, author_id: i64, title: &str, description: &str) -> String {
        lock(&self.db).add_feature(author_id, title, description).to_string()
    }

    /// Records a vote directly. Unknown feature ids are ignored.
    pub fn seed_vote(&self, user_id: i64, feature_id: &str, vote_type: VoteType) {
        if let Ok(id) = Uuid::parse_str(feature_id) {
            lock(&self.db).add_vote(user_id, id, vote_type);
        }
    }

    /// Queues `reply` for the next request matching `method` and `path`
    /// (query string excluded). Replies queue up in order.
    pub fn script(&self, method: Method, path: &str, reply: Reply) {
        lock(&self.scripts)
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.log).clone()
    }

    pub fn requests_to(&self, method: &Method, path: &str) -> Vec<RecordedRequest> {
        lock(&self.log)
            .iter()
            .filter(|r| &r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    fn next_reply(&self, method: &Method, path: &str) -> Option<Reply> {
        lock(&self.scripts)
            .get_mut(&(method.clone(), path.to_string()))
            .and_then(VecDeque::pop_front)
    }

    fn user_for_token(&self, token: &str) -> Option<i64> {
        lock(&self.db).tokens.get(token).copied()
    }
}

/// Authenticated caller, resolved from the bearer token.
pub struct Caller(pub i64);

#[async_trait]
impl FromRequestParts<MockApi> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &MockApi) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| {
                detail(
                    StatusCode::UNAUTHORIZED,
                    "Authentication credentials were not provided.",
                )
            })?;

        state
            .user_for_token(token)
            .map(Caller)
            .ok_or_else(|| detail(StatusCode::UNAUTHORIZED, "Given token not valid for any token type"))
    }
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "detail": message }))).into_response()
}

/// Logs the request, then applies any scripted reply for it.
async fn record_and_script(State(api): State<MockApi>, req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    debug!(%method, %path, "mock api request");
    // Claim the script before logging, so a logged request has taken its reply.
    let reply = api.next_reply(&method, &path);
    lock(&api.log).push(RecordedRequest {
        method: method.clone(),
        path,
        query: req.uri().query().map(str::to_string),
        authorization,
    });

    if let Some(reply) = reply {
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(response) = reply.into_response() {
            return response;
        }
    }
    next.run(req).await
}

/// Router with every endpoint under `/api`.
pub fn create_router(api: MockApi) -> Router {
    let routes = Router::new()
        .route("/auth/register/", post(register_handler))
        .route("/auth/login/", post(login_handler))
        .route("/features/", get(list_handler))
        .route("/feature/", post(create_handler))
        .route("/feature/:id/", get(detail_handler).delete(delete_handler))
        .route("/feature/:id/vote/", post(vote_handler).delete(remove_vote_handler))
        .route("/feature/:id/voters/", get(voters_handler));

    Router::new()
        .nest("/api", routes)
        .layer(middleware::from_fn_with_state(api.clone(), record_and_script))
        .with_state(api)
}

async fn register_handler(State(api): State<MockApi>, Json(payload): Json<RegisterRequest>) -> Response {
    let mut db = lock(&api.db);
    let mut errors = serde_json::Map::new();

    if payload.username.trim().is_empty() {
        errors.insert("username".into(), json!(["This field may not be blank."]));
    } else if db.users.iter().any(|u| u.username == payload.username) {
        errors.insert(
            "username".into(),
            json!(["A user with that username already exists."]),
        );
    }
    if !payload.email.contains('@') {
        errors.insert("email".into(), json!(["Enter a valid email address."]));
    }
    let mut password_errors = vec![];
    if payload.password != payload.password_confirm {
        password_errors.push("Password fields didn't match.");
    }
    if payload.password.len() < 8 {
        password_errors.push("This password is too short. It must contain at least 8 characters.");
    }
    if !password_errors.is_empty() {
        errors.insert("password".into(), json!(password_errors));
    }
    if !errors.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(Value::Object(errors))).into_response();
    }

    let user_id = db.add_user(&payload.username, &payload.email, &payload.password);
    match db.auth_response(user_id, "User registered successfully") {
        Some(body) => (StatusCode::CREATED, Json(body)).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn login_handler(State(api): State<MockApi>, Json(payload): Json<LoginRequest>) -> Response {
    let mut db = lock(&api.db);
    let user_id = db
        .users
        .iter()
        .find(|u| u.username == payload.username && u.password == payload.password)
        .map(|u| u.id);

    match user_id.and_then(|id| db.auth_response(id, "Login successful")) {
        Some(body) => (StatusCode::OK, Json(body)).into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "non_field_errors": ["Invalid credentials"] })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct ListParams {
    sort: Option<String>,
}

async fn list_handler(
    State(api): State<MockApi>,
    caller: Option<Caller>,
    Query(params): Query<ListParams>,
) -> Response {
    let viewer = caller.map(|Caller(id)| id);
    let db = lock(&api.db);
    let mut records: Vec<&FeatureRecord> = db.features.iter().filter(|f| f.active).collect();
    records.sort_by(|a, b| b.seq.cmp(&a.seq));
    let mut features: Vec<Feature> = records
        .into_iter()
        .map(|f| db.feature_view(f, viewer))
        .collect();

    // Unknown sort values fall back to most recent first.
    if params.sort.as_deref() == Some("score") {
        features.sort_by(|a, b| b.total_score.cmp(&a.total_score));
    }

    Json(FeatureListResponse { results: features }).into_response()
}

async fn create_handler(
    State(api): State<MockApi>,
    Caller(user_id): Caller,
    Json(payload): Json<CreateFeatureRequest>,
) -> Response {
    if payload.title.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "title": ["This field may not be blank."] })),
        )
            .into_response();
    }
    if payload.description.chars().count() > 1000 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "description": ["Description cannot exceed 1000 characters"] })),
        )
            .into_response();
    }

    let mut db = lock(&api.db);
    let id = db.add_feature(user_id, &payload.title, &payload.description);
    // Authors start with their own upvote.
    db.add_vote(user_id, id, VoteType::Upvote);
    info!(feature_id = %id, "mock api created feature");

    match db.features.iter().find(|f| f.id == id) {
        Some(record) => (StatusCode::CREATED, Json(db.feature_view(record, Some(user_id)))).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn detail_handler(
    State(api): State<MockApi>,
    caller: Option<Caller>,
    Path(id): Path<String>,
) -> Response {
    let db = lock(&api.db);
    match db.active_feature(&id) {
        Some(record) => Json(db.feature_view(record, caller.map(|Caller(id)| id))).into_response(),
        None => detail(StatusCode::NOT_FOUND, "Not found."),
    }
}

async fn delete_handler(
    State(api): State<MockApi>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> Response {
    let mut db = lock(&api.db);
    let Some(author_id) = db.active_feature(&id).map(|f| f.author_id) else {
        return detail(StatusCode::NOT_FOUND, "Not found.");
    };
    if author_id != user_id {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "You can only delete your own features" })),
        )
            .into_response();
    }

    // Soft delete, like the backend.
    if let Some(record) = db.features.iter_mut().find(|f| f.id.to_string() == id) {
        record.active = false;
        record.updated_at = Utc::now();
    }
    StatusCode::NO_CONTENT.into_response()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Same direction twice removes the vote, the other direction changes it.
async fn vote_handler(
    State(api): State<MockApi>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
    Json(payload): Json<VoteRequest>,
) -> Response {
    let mut db = lock(&api.db);
    let Some(feature_id) = db.active_feature(&id).map(|f| f.id) else {
        return detail(StatusCode::NOT_FOUND, "Not found.");
    };
    let vote_type = payload.vote_type;
    let existing = db
        .votes
        .iter()
        .position(|v| v.user_id == user_id && v.feature_id == feature_id);

    match existing {
        Some(index) if db.votes[index].vote_type == vote_type => {
            db.votes.remove(index);
            Json(json!({
                "message": format!("{} removed", capitalize(vote_type.as_str())),
                "action": "removed",
                "vote_type": vote_type,
            }))
            .into_response()
        }
        Some(index) => {
            db.votes[index].vote_type = vote_type;
            Json(json!({
                "message": format!("Vote changed to {vote_type}"),
                "action": "changed",
                "vote_type": vote_type,
            }))
            .into_response()
        }
        None => {
            db.add_vote(user_id, feature_id, vote_type);
            (
                StatusCode::CREATED,
                Json(json!({
                    "message": format!("{} added", capitalize(vote_type.as_str())),
                    "action": "added",
                    "vote_type": vote_type,
                })),
            )
                .into_response()
        }
    }
}

async fn remove_vote_handler(
    State(api): State<MockApi>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> Response {
    let mut db = lock(&api.db);
    let Some(feature_id) = db.active_feature(&id).map(|f| f.id) else {
        return detail(StatusCode::NOT_FOUND, "Not found.");
    };
    let existing = db
        .votes
        .iter()
        .position(|v| v.user_id == user_id && v.feature_id == feature_id);

    match existing {
        Some(index) => {
            let vote = db.votes.remove(index);
            Json(json!({
                "message": format!("{} removed", capitalize(vote.vote_type.as_str())),
                "action": "removed",
                "vote_type": vote.vote_type,
            }))
            .into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "You have not voted on this feature" })),
        )
            .into_response(),
    }
}

async fn voters_handler(State(api): State<MockApi>, Path(id): Path<String>) -> Response {
    let db = lock(&api.db);
    let Some(record) = db.active_feature(&id) else {
        return detail(StatusCode::NOT_FOUND, "Not found.");
    };

    let votes: Vec<Vote> = db
        .votes
        .iter()
        .filter(|v| v.feature_id == record.id)
        .map(|v| Vote {
            id: v.id,
            user: db.author(v.user_id),
            feature: v.feature_id.to_string(),
            vote_type: v.vote_type,
            created_at: timestamp(&v.created_at),
        })
        .collect();
    let upvotes = votes.iter().filter(|v| v.vote_type == VoteType::Upvote).count() as i64;

    Json(FeatureVoters {
        feature_id: record.id.to_string(),
        feature_title: record.title.clone(),
        total_votes: votes.len() as i64,
        upvotes,
        downvotes: votes.len() as i64 - upvotes,
        votes,
    })
    .into_response()
}

/// The router served on a local port. Stops serving when dropped.
pub struct MockServer {
    addr: SocketAddr,
    api: MockApi,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Serve on an ephemeral localhost port.
    pub async fn start() -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0").await
    }

    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let api = MockApi::new();
        let app = create_router(api.clone());

        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                tracing::error!("mock api stopped: {e}");
            }
        });
        info!(%addr, "mock api listening");

        Ok(Self { addr, api, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL for `ApiClient`, including the `/api` prefix.
    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }
}

impl Deref for MockServer {
    type Target = MockApi;

    fn deref(&self) -> &MockApi {
        &self.api
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
