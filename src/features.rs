//! Feature coordinator: the in-memory feature list and the calls that change it.
//!
//! Creates and deletes are applied to the local list directly. Votes are not:
//! a successful vote schedules a full reload so counts always come from the
//! server. Only the most recently started load may publish its outcome; each
//! load takes a generation number and drops its result if a newer one started.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiRequest, ApiResponse};
use crate::error::ClientError;
use crate::models::{
    CreateFeatureRequest, Feature, FeatureListResponse, FeatureVoters, SortOrder, VoteReceipt,
    VoteRequest, VoteType,
};
use crate::session::Credentials;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureState {
    /// Server order, replaced wholesale by every successful load.
    pub features: Vec<Feature>,
    pub error_message: Option<String>,
    pub is_loading: bool,
    pub sort_order: SortOrder,
}

impl FeatureState {
    pub fn get(&self, feature_id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == feature_id)
    }
}

#[derive(Clone)]
pub struct FeatureCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    api: ApiClient,
    credentials: Arc<dyn Credentials>,
    state: watch::Sender<FeatureState>,
    generation: AtomicU64,
}

impl FeatureCoordinator {
    pub fn new(api: ApiClient, credentials: Arc<dyn Credentials>) -> Self {
        let (state, _) = watch::channel(FeatureState::default());
        Self {
            inner: Arc::new(Inner {
                api,
                credentials,
                state,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<FeatureState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> FeatureState {
        self.inner.state.borrow().clone()
    }

    pub fn features(&self) -> Vec<Feature> {
        self.inner.state.borrow().features.clone()
    }

    /// True only when the session says so and a token is actually present.
    pub fn is_authenticated(&self) -> bool {
        self.inner.credentials.is_authenticated() && self.inner.credentials.access_token().is_some()
    }

    /// Ordering used by subsequent loads.
    pub fn set_sort_order(&self, order: SortOrder) {
        self.inner
            .state
            .send_if_modified(|state| std::mem::replace(&mut state.sort_order, order) != order);
    }

    /// Fetches the list and replaces the local one. Starting a new load
    /// supersedes any load still in flight: the older one returns without
    /// publishing its result or its error.
    pub async fn load_features(&self) {
        let mut generation = 0;
        let mut sort_order = SortOrder::default();
        self.inner.state.send_modify(|state| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            sort_order = state.sort_order;
            state.is_loading = true;
            state.error_message = None;
        });
        debug!(generation, sort = sort_order.as_query(), "loading features");

        let result = self.fetch_features(sort_order).await;

        let applied = self.inner.state.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            state.is_loading = false;
            match &result {
                Ok(features) => state.features = features.clone(),
                Err(e) => state.error_message = Some(e.to_string()),
            }
            true
        });

        match (&result, applied) {
            (_, false) => debug!(generation, "discarding superseded load"),
            (Ok(features), true) => info!(count = features.len(), "loaded features"),
            (Err(e), true) => warn!(status = ?e.status(), "load failed: {e}"),
        }
    }

    pub async fn create_feature(&self, title: &str, description: &str) {
        self.clear_error();
        match self.post_feature(title, description).await {
            Ok(feature) => {
                info!(feature_id = %feature.id, "created feature");
                self.inner
                    .state
                    .send_modify(|state| state.features.insert(0, feature));
            }
            Err(e) => self.fail("create", e),
        }
    }

    /// Casts a vote and schedules a reload; counts are never adjusted locally.
    /// Whether a repeated vote toggles off is up to the server.
    pub async fn vote(&self, feature_id: &str, vote_type: VoteType) {
        self.clear_error();
        match self.post_vote(feature_id, vote_type).await {
            Ok(receipt) => {
                info!(feature_id, vote = %vote_type, action = ?receipt.action, "vote accepted");
                self.spawn_reload();
            }
            Err(e) => self.fail("vote", e),
        }
    }

    /// Withdraws the caller's vote, then reloads like `vote` does.
    pub async fn remove_vote(&self, feature_id: &str) {
        self.clear_error();
        let request = ApiRequest::delete(format!("feature/{feature_id}/vote/"));
        match self.send(request, &[StatusCode::OK], "Failed to remove vote").await {
            Ok(_) => {
                info!(feature_id, "vote removed");
                self.spawn_reload();
            }
            Err(e) => self.fail("remove vote", e),
        }
    }

    pub async fn delete_feature(&self, feature_id: &str) {
        self.clear_error();
        let request = ApiRequest::delete(format!("feature/{feature_id}/"));
        match self
            .send(request, &[StatusCode::NO_CONTENT], "Failed to delete feature")
            .await
        {
            Ok(_) => {
                info!(feature_id, "deleted feature");
                self.inner
                    .state
                    .send_modify(|state| state.features.retain(|f| f.id != feature_id));
            }
            Err(e) => self.fail("delete", e),
        }
    }

    /// Detail view of one feature. Leaves the list and error field alone.
    pub async fn feature(&self, feature_id: &str) -> Result<Feature, ClientError> {
        let request = ApiRequest::get(format!("feature/{feature_id}/"));
        self.send(request, &[StatusCode::OK], "Failed to load feature")
            .await?
            .json()
    }

    /// Who voted on a feature. Leaves the list and error field alone.
    pub async fn voters(&self, feature_id: &str) -> Result<FeatureVoters, ClientError> {
        let request = ApiRequest::get(format!("feature/{feature_id}/voters/"));
        self.send(request, &[StatusCode::OK], "Failed to load voters")
            .await?
            .json()
    }

    async fn fetch_features(&self, sort_order: SortOrder) -> Result<Vec<Feature>, ClientError> {
        let request = ApiRequest::get("features/").query("sort", sort_order.as_query());
        let res = self
            .send(request, &[StatusCode::OK], "Failed to load features")
            .await?;
        let list: FeatureListResponse = res.json()?;
        Ok(list.results)
    }

    async fn post_feature(&self, title: &str, description: &str) -> Result<Feature, ClientError> {
        let request = ApiRequest::post("feature/").json(&CreateFeatureRequest {
            title: title.to_string(),
            description: description.to_string(),
        })?;
        self.send(request, &[StatusCode::CREATED], "Failed to create feature")
            .await?
            .json()
    }

    async fn post_vote(&self, feature_id: &str, vote_type: VoteType) -> Result<VoteReceipt, ClientError> {
        let request =
            ApiRequest::post(format!("feature/{feature_id}/vote/")).json(&VoteRequest { vote_type })?;
        let res = self
            .send(request, &[StatusCode::OK, StatusCode::CREATED], "Failed to vote")
            .await?;
        // The body is informational only.
        Ok(res.json().unwrap_or_default())
    }

    /// Sends with the current token attached, if any, and maps any status
    /// outside `expected` to `rejection`.
    async fn send(
        &self,
        request: ApiRequest,
        expected: &[StatusCode],
        rejection: &str,
    ) -> Result<ApiResponse, ClientError> {
        let request = request.bearer(self.inner.credentials.access_token());
        let res = self.inner.api.execute(request).await?;
        if expected.contains(&res.status) {
            Ok(res)
        } else {
            Err(ClientError::rejected(res.status, rejection))
        }
    }

    /// Reload in the background; the caller does not wait for it.
    fn spawn_reload(&self) {
        let this = self.clone();
        let _reload = tokio::spawn(async move { this.load_features().await });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn fail(&self, action: &str, e: ClientError) {
        warn!(action, status = ?e.status(), "feature request failed: {e}");
        self.inner
            .state
            .send_modify(|state| state.error_message = Some(e.to_string()));
    }

    fn clear_error(&self) {
        self.inner
            .state
            .send_if_modified(|state| state.error_message.take().is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_server::{MockServer, Reply};
    use crate::session::SessionCoordinator;
    use crate::storage::MemoryStore;
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    const LIST: &str = "/api/features/";

    struct StubCredentials {
        authenticated: bool,
        token: Option<String>,
    }

    impl Credentials for StubCredentials {
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        fn access_token(&self) -> Option<String> {
            self.token.clone()
        }
    }

    struct Fixture {
        server: MockServer,
        session: SessionCoordinator,
        features: FeatureCoordinator,
        ana: i64,
        bo: i64,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await.expect("mock server");
        let ana = server.seed_user("ana", "ana@example.com", "secret");
        let bo = server.seed_user("bo", "bo@example.com", "secret");
        let api = ApiClient::new(&server.base_url()).unwrap();
        let session = SessionCoordinator::new(api.clone(), Arc::new(MemoryStore::new()));
        let features = FeatureCoordinator::new(api, Arc::new(session.clone()));
        Fixture {
            server,
            session,
            features,
            ana,
            bo,
        }
    }

    async fn wait_for_state(
        features: &FeatureCoordinator,
        matches: impl FnMut(&FeatureState) -> bool,
    ) -> FeatureState {
        let mut rx = features.subscribe();
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(matches)).await;
        let state = match outcome {
            Ok(Ok(state)) => state.clone(),
            _ => panic!("feature state never matched; last: {:?}", features.snapshot()),
        };
        state
    }

    async fn wait_for_requests(server: &MockServer, method: Method, path: &str, count: usize) {
        for _ in 0..500 {
            if server.requests_to(&method, path).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} {method} {path} requests");
    }

    fn feature_json(id: &str, title: &str) -> serde_json::Value {
        json!({
            "id": id,
            "title": title,
            "description": "scripted",
            "author": {"id": 1, "username": "ana"},
            "created_at": "2025-09-13T10:00:00Z",
            "upvote_count": 1,
            "downvote_count": 0,
            "total_score": 1,
            "user_vote": "upvote"
        })
    }

    fn ids(state: &FeatureState) -> Vec<String> {
        state.features.iter().map(|f| f.id.clone()).collect()
    }

    #[tokio::test]
    async fn test_load_without_session() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");

        fx.features.load_features().await;

        let state = fx.features.snapshot();
        assert_eq!(ids(&state), vec![id]);
        assert_eq!(state.features[0].user_vote, None);
        assert!(!state.is_loading);
        assert_eq!(state.error_message, None);

        let sent = fx.server.requests_to(&Method::GET, LIST);
        assert_eq!(sent[0].authorization, None);
        assert_eq!(sent[0].query.as_deref(), Some("sort=recent"));
    }

    #[tokio::test]
    async fn test_load_with_session_reports_user_vote() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.server.seed_vote(fx.bo, &id, VoteType::Downvote);
        fx.session.login("bo", "secret").await;

        fx.features.load_features().await;

        let state = fx.features.snapshot();
        assert_eq!(state.features[0].user_vote, Some(VoteType::Downvote));
        assert_eq!(state.features[0].total_score, -1);
        let sent = fx.server.requests_to(&Method::GET, LIST);
        assert!(sent[0].authorization.as_deref().unwrap().starts_with("Bearer access-"));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_collection() {
        let fx = fixture().await;
        fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.features.load_features().await;
        let before = fx.features.features();

        fx.server.script(Method::GET, LIST, Reply::status(StatusCode::INTERNAL_SERVER_ERROR));
        fx.features.load_features().await;

        let state = fx.features.snapshot();
        assert_eq!(state.features, before);
        assert_eq!(state.error_message.as_deref(), Some("Failed to load features"));
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_superseded_load_result_is_discarded() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.server.script(
            Method::GET,
            LIST,
            Reply::status(StatusCode::OK)
                .json(json!({ "results": [feature_json("stale", "Stale")] }))
                .after(Duration::from_millis(300)),
        );

        let first = {
            let features = fx.features.clone();
            tokio::spawn(async move { features.load_features().await })
        };
        wait_for_requests(&fx.server, Method::GET, LIST, 1).await;
        assert!(fx.features.snapshot().is_loading);

        fx.features.load_features().await;
        let after_second = fx.features.snapshot();
        first.await.unwrap();

        assert_eq!(fx.features.snapshot(), after_second);
        assert_eq!(ids(&after_second), vec![id]);
        assert!(!after_second.is_loading);
    }

    #[tokio::test]
    async fn test_superseded_load_error_is_not_reported() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.server.script(
            Method::GET,
            LIST,
            Reply::status(StatusCode::SERVICE_UNAVAILABLE).after(Duration::from_millis(300)),
        );

        let first = {
            let features = fx.features.clone();
            tokio::spawn(async move { features.load_features().await })
        };
        wait_for_requests(&fx.server, Method::GET, LIST, 1).await;
        fx.features.load_features().await;
        first.await.unwrap();

        let state = fx.features.snapshot();
        assert_eq!(state.error_message, None);
        assert_eq!(ids(&state), vec![id]);
    }

    #[tokio::test]
    async fn test_create_prepends_new_feature() {
        let fx = fixture().await;
        let existing = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.session.login("ana", "secret").await;
        fx.features.load_features().await;

        fx.server.script(
            Method::POST,
            "/api/feature/",
            Reply::status(StatusCode::CREATED).json(feature_json("42", "X")),
        );
        fx.features.create_feature("X", "Y").await;

        let state = fx.features.snapshot();
        assert_eq!(ids(&state), vec!["42".to_string(), existing]);
        assert_eq!(state.error_message, None);
    }

    #[tokio::test]
    async fn test_create_against_live_handler() {
        let fx = fixture().await;
        fx.session.login("ana", "secret").await;

        fx.features.create_feature("Export", "CSV please").await;

        let state = fx.features.snapshot();
        assert_eq!(state.features.len(), 1);
        assert_eq!(state.features[0].title, "Export");
        assert_eq!(state.features[0].description.as_deref(), Some("CSV please"));
        assert_eq!(state.features[0].upvote_count, 1);
    }

    #[tokio::test]
    async fn test_rejected_create_leaves_collection() {
        let fx = fixture().await;
        fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.session.login("ana", "secret").await;
        fx.features.load_features().await;
        let before = fx.features.features();

        fx.server.script(
            Method::POST,
            "/api/feature/",
            Reply::status(StatusCode::BAD_REQUEST).json(json!({ "title": ["Too long"] })),
        );
        fx.features.create_feature("X", "Y").await;

        let state = fx.features.snapshot();
        assert_eq!(state.features, before);
        assert_eq!(state.error_message.as_deref(), Some("Failed to create feature"));
    }

    #[tokio::test]
    async fn test_create_without_session_is_rejected() {
        let fx = fixture().await;
        fx.features.create_feature("X", "Y").await;

        let state = fx.features.snapshot();
        assert!(state.features.is_empty());
        assert_eq!(state.error_message.as_deref(), Some("Failed to create feature"));
        assert_eq!(fx.server.requests_to(&Method::POST, "/api/feature/")[0].authorization, None);
    }

    #[tokio::test]
    async fn test_vote_triggers_reload_instead_of_local_update() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.session.login("bo", "secret").await;
        fx.features.load_features().await;
        assert_eq!(fx.features.snapshot().features[0].upvote_count, 0);

        // Hold the reload long enough to look at the list before it lands.
        fx.server.script(Method::GET, LIST, Reply::delayed(Duration::from_millis(300)));
        fx.features.vote(&id, VoteType::Upvote).await;

        let pending = fx.features.snapshot();
        assert_eq!(pending.features[0].upvote_count, 0);
        assert_eq!(pending.features[0].user_vote, None);
        assert_eq!(pending.error_message, None);

        let state = wait_for_state(&fx.features, |s| {
            !s.is_loading && s.features.first().map(|f| f.upvote_count) == Some(1)
        })
        .await;
        assert_eq!(state.features[0].user_vote, Some(VoteType::Upvote));
        assert_eq!(fx.server.requests_to(&Method::GET, LIST).len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_vote_is_toggled_by_server() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.session.login("bo", "secret").await;

        fx.features.vote(&id, VoteType::Downvote).await;
        wait_for_state(&fx.features, |s| {
            s.get(&id).map(|f| f.downvote_count) == Some(1)
        })
        .await;

        fx.features.vote(&id, VoteType::Downvote).await;
        let state = wait_for_state(&fx.features, |s| {
            s.get(&id).map(|f| f.downvote_count) == Some(0)
        })
        .await;
        assert_eq!(state.get(&id).unwrap().user_vote, None);
    }

    #[tokio::test]
    async fn test_rejected_vote_sets_error_without_reload() {
        let fx = fixture().await;
        fx.session.login("bo", "secret").await;

        fx.features.vote("no-such-feature", VoteType::Upvote).await;

        assert_eq!(fx.features.snapshot().error_message.as_deref(), Some("Failed to vote"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.server.requests_to(&Method::GET, LIST).is_empty());
    }

    #[tokio::test]
    async fn test_remove_vote_reloads() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.server.seed_vote(fx.bo, &id, VoteType::Upvote);
        fx.session.login("bo", "secret").await;
        fx.features.load_features().await;
        assert_eq!(fx.features.snapshot().features[0].upvote_count, 1);

        fx.features.remove_vote(&id).await;
        let state = wait_for_state(&fx.features, |s| {
            s.get(&id).map(|f| f.upvote_count) == Some(0)
        })
        .await;
        assert_eq!(state.error_message, None);

        fx.features.remove_vote(&id).await;
        assert_eq!(
            fx.features.snapshot().error_message.as_deref(),
            Some("Failed to remove vote")
        );
    }

    #[tokio::test]
    async fn test_delete_removes_only_matching_feature() {
        let fx = fixture().await;
        let first = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        let second = fx.server.seed_feature(fx.ana, "Export", "CSV please");
        fx.session.login("ana", "secret").await;
        fx.features.load_features().await;
        assert_eq!(fx.features.snapshot().features.len(), 2);

        fx.features.delete_feature(&first).await;

        let state = fx.features.snapshot();
        assert_eq!(ids(&state), vec![second]);
        assert_eq!(state.error_message, None);
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_collection() {
        let fx = fixture().await;
        fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.session.login("ana", "secret").await;
        fx.features.load_features().await;
        let before = fx.features.features();

        fx.server.script(
            Method::DELETE,
            "/api/feature/42/",
            Reply::status(StatusCode::NOT_FOUND).json(json!({ "detail": "Not found." })),
        );
        fx.features.delete_feature("42").await;

        let state = fx.features.snapshot();
        assert_eq!(state.features, before);
        assert_eq!(state.error_message.as_deref(), Some("Failed to delete feature"));
    }

    #[tokio::test]
    async fn test_is_authenticated_needs_flag_and_token() {
        let api = ApiClient::new("http://127.0.0.1:9/api").unwrap();
        let cases = [
            (false, None, false),
            (true, None, false),
            (false, Some("t"), false),
            (true, Some("t"), true),
        ];
        for (authenticated, token, expected) in cases {
            let credentials = StubCredentials {
                authenticated,
                token: token.map(str::to_string),
            };
            let features = FeatureCoordinator::new(api.clone(), Arc::new(credentials));
            assert_eq!(features.is_authenticated(), expected, "{authenticated} {token:?}");
        }

        let fx = fixture().await;
        assert!(!fx.features.is_authenticated());
        fx.session.login("ana", "secret").await;
        assert!(fx.features.is_authenticated());
        fx.session.logout();
        assert!(!fx.features.is_authenticated());
    }

    #[tokio::test]
    async fn test_score_sort_is_requested() {
        let fx = fixture().await;
        let older = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        let newer = fx.server.seed_feature(fx.ana, "Export", "CSV please");
        fx.server.seed_vote(fx.bo, &older, VoteType::Upvote);

        fx.features.load_features().await;
        assert_eq!(ids(&fx.features.snapshot()), vec![newer.clone(), older.clone()]);

        fx.features.set_sort_order(SortOrder::Score);
        fx.features.load_features().await;
        assert_eq!(ids(&fx.features.snapshot()), vec![older, newer]);

        let sent = fx.server.requests_to(&Method::GET, LIST);
        assert_eq!(sent[1].query.as_deref(), Some("sort=score"));
    }

    #[tokio::test]
    async fn test_detail_and_voters_leave_state_alone() {
        let fx = fixture().await;
        let id = fx.server.seed_feature(fx.ana, "Dark mode", "Easier at night");
        fx.server.seed_vote(fx.ana, &id, VoteType::Upvote);
        fx.server.seed_vote(fx.bo, &id, VoteType::Downvote);

        let feature = fx.features.feature(&id).await.unwrap();
        assert_eq!(feature.description.as_deref(), Some("Easier at night"));
        assert_eq!(feature.total_score, 0);

        let voters = fx.features.voters(&id).await.unwrap();
        assert_eq!(voters.feature_title, "Dark mode");
        assert_eq!((voters.total_votes, voters.upvotes, voters.downvotes), (2, 1, 1));
        assert_eq!(voters.votes.len(), 2);

        let missing = fx.features.voters("nope").await.unwrap_err();
        assert_eq!(missing.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(missing.to_string(), "Failed to load voters");
        assert_eq!(fx.features.snapshot(), FeatureState::default());
    }
}
