//! featurevote: client for the feature-voting service
//!
//! Two coordinators make up the data layer:
//! - `SessionCoordinator`: login/register/logout, tokens persisted through a
//!   key-value store (sled on disk, or in memory).
//! - `FeatureCoordinator`: the feature list with create/vote/delete; votes
//!   trigger a full reload instead of editing counts locally.
//!
//! Both publish their state on `tokio::sync::watch` channels for whatever
//! front end observes them (the bundled CLI is one).

pub mod api;
pub mod config;
pub mod error;
pub mod features;
pub mod logging;
// In-memory Axum server speaking the same API, for tests and local runs
pub mod mock_server;
pub mod models;
pub mod session;
pub mod storage;

pub use api::ApiClient;
pub use error::{ClientError, StorageError, ValidationError};
pub use features::{FeatureCoordinator, FeatureState};
pub use session::{Credentials, SessionCoordinator, SessionState};
