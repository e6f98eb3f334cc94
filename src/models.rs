//! Wire types for the feature-voting API.
//!
//! Field names follow the backend's snake_case JSON. Everything here is a
//! plain value: coordinators own the state, these types only carry it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub date_joined: String,
}

/// Bearer credentials returned by register/login.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access: String,
    pub refresh: String,
}

/// Success payload of both `auth/register/` (201) and `auth/login/` (200).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthResponse {
    pub message: String,
    pub user: User,
    pub tokens: AuthTokens,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub id: i64,
    pub username: String,
}

/// A proposed feature as reported by the server.
///
/// `total_score` is computed server-side and never derived locally.
/// `description` is absent from some list payloads; `user_vote` is only
/// present when the request carried a bearer token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub upvote_count: i64,
    pub downvote_count: i64,
    pub total_score: i64,
    pub author: Author,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub user_vote: Option<VoteType>,
}

impl Feature {
    pub fn created_by(&self) -> &str {
        &self.author.username
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FeatureListResponse {
    pub results: Vec<Feature>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateFeatureRequest {
    pub title: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Upvote,
    Downvote,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Upvote => "upvote",
            VoteType::Downvote => "downvote",
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upvote" | "up" => Ok(VoteType::Upvote),
            "downvote" | "down" => Ok(VoteType::Downvote),
            other => Err(format!("vote type must be 'upvote' or 'downvote', got '{other}'")),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VoteRequest {
    pub vote_type: VoteType,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoteAction {
    Added,
    Changed,
    Removed,
}

/// Body of a vote response. The client never depends on it; it is decoded
/// on a best-effort basis for logging.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VoteReceipt {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action: Option<VoteAction>,
    #[serde(default)]
    pub vote_type: Option<VoteType>,
}

/// One vote as listed by `feature/{id}/voters/`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Vote {
    pub id: i64,
    pub user: Author,
    pub feature: String,
    pub vote_type: VoteType,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureVoters {
    pub feature_id: String,
    pub feature_title: String,
    pub votes: Vec<Vote>,
    pub total_votes: i64,
    pub upvotes: i64,
    pub downvotes: i64,
}

/// Ordering requested from `features/` through the `sort` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Recent,
    Score,
}

impl SortOrder {
    pub fn as_query(&self) -> &'static str {
        match self {
            SortOrder::Recent => "recent",
            SortOrder::Score => "score",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent" => Ok(SortOrder::Recent),
            "score" => Ok(SortOrder::Score),
            other => Err(format!("sort must be 'recent' or 'score', got '{other}'")),
        }
    }
}
