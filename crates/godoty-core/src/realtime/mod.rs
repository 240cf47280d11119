//! Push-based row change notifications.
//!
//! This module provides the `RealtimeChannel` abstraction and its websocket
//! implementation, `PhoenixChannel`.
//!
//! # Design
//!
//! `subscribe()` opens one channel and hands back an mpsc receiver of row
//! changes. The channel lives until the receiver is dropped, at which point
//! the implementation leaves the topic and closes its connection.

mod phoenix;

pub use phoenix::PhoenixChannel;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::client::BUDGET_TABLE;

/// Channel name used for the balance subscription
const CREDITS_CHANNEL: &str = "user-credits";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RealtimeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// What to listen to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Row filter, e.g. `user_id=eq.<id>`
    pub filter: String,
    pub access_token: String,
}

impl ChannelSpec {
    /// Changes to one user's row of the raw budget table.
    pub fn user_budget(user_id: &str, access_token: &str) -> Self {
        Self {
            name: CREDITS_CHANNEL.to_string(),
            schema: "public".to_string(),
            table: BUDGET_TABLE.to_string(),
            filter: format!("user_id=eq.{}", user_id),
            access_token: access_token.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub kind: ChangeKind,
    /// The row after the change; absent for deletes
    pub new_record: Option<Value>,
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Open a channel. Changes are delivered until the receiver is dropped.
    async fn subscribe(&self, spec: ChannelSpec) -> Result<mpsc::Receiver<RowChange>, RealtimeError>;
}
