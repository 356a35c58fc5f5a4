//! Bootstrap signal channels.
//!
//! A channel is a one-shot rendezvous between the orchestrator and the
//! bootstrap script of a freshly launched instance. It starts `Pending` and
//! accepts exactly one terminal transition: the first of an external report
//! or the timeout wins, and everyone waiting sees that same result.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use optimus_core::{ChannelId, Error, Result};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Terminal status a bootstrap script can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Success,
    Failure,
}

/// Details sent along with a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub reason: Option<String>,
    pub unique_id: Option<String>,
    pub data: Option<String>,
}

/// How a channel ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Success(SignalPayload),
    Failure(SignalPayload),
    TimedOut,
}

impl Resolution {
    pub fn state(&self) -> ChannelState {
        match self {
            Resolution::Success(_) => ChannelState::Success,
            Resolution::Failure(_) => ChannelState::Failure,
            Resolution::TimedOut => ChannelState::TimedOut,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Resolution::Success(_))
    }

    pub fn payload(&self) -> Option<&SignalPayload> {
        match self {
            Resolution::Success(p) | Resolution::Failure(p) => Some(p),
            Resolution::TimedOut => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Pending,
    Success,
    Failure,
    TimedOut,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Pending => write!(f, "pending"),
            ChannelState::Success => write!(f, "success"),
            ChannelState::Failure => write!(f, "failure"),
            ChannelState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Body a bootstrap script `PUT`s to its callback URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallbackBody {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl CallbackBody {
    pub fn new(status: SignalStatus, payload: SignalPayload) -> Self {
        Self {
            status: match status {
                SignalStatus::Success => "SUCCESS".to_string(),
                SignalStatus::Failure => "FAILURE".to_string(),
            },
            reason: payload.reason,
            unique_id: payload.unique_id,
            data: payload.data,
        }
    }

    /// Terminal status and payload, or `None` for a non-terminal status.
    pub fn into_report(self) -> Option<(SignalStatus, SignalPayload)> {
        let status = match self.status.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => SignalStatus::Success,
            "FAILURE" => SignalStatus::Failure,
            _ => return None,
        };
        Some((
            status,
            SignalPayload {
                reason: self.reason,
                unique_id: self.unique_id,
                data: self.data,
            },
        ))
    }
}

/// A single-use signal channel.
#[derive(Debug)]
pub struct SignalChannel {
    id: ChannelId,
    node_id: String,
    created_at: DateTime<Utc>,
    timeout: Duration,
    deadline: Instant,
    tx: watch::Sender<Option<Resolution>>,
}

impl SignalChannel {
    /// Create a pending channel whose timeout starts now.
    pub fn new(node_id: impl Into<String>, timeout: Duration) -> Self {
        Self::with_id(ChannelId::new(), node_id, timeout)
    }

    /// Create a pending channel under an existing id.
    pub fn with_id(id: ChannelId, node_id: impl Into<String>, timeout: Duration) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            id,
            node_id: node_id.into(),
            created_at: Utc::now(),
            timeout,
            deadline: Instant::now() + timeout,
            tx,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Gate node this channel belongs to.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> ChannelState {
        self.tx
            .borrow()
            .as_ref()
            .map(Resolution::state)
            .unwrap_or(ChannelState::Pending)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.tx.borrow().clone()
    }

    /// Record the bootstrap script's terminal report.
    ///
    /// Fails with [`Error::AlreadyResolved`] once the channel is terminal,
    /// including when the report arrives after the deadline.
    pub fn report(&self, status: SignalStatus, payload: SignalPayload) -> Result<()> {
        if Instant::now() >= self.deadline {
            self.resolve(Resolution::TimedOut);
            return Err(Error::AlreadyResolved(self.id.to_string()));
        }
        let resolution = match status {
            SignalStatus::Success => Resolution::Success(payload),
            SignalStatus::Failure => Resolution::Failure(payload),
        };
        if self.resolve(resolution) {
            info!(channel = %self.id, node = %self.node_id, state = %self.state(), "Signal received");
            Ok(())
        } else {
            Err(Error::AlreadyResolved(self.id.to_string()))
        }
    }

    /// Force a pending channel to `TimedOut`. Returns whether this call made the transition.
    pub fn cancel(&self) -> bool {
        let changed = self.resolve(Resolution::TimedOut);
        if changed {
            info!(channel = %self.id, node = %self.node_id, "Signal wait cancelled");
        }
        changed
    }

    /// Wait until the channel is terminal or its deadline passes.
    pub async fn wait(&self) -> Resolution {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout_at(self.deadline, async {
            rx.wait_for(Option::is_some).await.map(|r| (*r).clone())
        })
        .await;

        match waited {
            Ok(Ok(Some(resolution))) => resolution,
            _ => {
                if self.resolve(Resolution::TimedOut) {
                    warn!(
                        channel = %self.id,
                        node = %self.node_id,
                        timeout_secs = self.timeout.as_secs(),
                        "Signal timed out"
                    );
                }
                // A report may have won the race against the deadline.
                self.resolution().unwrap_or(Resolution::TimedOut)
            }
        }
    }

    /// The single compare-and-set every terminal transition goes through.
    fn resolve(&self, resolution: Resolution) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(resolution);
            true
        })
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let resolution = self.resolution();
        ChannelSnapshot {
            id: self.id,
            node_id: self.node_id.clone(),
            state: self.state(),
            payload: resolution.as_ref().and_then(|r| r.payload().cloned()),
            created_at: self.created_at,
            timeout_secs: self.timeout.as_secs(),
        }
    }
}

/// Serializable view of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub node_id: String,
    pub state: ChannelState,
    pub payload: Option<SignalPayload>,
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

/// Registry of the live channels of a stack.
///
/// Callback URLs carry an HMAC-SHA256 token of the channel id so that only
/// the holder of the URL can report.
pub struct SignalRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<SignalChannel>>>,
    secret: Vec<u8>,
    base_url: String,
}

impl SignalRegistry {
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a pending channel for a gate node.
    ///
    /// An older channel for the same node is timed out and dropped.
    pub async fn create(&self, node_id: &str, timeout: Duration) -> Arc<SignalChannel> {
        let channel = Arc::new(SignalChannel::new(node_id, timeout));
        let mut channels = self.channels.write().await;
        channels.retain(|_, existing| {
            if existing.node_id() == node_id {
                existing.cancel();
                false
            } else {
                true
            }
        });
        channels.insert(channel.id(), channel.clone());
        debug!(channel = %channel.id(), node = %node_id, timeout_secs = timeout.as_secs(), "Signal channel created");
        channel
    }

    /// Open a pending channel for a gate node, keeping the id of an earlier
    /// channel for the same node.
    ///
    /// The callback URL of a re-armed channel is the one the node's instance
    /// was launched with, so a retried run can still be reported to. The
    /// earlier channel is timed out and replaced.
    pub async fn rearm(&self, node_id: &str, timeout: Duration) -> Arc<SignalChannel> {
        let mut channels = self.channels.write().await;
        let previous = channels
            .values()
            .find(|c| c.node_id() == node_id)
            .map(|c| c.id());
        let Some(id) = previous else {
            drop(channels);
            return self.create(node_id, timeout).await;
        };
        if let Some(old) = channels.remove(&id) {
            old.cancel();
        }
        let channel = Arc::new(SignalChannel::with_id(id, node_id, timeout));
        channels.insert(id, channel.clone());
        debug!(channel = %id, node = %node_id, timeout_secs = timeout.as_secs(), "Signal channel re-armed");
        channel
    }

    pub async fn get(&self, id: ChannelId) -> Option<Arc<SignalChannel>> {
        self.channels.read().await.get(&id).cloned()
    }

    pub async fn by_node(&self, node_id: &str) -> Option<Arc<SignalChannel>> {
        self.channels
            .read()
            .await
            .values()
            .find(|c| c.node_id() == node_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<ChannelSnapshot> {
        let mut out: Vec<ChannelSnapshot> = self
            .channels
            .read()
            .await
            .values()
            .map(|c| c.snapshot())
            .collect();
        out.sort_by_key(|c| c.created_at);
        out
    }

    pub async fn report(
        &self,
        id: ChannelId,
        status: SignalStatus,
        payload: SignalPayload,
    ) -> Result<()> {
        let channel = self
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("signal channel {}", id)))?;
        channel.report(status, payload)
    }

    pub async fn wait(&self, id: ChannelId) -> Result<Resolution> {
        let channel = self
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("signal channel {}", id)))?;
        Ok(channel.wait().await)
    }

    /// Time out every pending channel. Returns how many were still pending.
    pub async fn cancel_all(&self) -> usize {
        self.channels
            .read()
            .await
            .values()
            .filter(|c| c.cancel())
            .count()
    }

    /// Drop every channel.
    pub async fn clear(&self) {
        self.channels.write().await.clear();
    }

    /// Hex HMAC token for a channel id.
    pub fn token(&self, id: ChannelId) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("invalid callback secret: {}", e)))?;
        mac.update(id.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a callback token.
    pub fn verify_token(&self, id: ChannelId, token: &str) -> bool {
        let Ok(expected) = hex::decode(token) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(id.to_string().as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// URL the bootstrap script reports to.
    pub fn callback_url(&self, id: ChannelId) -> Result<String> {
        Ok(format!("{}/signals/{}/{}", self.base_url, id, self.token(id)?))
    }
}
