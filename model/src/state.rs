//! Live application state shared between the worker and the API.
//!
//! The worker writes the latest scores, narratives and incidents here, and every connected
//! stream subscriber is notified of new scores and narratives.

use crate::{db::Connection, feeds::Source};
use anyhow::Error;
use async_std::{
    channel::{unbounded, Receiver, Sender},
    sync::{Arc, Mutex, RwLock},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use strum::{Display, EnumString};

/// The maximum number of narratives kept in memory.
pub const MAX_NARRATIVES: usize = 50;

/// The maximum number of incidents kept in memory.
pub const MAX_INCIDENTS: usize = 100;

/// Statistics for one tracked series.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Score {
    pub name: String,
    pub score: f64,
    pub velocity: f64,
    pub trust: f64,
    /// When this score was computed, in unix seconds.
    pub ts: f64,
}

/// A headline picked up from one of the news feeds.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Narrative {
    pub title: String,
    pub source: Source,
    pub t: f64,
}

/// The kinds of problems recorded while polling.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, EnumString, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IncidentKind {
    /// An upstream feed could not be fetched or decoded.
    FetchError,
    /// A polling cycle failed after fetching.
    LoopError,
}

/// A problem recorded while polling.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Incident {
    pub kind: IncidentKind,
    pub message: String,
    pub t: f64,
}

/// A message pushed to stream subscribers.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Update {
    Scores { scores: Vec<Score> },
    Narratives { narratives: Vec<Narrative> },
}

/// The current time in unix seconds.
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Default)]
struct Snapshot {
    scores: Vec<Score>,
    narratives: VecDeque<Narrative>,
    incidents: VecDeque<Incident>,
}

#[derive(Debug)]
struct Inner {
    started_at: Instant,
    snapshot: RwLock<Snapshot>,
    clients: Mutex<Vec<Sender<Update>>>,
}

/// Handle to the shared state.
///
/// Cloning the handle is cheap; all clones refer to the same state.
#[derive(Clone, Debug)]
pub struct State(Arc<Inner>);

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Create empty state.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            started_at: Instant::now(),
            snapshot: Default::default(),
            clients: Default::default(),
        }))
    }

    /// Create state pre-populated with the most recent data persisted in the database.
    pub async fn hydrate(conn: &Connection) -> Result<Self, Error> {
        let scores = conn.latest_scores().await?;
        let narratives = conn.recent_narratives(MAX_NARRATIVES).await?;
        let incidents = conn.recent_incidents(MAX_INCIDENTS).await?;
        tracing::info!(
            scores = scores.len(),
            narratives = narratives.len(),
            incidents = incidents.len(),
            "restored state from database"
        );

        let state = Self::new();
        {
            let mut snapshot = state.0.snapshot.write().await;
            snapshot.scores = scores;
            snapshot.narratives = narratives.into();
            snapshot.incidents = incidents.into();
        }
        Ok(state)
    }

    /// Time elapsed since this state was created.
    pub fn uptime(&self) -> Duration {
        self.0.started_at.elapsed()
    }

    /// The latest scores, highest first.
    pub async fn scores(&self) -> Vec<Score> {
        self.0.snapshot.read().await.scores.clone()
    }

    /// Up to `limit` of the most recent narratives, oldest first.
    pub async fn narratives(&self, limit: usize) -> Vec<Narrative> {
        last(&self.0.snapshot.read().await.narratives, limit)
    }

    /// Up to `limit` of the most recent incidents, oldest first.
    pub async fn incidents(&self, limit: usize) -> Vec<Incident> {
        last(&self.0.snapshot.read().await.incidents, limit)
    }

    /// Replace the latest scores and notify subscribers.
    pub async fn push_scores(&self, scores: Vec<Score>) {
        self.0.snapshot.write().await.scores = scores.clone();
        self.broadcast(Update::Scores { scores }).await;
    }

    /// Append new narratives and notify subscribers of the full retained list.
    pub async fn push_narratives(&self, narratives: impl IntoIterator<Item = Narrative>) {
        let narratives = {
            let mut snapshot = self.0.snapshot.write().await;
            snapshot.narratives.extend(narratives);
            truncate_front(&mut snapshot.narratives, MAX_NARRATIVES);
            snapshot.narratives.iter().cloned().collect()
        };
        self.broadcast(Update::Narratives { narratives }).await;
    }

    /// Record an incident in memory. Incidents are not broadcast.
    pub async fn push_incident(&self, incident: Incident) {
        let mut snapshot = self.0.snapshot.write().await;
        snapshot.incidents.push_back(incident);
        truncate_front(&mut snapshot.incidents, MAX_INCIDENTS);
    }

    /// Register a new subscriber.
    ///
    /// The returned receiver gets every subsequent [`Update`]. Dropping it unsubscribes.
    pub async fn subscribe(&self) -> Receiver<Update> {
        let (tx, rx) = unbounded();
        self.0.clients.lock().await.push(tx);
        rx
    }

    /// The number of live subscribers.
    pub async fn subscribers(&self) -> usize {
        self.0.clients.lock().await.len()
    }

    async fn broadcast(&self, update: Update) {
        let mut clients = self.0.clients.lock().await;
        let before = clients.len();
        clients.retain(|client| client.try_send(update.clone()).is_ok());
        if clients.len() < before {
            tracing::debug!("dropped {} disconnected subscribers", before - clients.len());
        }
    }
}

fn last<T: Clone>(items: &VecDeque<T>, limit: usize) -> Vec<T> {
    items
        .iter()
        .skip(items.len().saturating_sub(limit))
        .cloned()
        .collect()
}

fn truncate_front<T>(items: &mut VecDeque<T>, max: usize) {
    while items.len() > max {
        items.pop_front();
    }
}
