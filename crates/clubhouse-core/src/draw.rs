//! Uniform random draws over qualifying posts.
//!
//! Fetching candidates is I/O-bound and happens once per draw; selection is a
//! pure step over the captured pool, so rerolls reuse the pool without refetching.

use crate::error::ClubhouseError;
use crate::types::{Candidate, ChannelId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

/// Message history source for draws.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    /// Messages in `channel` created strictly after `after` (or the most recent
    /// `limit` messages when `after` is `None`), newest first, at most `limit`.
    async fn fetch_candidates(
        &self,
        channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candidate>, ClubhouseError>;
}

/// Draw configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawConfig {
    /// Channel whose posts enter the draw
    pub channel_id: ChannelId,

    /// History scan cap per draw
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,

    /// Draw sessions kept available for rerolls
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
}

fn default_history_cap() -> usize {
    500
}

fn default_session_capacity() -> usize {
    64
}

impl DrawConfig {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            history_cap: default_history_cap(),
            session_capacity: default_session_capacity(),
        }
    }
}

/// Pick one candidate uniformly at random.
pub fn select_winner<'a, R: Rng + ?Sized>(
    pool: &'a [Candidate],
    rng: &mut R,
) -> Result<&'a Candidate, ClubhouseError> {
    pool.choose(rng).ok_or(ClubhouseError::NoEligibleEntries)
}

/// Process-wide boundary of already-considered posts. Never moves backwards.
#[derive(Debug, Default)]
pub struct DrawWatermark {
    value: Mutex<Option<DateTime<Utc>>>,
}

impl DrawWatermark {
    pub fn get(&self) -> Option<DateTime<Utc>> {
        *lock(&self.value)
    }

    /// Move the watermark to `to` unless it is already later; returns the result.
    pub fn advance(&self, to: DateTime<Utc>) -> DateTime<Utc> {
        let mut guard = lock(&self.value);
        let next = match *guard {
            Some(current) if current >= to => current,
            _ => to,
        };
        *guard = Some(next);
        next
    }
}

/// One draw interaction: its prize, captured pool, and every winner picked so far.
#[derive(Debug, Clone, Serialize)]
pub struct DrawSession {
    pub session_id: String,
    pub prize: String,
    pub channel_id: ChannelId,
    #[serde(skip)]
    pub pool: Arc<Vec<Candidate>>,
    pub origin_watermark: Option<DateTime<Utc>>,
    pub winners: Vec<Candidate>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawOutcome {
    pub session_id: String,
    pub prize: String,
    pub winner: Candidate,
    pub watermark: DateTime<Utc>,
    pub pool_size: usize,
    pub reroll: bool,
}

pub struct DrawEngine {
    provider: Arc<dyn CandidateProvider>,
    config: DrawConfig,
    watermark: DrawWatermark,
    sessions: Mutex<VecDeque<DrawSession>>,
    rng: Mutex<StdRng>,
}

impl DrawEngine {
    pub fn new(provider: Arc<dyn CandidateProvider>, config: DrawConfig) -> Self {
        Self::with_rng(provider, config, StdRng::from_entropy())
    }

    /// Deterministic engine for tests and replays.
    pub fn with_seed(provider: Arc<dyn CandidateProvider>, config: DrawConfig, seed: u64) -> Self {
        Self::with_rng(provider, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(provider: Arc<dyn CandidateProvider>, config: DrawConfig, rng: StdRng) -> Self {
        Self {
            provider,
            config,
            watermark: DrawWatermark::default(),
            sessions: Mutex::new(VecDeque::new()),
            rng: Mutex::new(rng),
        }
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark.get()
    }

    pub fn session(&self, session_id: &str) -> Option<DrawSession> {
        lock(&self.sessions)
            .iter()
            .find(|session| session.session_id == session_id)
            .cloned()
    }

    /// Fetch eligible posts after the watermark, pick a winner, and open a session.
    pub async fn draw(&self, prize: impl Into<String>) -> Result<DrawOutcome, ClubhouseError> {
        let prize = prize.into();
        let origin = self.watermark.get();
        let fetched = self
            .provider
            .fetch_candidates(self.config.channel_id, origin, self.config.history_cap)
            .await?;

        let pool: Vec<Candidate> = fetched
            .into_iter()
            .filter(|candidate| candidate.eligible)
            .filter(|candidate| origin.map_or(true, |mark| candidate.created_at > mark))
            .collect();

        let winner = {
            let mut rng = lock(&self.rng);
            select_winner(&pool, &mut *rng)?.clone()
        };
        let watermark = self.watermark.advance(winner.created_at);
        let pool_size = pool.len();

        let session = DrawSession {
            session_id: Uuid::new_v4().to_string(),
            prize: prize.clone(),
            channel_id: self.config.channel_id,
            pool: Arc::new(pool),
            origin_watermark: origin,
            winners: vec![winner.clone()],
            created_at: Utc::now(),
        };
        let session_id = session.session_id.clone();
        self.store_session(session);

        info!(
            session_id = %session_id,
            winner = %winner.author,
            pool_size,
            "draw completed"
        );

        Ok(DrawOutcome {
            session_id,
            prize,
            winner,
            watermark,
            pool_size,
            reroll: false,
        })
    }

    /// Re-sample the pool captured by `session_id`. The previous winner may win again.
    pub fn reroll(&self, session_id: &str) -> Result<DrawOutcome, ClubhouseError> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .iter_mut()
            .find(|session| session.session_id == session_id)
            .ok_or_else(|| ClubhouseError::UnknownDrawSession(session_id.to_string()))?;

        let winner = {
            let mut rng = lock(&self.rng);
            select_winner(&session.pool, &mut *rng)?.clone()
        };
        session.winners.push(winner.clone());
        let watermark = self.watermark.advance(winner.created_at);

        info!(
            session_id = %session_id,
            winner = %winner.author,
            rerolls = session.winners.len() - 1,
            "draw rerolled"
        );

        Ok(DrawOutcome {
            session_id: session.session_id.clone(),
            prize: session.prize.clone(),
            winner,
            watermark,
            pool_size: session.pool.len(),
            reroll: true,
        })
    }

    fn store_session(&self, session: DrawSession) {
        let mut sessions = lock(&self.sessions);
        sessions.push_back(session);
        while sessions.len() > self.config.session_capacity.max(1) {
            sessions.pop_front();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
