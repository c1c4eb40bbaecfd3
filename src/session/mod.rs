//! Encrypted cookie session.
//!
//! A [`Session`] is created for every request, fed with the request's
//! session cookies through [`Session::initialize_all`], handed to the
//! handler, and finally turned into `Set-Cookie` headers by
//! [`Session::commit`].
//!
//! The handle is cheap to clone; all clones share one record and one
//! commit.

pub mod cookie;
pub mod document;
pub mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::gate::Deferred;

pub use cookie::CookieAttributes;
pub use document::{Document, Timestamp};
pub use state::{
    AcceptedCookie, Candidate, CandidateOutcome, CommitOutcome, IssuedCookie, SessionPhase,
    SessionState,
};

/// Shared handle to one request's session record
#[derive(Clone)]
pub struct Session {
    config: Arc<SessionConfig>,
    state: Arc<Mutex<SessionState>>,
    committed: Arc<Deferred<Result<CommitOutcome>>>,
}

impl Session {
    pub fn new(config: Arc<SessionConfig>) -> Self {
        let state = SessionState::new(config.clone(), Utc::now());
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
            committed: Arc::new(Deferred::new()),
        }
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    /// Decode one candidate cookie and merge it if it is the newest valid
    /// one. Failures never propagate; the cookie is scheduled for deletion.
    pub async fn initialize(&self, key_id: &str, cookie_value: &str) -> CandidateOutcome {
        self.lock().begin_candidate();

        let decoded = self.decode_candidate(key_id, cookie_value).await;
        let outcome = self.lock().complete_candidate(key_id, decoded, Utc::now());

        match &outcome {
            CandidateOutcome::Adopted => debug!(key_id, "session cookie accepted"),
            CandidateOutcome::Superseded => debug!(key_id, "session cookie superseded by a newer one"),
            CandidateOutcome::Rejected(err @ SessionError::ReplayDetected { .. }) => {
                warn!(key_id, error = %err, "rejected replayed session cookie")
            }
            CandidateOutcome::Rejected(err) if err.is_candidate_error() => {
                debug!(key_id, error = %err, "rejected session cookie")
            }
            CandidateOutcome::Rejected(err) => warn!(key_id, error = %err, "session cookie lookup failed"),
        }
        outcome
    }

    /// Initialize from every candidate concurrently and wait for all of them.
    pub async fn initialize_all<I, K, V>(&self, candidates: I) -> Vec<CandidateOutcome>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let candidates: Vec<(K, V)> = candidates.into_iter().collect();
        join_all(
            candidates
                .iter()
                .map(|(key_id, value)| self.initialize(key_id.as_ref(), value.as_ref())),
        )
        .await
    }

    async fn decode_candidate(&self, key_id: &str, cookie_value: &str) -> Result<Candidate> {
        let key = self.config.key_manager().key_by_id(key_id).await?;
        let envelope = cookie::decode_value(cookie_value)?;
        let plaintext = self.config.decipher().decrypt(&key.value, &envelope).await?;
        Ok(Candidate { id: key_id.to_string(), seq: key.seq, plaintext })
    }

    /// Compute the `Set-Cookie` headers for this session.
    ///
    /// A new cookie is issued, always under the current key, when the
    /// public fields changed or a refresh is due. The work runs once per
    /// session: later calls, from any clone, get the same outcome, failures
    /// included.
    pub async fn commit(&self) -> Result<CommitOutcome> {
        let config = self.config.clone();
        let state = self.state.clone();
        self.committed.get_or_start(move || commit_once(config, state)).await
    }

    /// Outcome of the commit if it has completed.
    pub fn commit_outcome(&self) -> Option<Result<CommitOutcome>> {
        self.committed.peek()
    }

    pub fn is_commit_started(&self) -> bool {
        self.committed.is_started()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_value(key)
            .map(|value| serde_json::from_value(value).map_err(|e| SessionError::Document(e.to_string())))
            .transpose()
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.lock().fields().get(key).cloned()
    }

    /// Set a public field, returning the previous value.
    pub fn insert<T: Serialize>(&self, key: impl Into<String>, value: T) -> Result<Option<Value>> {
        let value = serde_json::to_value(value).map_err(|e| SessionError::Document(e.to_string()))?;
        self.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().fields_mut().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().fields().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().fields().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().fields().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().fields().is_empty()
    }

    pub fn clear(&self) {
        self.lock().fields_mut().clear();
    }

    /// Snapshot of the public fields.
    pub fn fields(&self) -> Document {
        self.lock().fields().clone()
    }

    pub fn cookie(&self) -> CookieAttributes {
        self.lock().cookie().clone()
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.lock().cookie().expires
    }

    pub fn max_age(&self) -> TimeDelta {
        self.lock().cookie().max_age()
    }

    pub fn set_max_age(&self, age: TimeDelta) {
        self.lock().cookie_mut().set_max_age(age);
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase()
    }

    pub fn is_modified(&self) -> bool {
        self.lock().is_modified()
    }

    /// Id of the cookie the session was loaded from.
    pub fn accepted_key_id(&self) -> Option<String> {
        self.lock().old().map(|old| old.id.clone())
    }

    pub fn pending_removals(&self) -> Vec<String> {
        self.lock().pending_removals().to_vec()
    }

    pub fn save(&self) {
        self.lock().save();
    }

    pub fn destroy(&self) {
        self.lock().destroy();
    }

    pub fn reload(&self) -> Result<()> {
        self.lock().reload()
    }

    pub fn regenerate(&self) {
        self.lock().regenerate(Utc::now());
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn commit_once(
    config: Arc<SessionConfig>,
    state: Arc<Mutex<SessionState>>,
) -> Result<CommitOutcome> {
    let abort = |err: SessionError| {
        lock(&state).abort_commit();
        warn!(error = %err, "session commit failed");
        err.into_commit()
    };

    let prepared = lock(&state).begin_commit();
    let plaintext = prepared.map_err(abort)?;

    let issued = match plaintext {
        Some(plaintext) => Some(seal(&config, &state, &plaintext).await.map_err(abort)?),
        None => None,
    };

    let outcome = lock(&state).finish_commit(issued);
    debug!(
        issued = outcome.issued.as_ref().map(|c| c.key_id.as_str()),
        removed = outcome.removed.len(),
        "session committed"
    );
    Ok(outcome)
}

async fn seal(
    config: &SessionConfig,
    state: &Mutex<SessionState>,
    plaintext: &[u8],
) -> Result<IssuedCookie> {
    let key = config.key_manager().current_key().await?;
    let envelope = config.cipher().encrypt(&key.value, plaintext).await?;
    Ok(IssuedCookie {
        key_id: key.id.clone(),
        value: cookie::encode_value(&envelope),
        expires: lock(state).cookie().expires,
    })
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Session")
            .field("name", &self.config.name)
            .field("phase", &state.phase())
            .field("fields", &state.fields().len())
            .finish()
    }
}
