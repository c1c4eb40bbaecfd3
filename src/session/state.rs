//! Per-request session record and the transitions applied to it.
//!
//! All methods here are synchronous and take the current instant as an
//! argument; the async key and cipher work is done by [`super::Session`]
//! between calls, never while the record is locked.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::cookie::{deletion_header, CookieAttributes};
use super::document::{self, Document, Timestamp, EXPIRY_FIELD};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};

/// Lifecycle of a session record within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    /// Candidate cookies are still being decoded
    Initializing,
    Ready,
    /// Public fields differ from the accepted cookie
    Modified,
    Committing,
    Committed,
}

/// What happened to one candidate cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// The candidate now backs the session
    Adopted,
    /// A newer cookie was already accepted; the candidate is scheduled for removal
    Superseded,
    /// The candidate could not be used and is scheduled for removal
    Rejected(SessionError),
}

impl CandidateOutcome {
    pub fn is_adopted(&self) -> bool {
        matches!(self, CandidateOutcome::Adopted)
    }
}

/// Cookie the current record was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCookie {
    pub id: String,
    /// Canonical serialization of the payload without `exp`
    pub data: Vec<u8>,
    pub seq: Option<u64>,
    pub expires: Option<DateTime<Utc>>,
}

/// A decrypted candidate cookie.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub seq: u64,
    pub plaintext: Vec<u8>,
}

/// Cookie produced by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCookie {
    pub key_id: String,
    /// Encoded envelope
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

/// Result of committing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub issued: Option<IssuedCookie>,
    /// Ids the client is told to delete
    pub removed: Vec<String>,
    /// `Set-Cookie` values, the issued cookie first
    pub set_cookies: Vec<String>,
}

pub struct SessionState {
    config: Arc<SessionConfig>,
    fields: Document,
    old: Option<AcceptedCookie>,
    require_refresh: bool,
    /// A new timestamped session is issued even when empty
    establish: bool,
    remove: Vec<String>,
    cookie: CookieAttributes,
    phase: SessionPhase,
    pending: usize,
}

impl SessionState {
    pub fn new(config: Arc<SessionConfig>, now: DateTime<Utc>) -> Self {
        let mut cookie = CookieAttributes::from_options(&config.cookie);
        if !config.expire_after.is_zero() {
            cookie.expires = offset(now, config.expire_after_ms());
        }

        let establish = config.timestamp && cookie.expires.is_some();
        Self {
            config,
            fields: Document::new(),
            old: None,
            require_refresh: false,
            establish,
            remove: Vec::new(),
            cookie,
            phase: SessionPhase::Uninitialized,
            pending: 0,
        }
    }

    pub fn config(&self) -> &Arc<SessionConfig> {
        &self.config
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut Document {
        &mut self.fields
    }

    pub fn old(&self) -> Option<&AcceptedCookie> {
        self.old.as_ref()
    }

    pub fn cookie(&self) -> &CookieAttributes {
        &self.cookie
    }

    pub fn cookie_mut(&mut self) -> &mut CookieAttributes {
        &mut self.cookie
    }

    pub fn requires_refresh(&self) -> bool {
        self.require_refresh
    }

    pub fn pending_removals(&self) -> &[String] {
        &self.remove
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase {
            SessionPhase::Ready if self.is_modified() => SessionPhase::Modified,
            phase => phase,
        }
    }

    /// Whether the public fields differ from the accepted cookie.
    pub fn is_modified(&self) -> bool {
        match document::serialize(&self.fields) {
            Ok(current) => current != self.baseline(),
            Err(_) => true,
        }
    }

    pub fn schedule_removal(&mut self, id: impl Into<String>) {
        self.remove.push(id.into());
    }

    pub fn begin_candidate(&mut self) {
        self.pending += 1;
        self.phase = SessionPhase::Initializing;
    }

    /// Record the outcome of one candidate; failures schedule its removal.
    pub fn complete_candidate(
        &mut self,
        id: &str,
        decoded: Result<Candidate>,
        now: DateTime<Utc>,
    ) -> CandidateOutcome {
        self.pending = self.pending.saturating_sub(1);
        let outcome = match decoded.and_then(|candidate| self.adopt(candidate, now)) {
            Ok(outcome) => outcome,
            Err(err) => CandidateOutcome::Rejected(err),
        };

        if !outcome.is_adopted() {
            self.schedule_removal(id);
        }
        if self.pending == 0 {
            self.phase = SessionPhase::Ready;
        }
        outcome
    }

    /// Merge a decrypted candidate if it is the newest valid one seen so far.
    pub fn adopt(&mut self, candidate: Candidate, now: DateTime<Utc>) -> Result<CandidateOutcome> {
        let mut payload = document::parse(&candidate.plaintext)?;
        let expires = document::take_expiry(&mut payload)?.map(|ts| ts.0);

        if let Some(expires) = expires {
            if expires < now {
                return Err(SessionError::ReplayDetected { key_id: candidate.id });
            }
        }

        if let Some(old) = &self.old {
            if candidate.seq <= old.seq.unwrap_or(0) {
                return Ok(CandidateOutcome::Superseded);
            }
        }

        let data = document::serialize(&payload)?;
        if let Some(replaced) = self.old.take() {
            self.remove.push(replaced.id);
        }
        self.old = Some(AcceptedCookie {
            id: candidate.id,
            data,
            seq: (candidate.seq > 0).then_some(candidate.seq),
            expires,
        });
        self.fields = payload;
        self.establish = false;

        if let Some(expires) = expires {
            let window_start = offset(now, self.config.refresh_window_ms());
            if window_start.map_or(true, |start| start >= expires) {
                self.cookie.expires = offset(now, self.config.expire_after_ms());
                self.require_refresh = true;
            }
        }

        Ok(CandidateOutcome::Adopted)
    }

    /// Start a commit. Returns the plaintext to encrypt when a new cookie
    /// has to be issued.
    pub fn begin_commit(&mut self) -> Result<Option<Vec<u8>>> {
        self.phase = SessionPhase::Committing;

        let current = document::serialize(&self.fields)?;
        let establish = self.establish && self.old.is_none();
        if !self.require_refresh && !establish && current == self.baseline() {
            return Ok(None);
        }

        match self.cookie.expires {
            Some(expires) if self.config.timestamp => {
                let mut stamped = self.fields.clone();
                stamped.insert(EXPIRY_FIELD.to_string(), Timestamp(expires).to_value());
                document::serialize(&stamped).map(Some)
            }
            _ => Ok(Some(current)),
        }
    }

    /// Return to `Ready` after a failed commit.
    pub fn abort_commit(&mut self) {
        self.phase = SessionPhase::Ready;
    }

    /// Produce the `Set-Cookie` values once the new cookie, if any, is sealed.
    pub fn finish_commit(&mut self, issued: Option<IssuedCookie>) -> CommitOutcome {
        let mut set_cookies = Vec::new();

        if let Some(issued) = &issued {
            if let Some(old) = &self.old {
                self.remove.push(old.id.clone());
            }
            self.remove.retain(|id| !id.eq_ignore_ascii_case(&issued.key_id));

            set_cookies.push(self.cookie.to_header(&self.cookie_name(&issued.key_id), &issued.value));
        }

        let mut removed: Vec<String> = Vec::with_capacity(self.remove.len());
        for id in &self.remove {
            if !removed.contains(id) {
                removed.push(id.clone());
            }
        }
        set_cookies.extend(
            removed.iter().map(|id| deletion_header(&self.cookie_name(id), &self.cookie.path)),
        );

        self.phase = SessionPhase::Committed;
        CommitOutcome { issued, removed, set_cookies }
    }

    /// Drop the accepted cookie and clear all public fields.
    pub fn destroy(&mut self) {
        if let Some(old) = self.old.take() {
            self.remove.push(old.id);
        }
        self.fields.clear();
        self.establish = false;
    }

    /// Force the next commit to issue a fresh cookie.
    pub fn save(&mut self) {
        if let Some(old) = &self.old {
            self.remove.push(old.id.clone());
        }
        self.require_refresh = true;
    }

    /// Discard changes made since the cookie was accepted.
    pub fn reload(&mut self) -> Result<()> {
        let Some(old) = &self.old else {
            return Ok(());
        };
        let fields = document::parse(&old.data)?;
        if let Some(expires) = old.expires {
            self.cookie.expires = Some(expires);
        }
        self.fields = fields;
        Ok(())
    }

    pub fn regenerate(&mut self, now: DateTime<Utc>) {
        self.destroy();
        if !self.config.expire_after.is_zero() {
            self.cookie.expires = offset(now, self.config.expire_after_ms());
            self.establish = self.config.timestamp;
        }
    }

    pub fn insert(&mut self, key: String, value: Value) -> Result<Option<Value>> {
        if key == EXPIRY_FIELD {
            return Err(SessionError::Document(format!("{EXPIRY_FIELD} is a reserved field")));
        }
        Ok(self.fields.insert(key, value))
    }

    fn cookie_name(&self, id: &str) -> String {
        format!("{}.{}", self.config.name, id)
    }

    fn baseline(&self) -> Vec<u8> {
        self.old.as_ref().map(|old| old.data.clone()).unwrap_or_else(document::empty)
    }
}

/// `now` shifted by `ms`, or `None` past the representable range.
fn offset(now: DateTime<Utc>, ms: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_milliseconds(ms).and_then(|delta| now.checked_add_signed(delta))
}
