//! Response commit gate.
//!
//! Handler code writes to a [`CommitGate`] exactly as it would to the real
//! response. Until the session commit has produced its `Set-Cookie`
//! headers, every operation is queued; the first one starts the commit.
//! Once the commit resolves the cookies are applied, the queue is replayed
//! in arrival order and the gate forwards directly from then on.
//!
//! `write` and `end` return `false` while the commit is outstanding, the
//! usual signal for a producer to pause; [`CommitGate::drained`] resolves
//! when it may continue.
//!
//! The commit itself is [`Session::commit`], which runs once per session;
//! a gate and any direct caller observe the same outcome.

pub mod deferred;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::{commit_failure_body, Result, SessionError};
use crate::session::{CommitOutcome, Session};

pub use deferred::Deferred;

/// Outbound half of an HTTP exchange.
pub trait ResponseSink: Send + 'static {
    /// Set the status and add `headers` to those already set.
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap);

    /// Append one header value.
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Write body data. Returns `false` when the producer should pause.
    fn write(&mut self, chunk: Bytes) -> bool;

    /// Finish the body, optionally with a last chunk.
    fn end(&mut self, chunk: Option<Bytes>) -> bool;
}

/// Operation recorded while the commit is outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOp {
    WriteHead(StatusCode, HeaderMap),
    SetHeader(HeaderName, HeaderValue),
    Write(Bytes),
    End(Option<Bytes>),
}

impl GateOp {
    fn apply<S: ResponseSink>(self, sink: &mut S) -> bool {
        match self {
            GateOp::WriteHead(status, headers) => {
                sink.write_head(status, headers);
                true
            }
            GateOp::SetHeader(name, value) => {
                sink.set_header(name, value);
                true
            }
            GateOp::Write(chunk) => sink.write(chunk),
            GateOp::End(chunk) => sink.end(chunk),
        }
    }
}

enum GateState<S> {
    Pending { sink: S, queue: Vec<GateOp> },
    Open(S),
    /// The failure response was sent; handler output is discarded
    Failed(S),
    Finished,
}

struct GateInner<S> {
    state: Mutex<GateState<S>>,
    started: AtomicBool,
    drained: watch::Sender<bool>,
}

impl<S> GateInner<S> {
    fn lock(&self) -> MutexGuard<'_, GateState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decorator deferring response output until the session is committed
pub struct CommitGate<S> {
    session: Session,
    inner: Arc<GateInner<S>>,
}

impl<S> Clone for CommitGate<S> {
    fn clone(&self) -> Self {
        Self { session: self.session.clone(), inner: self.inner.clone() }
    }
}

impl<S: ResponseSink> CommitGate<S> {
    pub fn new(session: Session, sink: S) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            session,
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::Pending { sink, queue: Vec::new() }),
                started: AtomicBool::new(false),
                drained,
            }),
        }
    }

    pub fn write_head(&self, status: StatusCode, headers: HeaderMap) {
        self.push(GateOp::WriteHead(status, headers));
    }

    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.push(GateOp::SetHeader(name, value));
    }

    pub fn write(&self, chunk: impl Into<Bytes>) -> bool {
        self.push(GateOp::Write(chunk.into()))
    }

    pub fn end(&self, chunk: Option<Bytes>) -> bool {
        self.push(GateOp::End(chunk))
    }

    /// Whether queued output has been flushed to the sink.
    pub fn is_open(&self) -> bool {
        *self.inner.drained.borrow()
    }

    /// Number of operations waiting for the commit.
    pub fn queued(&self) -> usize {
        match &*self.inner.lock() {
            GateState::Pending { queue, .. } => queue.len(),
            _ => 0,
        }
    }

    /// Outcome of the commit, once it has resolved.
    pub fn commit_outcome(&self) -> Option<Result<CommitOutcome>> {
        self.session.commit_outcome()
    }

    /// Resolves once the queue has been flushed (or replaced by the failure
    /// response). Producers that saw `false` from `write` wait here.
    pub async fn drained(&self) {
        let mut rx = self.inner.drained.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Start the commit if nothing has yet, wait for it, and hand back the
    /// sink.
    pub async fn finish(self) -> Result<S> {
        self.start();
        self.drained().await;

        let mut state = self.inner.lock();
        match std::mem::replace(&mut *state, GateState::Finished) {
            GateState::Open(sink) | GateState::Failed(sink) => Ok(sink),
            GateState::Pending { sink, queue } => {
                *state = GateState::Pending { sink, queue };
                Err(SessionError::Commit("response gate closed before commit resolved".into()))
            }
            GateState::Finished => {
                Err(SessionError::Commit("response gate already finished".into()))
            }
        }
    }

    fn push(&self, op: GateOp) -> bool {
        {
            let mut state = self.inner.lock();
            match &mut *state {
                GateState::Pending { queue, .. } => queue.push(op),
                GateState::Open(sink) => return op.apply(sink),
                GateState::Failed(_) | GateState::Finished => return true,
            }
        }
        self.start();
        false
    }

    fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let session = self.session.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = session.commit().await;
            settle(&inner, outcome);
            inner.drained.send_replace(true);
        });
    }
}

/// Apply the commit outcome to the sink and replay or discard the queue.
fn settle<S: ResponseSink>(inner: &GateInner<S>, outcome: Result<CommitOutcome>) {
    let mut state = inner.lock();
    let (mut sink, queue) = match std::mem::replace(&mut *state, GateState::Finished) {
        GateState::Pending { sink, queue } => (sink, queue),
        settled => {
            *state = settled;
            return;
        }
    };

    match outcome {
        Ok(outcome) => {
            for cookie in &outcome.set_cookies {
                match HeaderValue::from_str(cookie) {
                    Ok(value) => sink.set_header(header::SET_COOKIE, value),
                    Err(e) => error!(error = %e, "dropping unrepresentable Set-Cookie header"),
                }
            }
            debug!(replayed = queue.len(), "session committed, replaying response");
            for op in queue {
                op.apply(&mut sink);
            }
            *state = GateState::Open(sink);
        }
        Err(err) => {
            error!(error = %err, discarded = queue.len(), "session commit failed");
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            sink.write_head(StatusCode::INTERNAL_SERVER_ERROR, headers);
            sink.end(Some(Bytes::from(commit_failure_body(&err))));
            *state = GateState::Failed(sink);
        }
    }
}

/// Sink collecting the response in memory.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    ended: bool,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Status and headers, dropping any body.
    pub fn into_head(self) -> (StatusCode, HeaderMap) {
        (self.status, self.headers)
    }

    pub fn into_response<B: From<Bytes>>(self) -> Response<B> {
        let mut response = Response::new(B::from(self.body.freeze()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

impl ResponseSink for BufferedResponse {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        self.status = status;
        let mut last: Option<HeaderName> = None;
        for (name, value) in headers {
            let name = match name {
                Some(name) => {
                    last = Some(name.clone());
                    name
                }
                None => match &last {
                    Some(name) => name.clone(),
                    None => continue,
                },
            };
            self.headers.append(name, value);
        }
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    fn write(&mut self, chunk: Bytes) -> bool {
        if !self.ended {
            self.body.extend_from_slice(&chunk);
        }
        true
    }

    fn end(&mut self, chunk: Option<Bytes>) -> bool {
        if let Some(chunk) = chunk {
            self.write(chunk);
        }
        self.ended = true;
        true
    }
}
