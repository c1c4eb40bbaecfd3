//! Single-assignment, lazily started shared future.

use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

/// Work that runs at most once; every caller observes the same output.
///
/// The first [`Deferred::get_or_start`] call supplies the work. Later calls
/// get a handle to the same in-flight or completed future, and their own
/// start closure is dropped unused. Failures are memoized like successes.
pub struct Deferred<T: Clone> {
    cell: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { cell: Mutex::new(None) }
    }

    pub fn get_or_start<F, Fut>(&self, start: F) -> Shared<BoxFuture<'static, T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.get_or_insert_with(|| start().boxed().shared()).clone()
    }

    pub fn is_started(&self) -> bool {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Output of the work if it has already completed.
    pub fn peek(&self) -> Option<T> {
        let cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.as_ref().and_then(|shared| shared.peek().cloned())
    }
}

impl<T> Default for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
