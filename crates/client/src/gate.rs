//! Run-once coordination for creations and uploads.
//!
//! A [`OnceGate`] admits a single worker. Callers arriving while it runs wait
//! for the same outcome, and callers arriving afterwards get the recorded
//! outcome without repeating the work. The work runs on its own task, so a
//! caller that gives up waiting never cancels it.

use crate::error::{ClientError, ClientResult};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

enum State<T> {
    NotStarted,
    InProgress(watch::Receiver<Option<ClientResult<T>>>),
    Done(ClientResult<T>),
}

pub struct OnceGate<T> {
    state: Mutex<State<T>>,
}

impl<T> OnceGate<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
        }
    }

    /// A gate whose work already succeeded elsewhere.
    pub fn done(value: T) -> Self {
        Self {
            state: Mutex::new(State::Done(Ok(value))),
        }
    }

    /// The recorded outcome, if the work has finished.
    pub fn outcome(&self) -> Option<ClientResult<T>> {
        match &*self.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// The value of a successful run.
    pub fn value(&self) -> Option<T> {
        self.outcome().and_then(Result::ok)
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), State::InProgress(_))
    }

    /// Run `work` unless another caller already did, then return the shared outcome.
    pub async fn run<F, Fut>(self: &Arc<Self>, work: F) -> ClientResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ClientResult<T>> + Send + 'static,
    {
        let mut rx = {
            let mut state = self.lock();
            match &*state {
                State::Done(outcome) => return outcome.clone(),
                State::InProgress(rx) => rx.clone(),
                State::NotStarted => {
                    let (tx, rx) = watch::channel(None);
                    *state = State::InProgress(rx.clone());

                    let gate = Arc::clone(self);
                    let work = work();
                    tokio::spawn(async move {
                        let outcome = AssertUnwindSafe(work)
                            .catch_unwind()
                            .await
                            .unwrap_or(Err(ClientError::Interrupted));
                        *gate.lock() = State::Done(outcome.clone());
                        tx.send_replace(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ClientError::Interrupted))
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.state)
    }
}

/// Lock a mutex whose data stays consistent even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> Default for OnceGate<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
