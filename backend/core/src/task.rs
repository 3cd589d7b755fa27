//! One-shot task handles.
//!
//! A task produces zero or more updates followed by exactly one outcome. The
//! producer side ([`TaskReporter`]) is consumed when it finishes, so a second
//! outcome cannot be sent; if it is dropped without finishing (a worker panic
//! unwinding through it, for example) the consumer still receives an
//! [`RagError::Unexpected`] outcome. Updates are closed before the outcome is
//! sent, so a consumer that drains updates first sees them all before the
//! outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::RagError;

pub type Outcome<T> = Result<T, RagError>;

const ABANDONED: &str = "task ended without reporting an outcome";

/// Sending half of a [`Pending`] outcome.
pub struct Completer<T> {
    tx: Option<oneshot::Sender<Outcome<T>>>,
}

impl<T> Completer<T> {
    pub fn complete(mut self, outcome: Outcome<T>) {
        if let Some(tx) = self.tx.take() {
            // Receiver gone means the caller stopped listening.
            let _ = tx.send(outcome);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(RagError::Unexpected(ABANDONED.to_string())));
        }
    }
}

/// A single outcome that will be delivered later.
pub struct Pending<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

pub fn pending<T>() -> (Completer<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx: Some(tx) }, Pending { rx })
}

impl<T> Pending<T> {
    /// An outcome that is already known.
    pub fn ready(outcome: Outcome<T>) -> Self {
        let (completer, pending) = pending();
        completer.complete(outcome);
        pending
    }
}

impl<T> Future for Pending<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(RagError::Unexpected(ABANDONED.to_string()))))
    }
}

/// Producer side of a task with updates.
pub struct TaskReporter<U, T> {
    // Dropped before `completer`, so updates close before any fallback outcome.
    updates: Option<mpsc::UnboundedSender<U>>,
    completer: Completer<T>,
}

impl<U, T> TaskReporter<U, T> {
    /// Send an update. Returns false when the consumer no longer receives them.
    pub fn update(&self, update: U) -> bool {
        match &self.updates {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    pub fn finish(self, outcome: Outcome<T>) {
        let TaskReporter { updates, completer } = self;
        drop(updates);
        completer.complete(outcome);
    }
}

/// Consumer side of a task with updates.
pub struct TaskHandle<U, T> {
    updates: mpsc::UnboundedReceiver<U>,
    outcome: Pending<T>,
}

pub fn task<U, T>() -> (TaskReporter<U, T>, TaskHandle<U, T>) {
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let (completer, outcome) = pending();
    (
        TaskReporter {
            updates: Some(update_tx),
            completer,
        },
        TaskHandle {
            updates: update_rx,
            outcome,
        },
    )
}

impl<U, T> TaskHandle<U, T> {
    /// A task that failed before doing any work.
    pub fn rejected(err: RagError) -> Self {
        let (reporter, handle) = task();
        reporter.finish(Err(err));
        handle
    }

    /// Next update, or `None` once the task has stopped producing updates.
    pub async fn next_update(&mut self) -> Option<U> {
        self.updates.recv().await
    }

    /// Forward every update to `on_update`, then return the outcome.
    pub async fn drain<F>(mut self, mut on_update: F) -> Outcome<T>
    where
        F: FnMut(U),
    {
        while let Some(update) = self.updates.recv().await {
            on_update(update);
        }
        self.outcome.await
    }

    /// Ignore updates and wait for the outcome.
    pub async fn finish(self) -> Outcome<T> {
        self.outcome.await
    }

    /// Stop receiving updates; the producer sees further sends fail.
    /// The outcome is still delivered.
    pub fn close_updates(&mut self) {
        self.updates.close();
    }
}
