//! Cooperative cancellation
//!
//! An [`AbortController`] owns a `tokio::sync::watch` channel; every
//! [`AbortSignal`] derived from it observes the same value. A signal may
//! combine several controllers and carry a deadline. The interpreter calls
//! [`AbortSignal::check`] at node entry, iteration boundaries and before
//! publishing, and wraps every suspension point in [`AbortSignal::race`].

use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::error::{AbortReason, Result, RuntimeError};

/// Owner side of an abort channel.
#[derive(Clone, Debug)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    /// New, un-fired controller.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Signal observing this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            sources: vec![self.tx.subscribe()],
            deadline: None,
        }
    }

    /// Fire the abort. Only the first reason is kept.
    pub fn abort(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Whether the controller has fired.
    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Observer side: may combine several controllers and a deadline.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    sources: Vec<watch::Receiver<Option<AbortReason>>>,
    deadline: Option<Instant>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            sources: Vec::new(),
            deadline: None,
        }
    }

    /// Fires when any of `signals` fires, or at the earliest deadline.
    pub fn any(signals: impl IntoIterator<Item = AbortSignal>) -> Self {
        let mut combined = Self::never();
        for signal in signals {
            combined.sources.extend(signal.sources);
            combined.deadline = match (combined.deadline, signal.deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        combined
    }

    /// Add a deadline; the earlier of the existing and new one wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Add a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Current abort reason, if fired.
    pub fn reason(&self) -> Option<AbortReason> {
        for source in &self.sources {
            if let Some(reason) = source.borrow().clone() {
                return Some(reason);
            }
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(AbortReason::Timeout),
            _ => None,
        }
    }

    /// Whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// `Err(Aborted)` once the signal has fired.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(RuntimeError::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolve once the signal fires.
    pub async fn cancelled(&self) -> AbortReason {
        let mut waits: Vec<BoxFuture<'static, AbortReason>> = self
            .sources
            .iter()
            .cloned()
            .map(|mut rx| {
                async move {
                    let fired = rx
                        .wait_for(Option::is_some)
                        .await
                        .map(|value| (*value).clone())
                        .ok()
                        .flatten();
                    match fired {
                        Some(reason) => reason,
                        // Controller dropped without firing.
                        None => futures::future::pending().await,
                    }
                }
                .boxed()
            })
            .collect();

        if let Some(deadline) = self.deadline {
            waits.push(
                async move {
                    tokio::time::sleep_until(deadline).await;
                    AbortReason::Timeout
                }
                .boxed(),
            );
        }

        if waits.is_empty() {
            return futures::future::pending().await;
        }
        let (reason, _, _) = futures::future::select_all(waits).await;
        reason
    }

    /// Run `fut` unless the signal fires first.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(RuntimeError::Aborted(reason)),
            output = fut => Ok(output),
        }
    }
}
