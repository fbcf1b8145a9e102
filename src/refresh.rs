use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Error;
use crate::token::Token;

pub(crate) type RefreshOutcome = Result<Token, Error>;

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;

/// Registry of in-flight refresh attempts, keyed by refresh-token value.
///
/// The first caller for a given key becomes the leader and performs the
/// attempt; concurrent callers presenting the same key attach to the same
/// ticket and receive the leader's outcome. The ticket is removed when the
/// attempt settles (success or failure), so a later refresh with a rotated
/// refresh token always starts fresh. Check-and-insert happens under one
/// lock, so N concurrent callers produce exactly one attempt.
#[derive(Debug, Default)]
pub(crate) struct RefreshRegistry {
    inflight: Mutex<HashMap<String, OutcomeReceiver>>,
}

enum Role {
    Leader(watch::Sender<Option<RefreshOutcome>>),
    Follower(OutcomeReceiver),
}

/// Removes the ticket when the leader settles, or if it is cancelled
/// mid-flight, so followers are never left attached to a dead entry.
struct TicketGuard<'a> {
    registry: &'a RefreshRegistry,
    key: &'a str,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.registry.inflight.lock() {
            inflight.remove(self.key);
        }
    }
}

impl RefreshRegistry {
    /// Run `attempt` under single-flight for `key`.
    ///
    /// The leader spawns `attempt` as a detached task and waits at most
    /// `wait_timeout` for it: the timer firing fails the ticket with
    /// [`Error::RefreshTimeout`] but does not cancel the request, which
    /// keeps running with its result discarded. `settle` runs exactly once,
    /// leader-side, after the ticket is removed and before any waiter
    /// observes the outcome.
    pub(crate) async fn run<F, Fut, S>(
        &self,
        key: &str,
        wait_timeout: Duration,
        attempt: F,
        settle: S,
    ) -> RefreshOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
        S: FnOnce(&RefreshOutcome),
    {
        let role = {
            let mut inflight = self.inflight.lock().expect("refresh registry poisoned");
            match inflight.get(key) {
                Some(receiver) => Role::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    inflight.insert(key.to_string(), receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Follower(mut receiver) => loop {
                if let Some(outcome) = receiver.borrow().clone() {
                    return outcome;
                }
                if receiver.changed().await.is_err() {
                    return Err(Error::Request(
                        "token refresh was abandoned before completing".into(),
                    ));
                }
            },
            Role::Leader(sender) => {
                let guard = TicketGuard {
                    registry: self,
                    key,
                };
                let task = tokio::spawn(attempt());
                let outcome = match tokio::time::timeout(wait_timeout, task).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(join_error)) => {
                        Err(Error::Request(format!("refresh task failed: {join_error}")))
                    }
                    Err(_) => Err(Error::RefreshTimeout(wait_timeout.as_secs())),
                };
                drop(guard);
                settle(&outcome);
                let _ = sender.send(Some(outcome.clone()));
                outcome
            }
        }
    }
}
