//! Reconnect credential storage and periodic refresh.
//!
//! The [`ReconnectCredentialManager`] owns the reconnect token plus the
//! digests the edge hands out on registration. Connections only read from
//! it; the supervisor drives [`refresh_auth`](ReconnectCredentialManager::refresh_auth)
//! on its own timer. Every value is swapped wholesale under a lock, so a
//! reader sees either the old or the new value, never a mix.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::auth::{AuthOutcome, Authenticator, ReconnectToken};
use super::backoff::BackoffHandler;
use super::config::RefreshAuthPolicy;
use super::error::TunnelError;

/// When to refresh next, and what happened this time.
#[derive(Debug)]
pub struct RefreshSchedule {
    pub after: Duration,
    pub status: RefreshStatus,
}

#[derive(Debug)]
pub enum RefreshStatus {
    /// A new token replaced the old one.
    Renewed,
    /// The edge could not decide; the old token stays.
    Deferred { reason: String },
    /// The round trip failed and will be retried after backoff.
    Failed(TunnelError),
}

/// Counters for refresh round trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub successes: u64,
    pub failures: u64,
}

pub struct ReconnectCredentialManager {
    token: RwLock<Option<ReconnectToken>>,
    event_digest: RwLock<Option<Arc<[u8]>>>,
    conn_digests: RwLock<Vec<Option<Arc<[u8]>>>>,
    auth_timeout: Duration,
    default_refresh_interval: Duration,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ReconnectCredentialManager {
    pub fn new(ha_connections: usize, policy: &RefreshAuthPolicy) -> Self {
        Self {
            token: RwLock::new(None),
            event_digest: RwLock::new(None),
            conn_digests: RwLock::new(vec![None; ha_connections]),
            auth_timeout: policy.auth_timeout,
            default_refresh_interval: policy.default_refresh_interval,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn reconnect_token(&self) -> Result<ReconnectToken, TunnelError> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TunnelError::ReconnectTokenUnset)
    }

    pub fn set_reconnect_token(&self, token: ReconnectToken) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub fn event_digest(&self) -> Result<Arc<[u8]>, TunnelError> {
        self.event_digest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TunnelError::EventDigestUnset)
    }

    pub fn set_event_digest(&self, digest: impl Into<Arc<[u8]>>) {
        *self
            .event_digest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(digest.into());
    }

    pub fn conn_digest(&self, index: usize) -> Result<Arc<[u8]>, TunnelError> {
        self.conn_digests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .flatten()
            .ok_or(TunnelError::ConnDigestUnset(index))
    }

    pub fn set_conn_digest(&self, index: usize, digest: impl Into<Arc<[u8]>>) {
        let mut digests = self
            .conn_digests
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if digests.len() <= index {
            digests.resize(index + 1, None);
        }
        digests[index] = Some(digest.into());
    }

    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Run one authentication round trip and decide when to run the next.
    ///
    /// Returns an error only when refresh must stop for good: the edge
    /// rejected us, or `backoff` ran out of retries.
    pub async fn refresh_auth(
        &self,
        cancel: &CancellationToken,
        backoff: &mut BackoffHandler,
        authenticator: &dyn Authenticator,
    ) -> Result<RefreshSchedule, TunnelError> {
        let attempt = tokio::time::timeout(
            self.auth_timeout,
            authenticator.authenticate(cancel, backoff.retries()),
        )
        .await;

        let outcome = match attempt {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return self.schedule_retry(backoff, e),
            Err(_) => {
                let e = TunnelError::Auth(format!(
                    "authenticate timed out after {}s",
                    self.auth_timeout.as_secs()
                ));
                return self.schedule_retry(backoff, e);
            }
        };

        backoff.set_grace_period();
        match outcome {
            AuthOutcome::Success {
                token,
                refresh_after,
            } => {
                self.set_reconnect_token(token);
                self.successes.fetch_add(1, Ordering::Relaxed);
                let after = self.refresh_interval(refresh_after);
                info!(refresh_after_secs = after.as_secs(), "Reconnect token renewed");
                Ok(RefreshSchedule {
                    after,
                    status: RefreshStatus::Renewed,
                })
            }
            AuthOutcome::Unknown {
                reason,
                refresh_after,
            } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Ok(RefreshSchedule {
                    after: self.refresh_interval(refresh_after),
                    status: RefreshStatus::Deferred { reason },
                })
            }
            AuthOutcome::Fail { reason } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(TunnelError::AuthRejected(reason))
            }
        }
    }

    fn schedule_retry(
        &self,
        backoff: &mut BackoffHandler,
        err: TunnelError,
    ) -> Result<RefreshSchedule, TunnelError> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        match backoff.next_delay() {
            Some(after) => {
                debug!(retries = backoff.retries(), delay_ms = after.as_millis(), "Scheduling refresh retry");
                Ok(RefreshSchedule {
                    after,
                    status: RefreshStatus::Failed(err),
                })
            }
            None => Err(TunnelError::RefreshExhausted {
                retries: backoff.retries(),
                source: Box::new(err),
            }),
        }
    }

    fn refresh_interval(&self, refresh_after: Duration) -> Duration {
        if refresh_after.is_zero() {
            self.default_refresh_interval
        } else {
            refresh_after
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::tunnel::BoxFuture;

    /// Replays a fixed list of results, then keeps failing.
    struct ScriptedAuth {
        script: Mutex<VecDeque<Result<AuthOutcome, TunnelError>>>,
        attempts_seen: Mutex<Vec<u32>>,
    }

    impl ScriptedAuth {
        fn new(script: Vec<Result<AuthOutcome, TunnelError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                attempts_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Authenticator for ScriptedAuth {
        fn authenticate<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            previous_attempts: u32,
        ) -> BoxFuture<'a, Result<AuthOutcome, TunnelError>> {
            self.attempts_seen.lock().unwrap().push(previous_attempts);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TunnelError::Auth("edge unreachable".into())));
            Box::pin(async move { next })
        }
    }

    /// Never answers.
    struct HangingAuth;

    impl Authenticator for HangingAuth {
        fn authenticate<'a>(
            &'a self,
            _cancel: &'a CancellationToken,
            _previous_attempts: u32,
        ) -> BoxFuture<'a, Result<AuthOutcome, TunnelError>> {
            Box::pin(std::future::pending())
        }
    }

    fn manager() -> ReconnectCredentialManager {
        ReconnectCredentialManager::new(4, &RefreshAuthPolicy::default())
    }

    fn success(token: &str, secs: u64) -> Result<AuthOutcome, TunnelError> {
        Ok(AuthOutcome::Success {
            token: ReconnectToken::new(token),
            refresh_after: Duration::from_secs(secs),
        })
    }

    #[test]
    fn unset_values_report_dedicated_errors() {
        let cm = manager();
        assert!(matches!(
            cm.reconnect_token(),
            Err(TunnelError::ReconnectTokenUnset)
        ));
        assert!(matches!(cm.event_digest(), Err(TunnelError::EventDigestUnset)));
        assert!(matches!(cm.conn_digest(2), Err(TunnelError::ConnDigestUnset(2))));
        assert!(matches!(cm.conn_digest(9), Err(TunnelError::ConnDigestUnset(9))));
    }

    #[test]
    fn digests_round_trip_and_grow() {
        let cm = manager();
        cm.set_event_digest(vec![1, 2, 3]);
        cm.set_conn_digest(1, vec![7]);
        cm.set_conn_digest(6, vec![9]);

        assert_eq!(&*cm.event_digest().unwrap(), &[1, 2, 3]);
        assert_eq!(&*cm.conn_digest(1).unwrap(), &[7]);
        assert_eq!(&*cm.conn_digest(6).unwrap(), &[9]);
        assert!(cm.conn_digest(5).is_err());
    }

    #[tokio::test]
    async fn success_replaces_token_and_uses_edge_interval() {
        let cm = manager();
        let auth = ScriptedAuth::new(vec![success("first", 120), success("second", 300)]);
        let mut backoff = BackoffHandler::new(10, Duration::from_secs(10), false);
        let cancel = CancellationToken::new();

        let first = cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();
        assert_eq!(first.after, Duration::from_secs(120));
        assert!(matches!(first.status, RefreshStatus::Renewed));
        assert_eq!(cm.reconnect_token().unwrap().as_str(), "first");

        let second = cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();
        assert_eq!(second.after, Duration::from_secs(300));
        assert_eq!(cm.reconnect_token().unwrap().as_str(), "second");
        assert_eq!(
            cm.stats(),
            RefreshStats {
                successes: 2,
                failures: 0
            }
        );
    }

    #[tokio::test]
    async fn zero_refresh_after_uses_default_interval() {
        let cm = manager();
        let auth = ScriptedAuth::new(vec![success("tok", 0)]);
        let mut backoff = BackoffHandler::new(10, Duration::from_secs(10), false);

        let schedule = cm
            .refresh_auth(&CancellationToken::new(), &mut backoff, &auth)
            .await
            .unwrap();
        assert_eq!(
            schedule.after,
            RefreshAuthPolicy::default().default_refresh_interval
        );
    }

    #[tokio::test]
    async fn failure_keeps_stale_token_and_backs_off() {
        let cm = manager();
        let auth = ScriptedAuth::new(vec![
            success("good", 60),
            Err(TunnelError::Auth("dial failed".into())),
        ]);
        let mut backoff = BackoffHandler::new(10, Duration::from_secs(10), false);
        let cancel = CancellationToken::new();

        cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();
        let schedule = cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();

        assert!(matches!(schedule.status, RefreshStatus::Failed(TunnelError::Auth(_))));
        assert!(schedule.after <= Duration::from_secs(20));
        assert_eq!(backoff.retries(), 1);
        assert_eq!(cm.reconnect_token().unwrap().as_str(), "good");
        assert_eq!(cm.stats().failures, 1);
    }

    #[tokio::test]
    async fn success_after_failures_resets_backoff() {
        let cm = manager();
        let auth = ScriptedAuth::new(vec![
            Err(TunnelError::Auth("one".into())),
            Err(TunnelError::Auth("two".into())),
            success("tok", 60),
        ]);
        let mut backoff = BackoffHandler::new(10, Duration::from_secs(10), false);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();
        }
        assert_eq!(backoff.retries(), 0);
        assert_eq!(*auth.attempts_seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exhausted_backoff_disables_refresh() {
        let cm = manager();
        cm.set_reconnect_token(ReconnectToken::new("last-good"));
        let auth = ScriptedAuth::new(Vec::new());
        let mut backoff = BackoffHandler::new(3, Duration::from_secs(10), false);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let schedule = cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap();
            assert!(matches!(schedule.status, RefreshStatus::Failed(_)));
        }
        let err = cm.refresh_auth(&cancel, &mut backoff, &auth).await.unwrap_err();
        assert!(matches!(err, TunnelError::RefreshExhausted { retries: 3, .. }));
        assert_eq!(cm.reconnect_token().unwrap().as_str(), "last-good");
        assert_eq!(cm.stats().failures, 4);
    }

    #[tokio::test]
    async fn unknown_outcome_defers_and_keeps_token() {
        let cm = manager();
        cm.set_reconnect_token(ReconnectToken::new("kept"));
        let auth = ScriptedAuth::new(vec![Ok(AuthOutcome::Unknown {
            reason: "edge busy".into(),
            refresh_after: Duration::from_secs(45),
        })]);
        let mut backoff = BackoffHandler::new(3, Duration::from_secs(10), false);
        backoff.next_delay();

        let schedule = cm
            .refresh_auth(&CancellationToken::new(), &mut backoff, &auth)
            .await
            .unwrap();
        match schedule.status {
            RefreshStatus::Deferred { reason } => assert_eq!(reason, "edge busy"),
            other => panic!("expected Deferred, got {other:?}"),
        }
        assert_eq!(schedule.after, Duration::from_secs(45));
        assert_eq!(backoff.retries(), 0);
        assert_eq!(cm.reconnect_token().unwrap().as_str(), "kept");
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let cm = manager();
        let auth = ScriptedAuth::new(vec![Ok(AuthOutcome::Fail {
            reason: "tunnel deleted".into(),
        })]);
        let mut backoff = BackoffHandler::new(3, Duration::from_secs(10), false);

        let err = cm
            .refresh_auth(&CancellationToken::new(), &mut backoff, &auth)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::AuthRejected(ref r) if r == "tunnel deleted"));
    }

    #[tokio::test(start_paused = true)]
    async fn authenticate_is_bounded_by_timeout() {
        let cm = manager();
        let mut backoff = BackoffHandler::new(3, Duration::from_secs(10), false);

        let schedule = cm
            .refresh_auth(&CancellationToken::new(), &mut backoff, &HangingAuth)
            .await
            .unwrap();
        assert!(matches!(schedule.status, RefreshStatus::Failed(TunnelError::Auth(_))));
        assert_eq!(backoff.retries(), 1);
    }
}
