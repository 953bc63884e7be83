//! `ConnectionRequest` — a pending, one-shot promise for a connection on a
//! named pool (`spec.md` §4.1).

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::ClusterError;
use crate::id::RequestId;

/// A one-shot completion handle enforcing "exactly one of resolve/reject,
/// at most once" at the type level: [`Completer::complete`] consumes `self`,
/// so a second call is simply impossible rather than merely guarded.
struct Completer<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tx: oneshot::Sender<Result<T, ClusterError<E>>>,
}

impl<T, E> Completer<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn complete(self, result: Result<T, ClusterError<E>>) {
        // The receiver may already be gone (caller dropped the future); a
        // dropped oneshot send is not our problem to report.
        let _ = self.tx.send(result);
    }
}

/// A pending request for a connection from a named pool.
///
/// Lives from [`ConnectionRequest::new`] until the first of: matched
/// ([`ConnectionRequest::execute`]), timed out or otherwise failed
/// ([`ConnectionRequest::abort`]).
pub struct ConnectionRequest<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    id: RequestId,
    pool: String,
    created: Instant,
    completer: Option<Completer<T, E>>,
}

impl<T, E> ConnectionRequest<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Stamps `created` and a fresh id; returns the request plus the
    /// receiver half the caller awaits.
    pub fn new(pool: impl Into<String>) -> (Self, oneshot::Receiver<Result<T, ClusterError<E>>>) {
        let (tx, rx) = oneshot::channel();
        let request = ConnectionRequest {
            id: RequestId::next(),
            pool: pool.into(),
            created: Instant::now(),
            completer: Some(Completer { tx }),
        };
        (request, rx)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// `answered` is monotonic: once the completer has been taken, the
    /// request is terminal.
    pub fn is_answered(&self) -> bool {
        self.completer.is_none()
    }

    /// If not answered, mark answered and resolve with `value`. A no-op on
    /// a request that was already answered.
    pub fn execute(&mut self, value: T) {
        if let Some(completer) = self.completer.take() {
            completer.complete(Ok(value));
        }
    }

    /// If not answered, mark answered and reject with `err`. A no-op on a
    /// request that was already answered.
    pub fn abort(&mut self, err: ClusterError<E>) {
        if let Some(completer) = self.completer.take() {
            completer.complete(Err(err));
        }
    }

    /// Pure predicate: `now - created > ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() > ttl
    }

    pub fn waited(&self) -> Duration {
        self.created.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_err() -> ClusterError<io::Error> {
        ClusterError::Shutdown
    }

    #[tokio::test]
    async fn execute_then_abort_is_noop() {
        let (mut req, rx) = ConnectionRequest::<u32, io::Error>::new("read");
        req.execute(7);
        assert!(req.is_answered());
        // Second call, of either kind, must not panic or resend.
        req.abort(io_err());
        assert_eq!(rx.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn abort_then_execute_is_noop() {
        let (mut req, rx) = ConnectionRequest::<u32, io::Error>::new("write");
        req.abort(io_err());
        req.execute(9);
        assert!(matches!(rx.await.unwrap(), Err(ClusterError::Shutdown)));
    }

    #[test]
    fn expiry_is_pure_predicate_on_created() {
        let (req, _rx) = ConnectionRequest::<u32, io::Error>::new("read");
        assert!(!req.is_expired(Duration::from_secs(60)));
        assert!(req.is_expired(Duration::from_secs(0)));
    }
}
