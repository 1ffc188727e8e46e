//! A value that may not exist yet.

use tokio::sync::oneshot;

/// A value that is either known now or promised by a [`Fulfill`] handle.
///
/// Audio notifications can arrive before the clip they name is available;
/// the playback queue only awaits the location when the clip reaches the
/// head of the queue.
#[derive(Debug)]
pub struct Deferred<T> {
    inner: Inner<T>,
}

#[derive(Debug)]
enum Inner<T> {
    Ready(T),
    Pending(oneshot::Receiver<T>),
}

impl<T> Deferred<T> {
    pub fn ready(value: T) -> Self {
        Self {
            inner: Inner::Ready(value),
        }
    }

    /// A deferred value plus the handle that will supply it.
    pub fn channel() -> (Fulfill<T>, Deferred<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Fulfill(tx),
            Deferred {
                inner: Inner::Pending(rx),
            },
        )
    }

    /// Wait for the value. `None` if the [`Fulfill`] handle was dropped
    /// without supplying one.
    pub async fn resolve(self) -> Option<T> {
        match self.inner {
            Inner::Ready(value) => Some(value),
            Inner::Pending(rx) => rx.await.ok(),
        }
    }
}

/// Supplies the value of a [`Deferred`].
#[derive(Debug)]
pub struct Fulfill<T>(oneshot::Sender<T>);

impl<T> Fulfill<T> {
    /// Returns `false` if the deferred side is gone.
    pub fn fulfill(self, value: T) -> bool {
        self.0.send(value).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_resolves_immediately() {
        let deferred = Deferred::ready("voice_1.mp3");
        assert_eq!(deferred.resolve().await, Some("voice_1.mp3"));
    }

    #[tokio::test]
    async fn channel_resolves_once_fulfilled() {
        let (fulfill, deferred) = Deferred::channel();
        let waiter = tokio::spawn(deferred.resolve());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert!(fulfill.fulfill(7));
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn dropped_fulfill_resolves_to_none() {
        let (fulfill, deferred) = Deferred::<String>::channel();
        drop(fulfill);
        assert_eq!(deferred.resolve().await, None);
    }
}
