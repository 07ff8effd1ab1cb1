use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{EftlError, ErrorCode};

/// The outcome carried by a [`Completion`]: success with an optional response
/// value, or an error code plus reason (§3 "Completion").
#[derive(Debug)]
pub enum Outcome<T> {
    Success(Option<T>),
    Error { code: ErrorCode, reason: String },
}

/// A one-shot rendezvous. Exactly one signaller; a second [`Completion::signal`]
/// call is a no-op, collapsing the source SDK's "notify then clear" idiom
/// (spec §9 Design Notes) into ownership: the inner sender is consumed on the
/// first send and is simply absent thereafter.
pub struct Completion<T> {
    sender: Option<oneshot::Sender<Outcome<T>>>,
}

/// The caller-held half of a [`Completion`].
pub struct Waiter<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
}

/// Creates a linked completion/waiter pair.
pub fn completion<T>() -> (Completion<T>, Waiter<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { sender: Some(tx) }, Waiter { receiver: rx })
}

impl<T> Completion<T> {
    /// Signals the outcome. Returns `true` if this call was the one to
    /// deliver it; `false` if the completion had already fired (first signal
    /// wins, per §8 invariant 3).
    pub fn signal(&mut self, outcome: Outcome<T>) -> bool {
        match self.sender.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.sender.is_none()
    }
}

impl<T> Waiter<T> {
    /// Waits indefinitely for the completion to be signalled.
    pub async fn wait(self) -> Result<Option<T>, EftlError> {
        match self.receiver.await {
            Ok(Outcome::Success(value)) => Ok(value),
            Ok(Outcome::Error { code, reason }) => Err(EftlError::Server { code, reason }),
            Err(_) => Err(EftlError::Cancelled),
        }
    }

    /// Waits up to `timeout`. Does not itself remove any associated ledger
    /// entry; the caller must still unregister on timeout (§5 "Cancellation
    /// and timeouts").
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Option<T>, EftlError> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(Outcome::Success(value))) => Ok(value),
            Ok(Ok(Outcome::Error { code, reason })) => Err(EftlError::Server { code, reason }),
            Ok(Err(_)) => Err(EftlError::Cancelled),
            Err(_) => Err(EftlError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signals_once() {
        let (mut c, w) = completion::<u32>();
        assert!(c.signal(Outcome::Success(Some(42))));
        assert!(!c.signal(Outcome::Success(Some(7))));
        assert_eq!(w.wait().await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn dropped_sender_is_cancellation() {
        let (c, w) = completion::<u32>();
        drop(c);
        assert!(matches!(w.wait().await, Err(EftlError::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_fires_without_signal() {
        let (_c, w) = completion::<u32>();
        let res = w.wait_timeout(Duration::from_millis(20)).await;
        assert!(matches!(res, Err(EftlError::Timeout)));
    }
}
