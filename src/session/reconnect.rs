//! The automatic reconnect worker (§4.2 "Reconnect scheduling"), grounded in
//! the teacher's `BackendDriver::shutdown` / cancellation-receiver pattern:
//! a detached task holds a `oneshot::Receiver<()>` it races against its sleep,
//! so `Disconnect` during RECONNECTING can cancel it without a join.

use std::sync::Arc;
use std::time::Duration;

use futures_channel::oneshot;
use rand::Rng;
use tracing::debug;

use super::{connect_attempt, ConnectionState, SessionState, Shared};
use crate::error::{EftlError, ErrorCode};

/// Spawns the worker. The caller must have already transitioned `conn` to
/// `Reconnecting`, fired the corresponding state callback, and installed the
/// sender half of `cancel_rx` as `reconnect_cancel` under the same lock
/// acquisition, so no window exists where a concurrent `Disconnect` finds
/// the session RECONNECTING with nothing to cancel.
pub fn schedule_reconnect(shared: Arc<Shared>, mut cancel_rx: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            let delay = {
                let st = shared.state.lock().await;
                backoff_delay(&st)
            };

            tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("reconnect worker cancelled before reconnecting");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match connect_attempt(&shared).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(err = %e, "reconnect attempt failed, rotating url");
                    let exhausted = {
                        let mut st = shared.state.lock().await;
                        if st.urls.advance() {
                            st.reconnect_attempts += 1;
                        }
                        match st.options.auto_reconnect_attempts {
                            Some(max) => st.reconnect_attempts >= max,
                            None => false,
                        }
                    };
                    if exhausted {
                        fail_session(&shared, e).await;
                        return;
                    }
                }
            }
        }
    });
}

/// `min(autoReconnectMaxDelay, 2^attempts * 1000ms * jitter)` at URL index 0;
/// zero delay at every other index (§4.2).
fn backoff_delay(state: &SessionState) -> Duration {
    if state.urls.index() != 0 {
        return Duration::from_millis(0);
    }
    let exponent = state.reconnect_attempts.min(32);
    let base_ms = 2u64.saturating_pow(exponent).saturating_mul(1000);
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    let jittered = Duration::from_millis((base_ms as f64 * jitter) as u64);
    jittered.min(state.options.auto_reconnect_max_delay)
}

/// Reconnect attempts are exhausted: fail every ledger entry and report the
/// last connect error via the user's error handler (§4.3, §7).
async fn fail_session(shared: &Arc<Shared>, last_err: EftlError) {
    let old_state;
    {
        let mut st = shared.state.lock().await;
        old_state = st.conn;
        st.conn = ConnectionState::Disconnected;
        st.ledger.complete_all(ErrorCode::ConnectionLost, last_err.to_string());
    }
    shared.fire_state_change(old_state, ConnectionState::Disconnected);
    shared.fire_error(EftlError::ConnectFailed { reason: last_err.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ClientOptions;

    fn state_at(index_zero: bool, attempts: u32, max_delay: Duration) -> SessionState {
        let mut urls = crate::url_list::UrlList::parse("ws://a|ws://b").unwrap();
        if !index_zero {
            urls.advance();
        }
        SessionState {
            conn: ConnectionState::Reconnecting,
            urls,
            options: ClientOptions { auto_reconnect_max_delay: max_delay, ..ClientOptions::new() },
            negotiated: super::super::NegotiatedParams::default(),
            ledger: crate::ledger::RequestLedger::new(),
            registry: crate::registry::SubscriptionRegistry::new(),
            next_seq: 0,
            next_sub_id: 0,
            reconnect_attempts: attempts,
            backend: None,
            reconnect_cancel: None,
        }
    }

    #[test]
    fn non_zero_index_has_no_delay() {
        let st = state_at(false, 3, Duration::from_secs(30));
        assert_eq!(backoff_delay(&st), Duration::from_millis(0));
    }

    #[test]
    fn zero_index_backoff_is_capped_by_max_delay() {
        let st = state_at(true, 10, Duration::from_secs(5));
        assert_eq!(backoff_delay(&st), Duration::from_secs(5));
    }

    #[test]
    fn zero_index_backoff_grows_with_attempts_within_jitter_bounds() {
        let st = state_at(true, 1, Duration::from_secs(30));
        let delay = backoff_delay(&st);
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay <= Duration::from_millis(3000));
    }
}
