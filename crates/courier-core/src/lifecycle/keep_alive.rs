use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::models::SessionState;
use crate::provider::MessagingProvider;
use crate::registry::SessionRegistry;

/// Process-wide keep-alive ticker. On every tick it walks a point-in-time
/// snapshot of the session registry and issues a presence update for each
/// connected session. Presence failures are logged and never transition
/// session state or count against a retry budget.
pub struct KeepAlive {
    abort: AbortHandle,
}

impl KeepAlive {
    pub fn spawn(
        provider: Arc<dyn MessagingProvider>,
        sessions: SessionRegistry,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; consume
            // it so presence traffic starts one interval in.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let snapshot = match sessions.snapshot() {
                    Ok(snapshot) => snapshot,
                    Err(error) => {
                        tracing::error!(error = %error, "keep-alive failed to snapshot sessions");
                        continue;
                    }
                };

                for session in snapshot {
                    if session.state != SessionState::Connected {
                        continue;
                    }
                    let Some(handle) = session.handle else {
                        continue;
                    };
                    if let Err(error) = provider.send_presence(&handle).await {
                        tracing::warn!(
                            session = %session.id,
                            error = %error,
                            "keep-alive presence update failed"
                        );
                    }
                }
            }
        });

        Self {
            abort: handle.abort_handle(),
        }
    }

    pub fn shutdown(&self) {
        self.abort.abort();
    }
}
