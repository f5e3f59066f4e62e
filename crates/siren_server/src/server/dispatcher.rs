#![forbid(unsafe_code)]

use std::sync::Arc;

use siren_platform::registrar::SubscriptionRegistrar;
use siren_platform::{SessionEvent, SessionEventRx, SessionState, validate_inbound_event};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::registry::HandlerRegistry;

/// Consume the session event stream: inbound events go to the handler
/// registry, welcome statuses trigger (re-)registration of topic
/// subscriptions for the new session id.
pub fn spawn_dispatcher(
	mut events_rx: SessionEventRx,
	registry: Arc<HandlerRegistry>,
	registrar: Arc<dyn SubscriptionRegistrar>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut registered_session_id: Option<String> = None;

		while let Some(event) = events_rx.recv().await {
			match event {
				SessionEvent::Inbound(ev) => {
					if let Err(e) = validate_inbound_event(&ev) {
						warn!(topic = %ev.topic, error = ?e, "dropping malformed inbound event");
						continue;
					}
					registry.dispatch(*ev).await;
				}
				SessionEvent::Status(st) => {
					metrics::gauge!("siren_session_connected").set(if st.state == SessionState::Connected {
						1.0
					} else {
						0.0
					});

					if let Some(err) = &st.last_error {
						warn!(state = %st.state, detail = %st.detail, error = %err, "session status");
					} else {
						info!(state = %st.state, detail = %st.detail, "session status");
					}

					// Register once per session id. Re-registering after a
					// migration is tolerated upstream (409 = already there).
					if st.state == SessionState::Connected
						&& let Some(session_id) = st.session_id
						&& registered_session_id.as_deref() != Some(session_id.as_str())
					{
						match registrar.register(&session_id).await {
							Ok(()) => {
								registered_session_id = Some(session_id);
							}
							Err(e) => {
								warn!(session_id, error = ?e, "subscription registration failed");
							}
						}
					}
				}
			}
		}

		info!("session event stream ended; dispatcher stopping");
	})
}
