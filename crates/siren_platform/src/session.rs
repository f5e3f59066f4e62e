#![forbid(unsafe_code)]

//! Persistent websocket ingestion session.
//!
//! One session owns one upstream socket and survives the full lifetime
//! of the process: it reconnects with capped exponential backoff, runs
//! the server-initiated migration dance without losing events, and
//! enforces the keepalive contract with a watchdog. Protocol-fatal
//! conditions (subscription revocation) terminate the session instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
	SessionControl, SessionControlRx, SessionControlTx, SessionEvent, SessionEventRx, SessionEventTx, SessionState,
	bounded_session_channels, eventsub, status, status_error,
};

pub type EventWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Injectable ws connector (tests swap in loopback servers).
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<EventWs>> + Send + Sync>;

/// Ingestion session configuration.
#[derive(Clone)]
pub struct SessionConfig {
	pub ws_url: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub migration_buffer_capacity: usize,
	pub ws_connector: Option<WsConnector>,
}

impl SessionConfig {
	pub fn new(ws_url: impl Into<String>) -> Self {
		Self {
			ws_url: ws_url.into(),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			migration_buffer_capacity: 256,
			ws_connector: None,
		}
	}
}

struct MigrationState {
	reconnect_url: Option<String>,
	ws2: Option<EventWs>,
}

/// The persistent event ingestion session.
pub struct EventIngestionSession {
	cfg: SessionConfig,
}

/// Control side of a spawned session. The event stream is handed out
/// separately so a dispatcher can own it outright.
pub struct SessionHandle {
	control_tx: SessionControlTx,
	task: JoinHandle<anyhow::Result<()>>,
}

impl SessionHandle {
	/// Request a graceful stop and wait for the run loop to finish.
	///
	/// Safe to call whatever state the session is in; a session that
	/// already terminated just reports its run result.
	pub async fn stop(self) -> anyhow::Result<()> {
		let _ = self.control_tx.send(SessionControl::Stop).await;
		self.task.await.context("join session task")?
	}
}

impl EventIngestionSession {
	pub fn new(cfg: SessionConfig) -> Self {
		Self { cfg }
	}

	/// Start the run loop on a fresh task. The session connects lazily;
	/// spawning twice is prevented by `self` being consumed here.
	pub fn spawn(self, control_capacity: usize, events_capacity: usize) -> (SessionHandle, SessionEventRx) {
		let (control_tx, control_rx, events_tx, events_rx) = bounded_session_channels(control_capacity, events_capacity);
		let task = tokio::spawn(self.run(control_rx, events_tx));
		(SessionHandle { control_tx, task }, events_rx)
	}

	fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
		let pow = attempt.min(16);
		let ms = min.as_millis().saturating_mul(1u128 << pow);
		let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
		d.min(max).max(min)
	}

	async fn connect_event_ws(url: Url) -> anyhow::Result<EventWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to event ws")?;
		Ok(ws)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move { Self::connect_event_ws(url).await }) as BoxFuture<'static, anyhow::Result<EventWs>>
		})
	}

	fn ws_url_from_string(raw: &str) -> anyhow::Result<Url> {
		Url::parse(raw).with_context(|| format!("parse ws url: {raw}"))
	}

	async fn read_until_welcome(ws: &mut EventWs) -> anyhow::Result<eventsub::EventSubWelcomeSession> {
		loop {
			let Some(msg) = ws.next().await else {
				return Err(anyhow::anyhow!("ws closed before welcome"));
			};
			let msg = msg.context("ws read")?;

			match msg {
				Message::Text(t) => {
					let ty = eventsub::peek_message_type(&t)?;
					if ty == "session_welcome" {
						let welcome = eventsub::parse_welcome(&t)?;
						return Ok(welcome.payload.session);
					}
				}
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					anyhow::bail!("ws closed before welcome: close={c:?}");
				}
				_ => {}
			}
		}
	}

	fn forward_notification(raw: &str, events_tx: &SessionEventTx, dropped: &mut u64) {
		match eventsub::try_normalize_notification(raw) {
			Ok(Some(ev)) => {
				metrics::counter!("siren_session_notifications_total").increment(1);
				if events_tx.try_send(SessionEvent::Inbound(Box::new(ev))).is_err() {
					*dropped = dropped.saturating_add(1);
					metrics::counter!("siren_session_dropped_events_total").increment(1);
				}
			}
			Ok(None) => {}
			Err(e) => {
				let _ = events_tx.try_send(status_error(SessionState::Connected, "failed to parse notification", e));
			}
		}
	}

	/// Run until `Stop` or a protocol-fatal condition.
	pub async fn run(self, mut control_rx: SessionControlRx, events_tx: SessionEventTx) -> anyhow::Result<()> {
		let _ = events_tx.try_send(status(SessionState::Disconnected, None, "ingestion session starting"));

		let connector = self.ws_connector();
		let mut reconnect_attempt: u32 = 0;
		let mut current_ws_url = self.cfg.ws_url.clone();

		'outer: loop {
			let ws_url = match Self::ws_url_from_string(&current_ws_url) {
				Ok(u) => u,
				Err(e) => {
					let _ = events_tx.try_send(status_error(
						SessionState::Closed,
						format!("invalid event ws url: {current_ws_url}"),
						&e,
					));
					return Err(e);
				}
			};

			let delay = if reconnect_attempt == 0 {
				Duration::from_millis(0)
			} else {
				Self::backoff_delay(reconnect_attempt, self.cfg.reconnect_min_delay, self.cfg.reconnect_max_delay)
			};

			if delay > Duration::from_millis(0) {
				let _ = events_tx.try_send(status(
					SessionState::Connecting,
					None,
					format!("reconnecting in {delay:?} (attempt={reconnect_attempt})"),
				));
				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						if matches!(cmd, Some(SessionControl::Stop) | None) {
							break 'outer;
						}
					}
				}
			} else {
				let _ = events_tx.try_send(status(SessionState::Connecting, None, "connecting to event ws"));
			}

			// Stop must interrupt an in-flight connect and welcome read.
			let connected = tokio::select! {
				res = async {
					let mut ws = connector(ws_url.clone()).await?;
					let welcome = Self::read_until_welcome(&mut ws).await?;
					anyhow::Ok((ws, welcome))
				} => res,
				cmd = control_rx.recv() => {
					if matches!(cmd, Some(SessionControl::Stop) | None) {
						break 'outer;
					}
					continue;
				}
			};

			let (mut ws, welcome) = match connected {
				Ok(pair) => pair,
				Err(e) => {
					reconnect_attempt = reconnect_attempt.saturating_add(1);
					metrics::counter!("siren_session_reconnects_total").increment(1);
					let _ = events_tx.try_send(status_error(SessionState::Connecting, "failed to establish event ws", e));
					continue;
				}
			};

			reconnect_attempt = 0;

			let mut session_id = welcome.id.clone();
			let mut keepalive_secs = welcome.keepalive_timeout_seconds.unwrap_or(10);
			let mut keepalive_timeout = Duration::from_secs(keepalive_secs);

			info!(%session_id, keepalive_secs, "event ws connected");
			let _ = events_tx.try_send(status(
				SessionState::Connected,
				Some(session_id.clone()),
				format!("connected (keepalive={keepalive_secs}s)"),
			));

			let mut last_activity_main = Instant::now();
			let mut migrating: Option<MigrationState> = None;
			let mut buffered_secondary: VecDeque<String> = VecDeque::new();
			let mut dropped_events: u64 = 0;

			loop {
				let mig_should_connect = migrating
					.as_ref()
					.is_some_and(|m| m.reconnect_url.is_some() && m.ws2.is_none());
				let mig_is_connected = migrating.as_ref().is_some_and(|m| m.ws2.is_some());

				tokio::select! {
					cmd = control_rx.recv() => {
						if matches!(cmd, Some(SessionControl::Stop) | None) {
							info!("ingestion session received Stop");
							let _ = ws.close(None).await;
							break 'outer;
						}
					}

					msg = ws.next() => {
						let Some(msg) = msg else {
							let _ = events_tx.try_send(status(SessionState::Connecting, None, "event ws ended"));
							current_ws_url = self.cfg.ws_url.clone();
							break;
						};

						let msg = match msg {
							Ok(m) => m,
							Err(e) => {
								let _ = events_tx.try_send(status_error(SessionState::Connecting, "event ws read error", e));
								current_ws_url = self.cfg.ws_url.clone();
								break;
							}
						};

						match msg {
							Message::Text(t) => {
								last_activity_main = Instant::now();

								let ty = eventsub::peek_message_type(&t).unwrap_or_default();
								match ty.as_str() {
									"session_keepalive" => {
										debug!("event ws keepalive");
									}
									"session_reconnect" => {
										if migrating.is_none()
											&& let Ok(reconnect_msg) = eventsub::parse_reconnect(&t)
										{
											let url = reconnect_msg.payload.session.reconnect_url;
											let _ = events_tx.try_send(status(
												SessionState::Reconnecting,
												Some(session_id.clone()),
												"received session_reconnect; starting migration",
											));

											migrating = Some(MigrationState {
												reconnect_url: Some(url),
												ws2: None,
											});
											buffered_secondary.clear();
										}
									}
									"notification" => {
										Self::forward_notification(&t, &events_tx, &mut dropped_events);
									}
									"revocation" => {
										let detail = match eventsub::parse_revocation(&t) {
											Ok(rev) => format!(
												"subscription revoked: type={} status={}",
												rev.payload.subscription.r#type, rev.payload.subscription.status
											),
											Err(_) => "subscription revoked".to_string(),
										};
										warn!(%detail, "event ws revocation; closing session");
										let _ = events_tx.try_send(status_error(
											SessionState::Closed,
											"revocation received",
											&detail,
										));
										let _ = ws.close(None).await;
										return Err(anyhow::anyhow!(detail));
									}
									_ => {}
								}
							}

							Message::Ping(p) => {
								last_activity_main = Instant::now();
								let _ = ws.send(Message::Pong(p)).await;
							}

							Message::Pong(_) => {
								last_activity_main = Instant::now();
							}

							Message::Close(frame) => {
								let _ = events_tx.try_send(status(
									SessionState::Connecting,
									None,
									format!("event ws closed: {frame:?}"),
								));
								current_ws_url = self.cfg.ws_url.clone();
								break;
							}

							_ => {}
						}
					}

					_ = sleep(Duration::from_millis(0)), if mig_should_connect => {
						let Some(reconnect_url) = migrating.as_mut().and_then(|m| m.reconnect_url.take()) else {
							continue;
						};

						let url = match Self::ws_url_from_string(&reconnect_url) {
							Ok(u) => u,
							Err(e) => {
								let _ = events_tx.try_send(status_error(
									SessionState::Reconnecting,
									format!("invalid reconnect_url: {reconnect_url}"),
									e,
								));
								current_ws_url = self.cfg.ws_url.clone();
								break;
							}
						};

						match connector(url).await {
							Ok(new_ws) => {
								let _ = events_tx.try_send(status(
									SessionState::Reconnecting,
									Some(session_id.clone()),
									"migration: connected to reconnect_url; waiting for welcome",
								));
								if let Some(m) = &mut migrating {
									m.ws2 = Some(new_ws);
								}
							}
							Err(e) => {
								let _ = events_tx.try_send(status_error(
									SessionState::Connecting,
									"migration: failed to connect to reconnect_url",
									e,
								));
								current_ws_url = self.cfg.ws_url.clone();
								break;
							}
						}
					}

					msg2 = async {
						if let Some(m) = &mut migrating
							&& let Some(ws2) = &mut m.ws2
						{
							let next: Option<Result<Message, tokio_tungstenite::tungstenite::Error>> = ws2.next().await;
							return next;
						}
						None
					}, if mig_is_connected => {
						let Some(msg2) = msg2 else {
							let _ = events_tx.try_send(status(
								SessionState::Connected,
								Some(session_id.clone()),
								"migration: secondary socket ended; continuing on primary",
							));
							migrating = None;
							buffered_secondary.clear();
							continue;
						};

						let msg2 = match msg2 {
							Ok(m) => m,
							Err(e) => {
								let _ = events_tx.try_send(status_error(
									SessionState::Connected,
									"migration: secondary ws read error; continuing on primary",
									e,
								));
								migrating = None;
								buffered_secondary.clear();
								continue;
							}
						};

						if let Some(m) = &mut migrating {
							match msg2 {
								Message::Text(t) => {
									let ty = eventsub::peek_message_type(&t).unwrap_or_default();

									if ty == "session_welcome" {
										let welcome2 = match eventsub::parse_welcome(&t) {
											Ok(w) => w,
											Err(e) => {
												let _ = events_tx.try_send(status_error(
													SessionState::Connected,
													"migration: failed to parse session_welcome on secondary",
													e,
												));
												migrating = None;
												buffered_secondary.clear();
												continue;
											}
										};

										session_id = welcome2.payload.session.id;
										keepalive_secs = welcome2.payload.session.keepalive_timeout_seconds.unwrap_or(10);
										keepalive_timeout = Duration::from_secs(keepalive_secs);

										// Old socket is only abandoned once the
										// replacement has welcomed us.
										let _ = ws.close(None).await;
										if let Some(new_primary) = m.ws2.take() {
											ws = new_primary;
										}
										last_activity_main = Instant::now();

										metrics::counter!("siren_session_migrations_total").increment(1);
										let _ = events_tx.try_send(status(
											SessionState::Connected,
											Some(session_id.clone()),
											format!("migration complete (keepalive={keepalive_secs}s)"),
										));

										// Buffered notifications follow the
										// migration-complete status, in order.
										while let Some(raw) = buffered_secondary.pop_front() {
											Self::forward_notification(&raw, &events_tx, &mut dropped_events);
										}

										migrating = None;
										buffered_secondary.clear();
									} else if ty == "notification" {
										if buffered_secondary.len() >= self.cfg.migration_buffer_capacity {
											let _ = buffered_secondary.pop_front();
										}
										buffered_secondary.push_back(t.to_string());
									}
								}
								Message::Ping(p) => {
									if let Some(ws2) = &mut m.ws2 {
										let _ = ws2.send(Message::Pong(p)).await;
									}
								}
								Message::Close(frame) => {
									let _ = events_tx.try_send(status(
										SessionState::Connected,
										Some(session_id.clone()),
										format!("migration: secondary closed: {frame:?}; continuing on primary"),
									));
									migrating = None;
									buffered_secondary.clear();
								}
								_ => {}
							}
						}
					}

					_ = sleep(keepalive_timeout) => {
						if last_activity_main.elapsed() > keepalive_timeout {
							warn!("keepalive watchdog triggered; reconnecting");
							let _ = events_tx.try_send(status(
								SessionState::Connecting,
								None,
								"keepalive watchdog triggered; reconnecting",
							));
							current_ws_url = self.cfg.ws_url.clone();
							break;
						}
					}
				}
			}

			if dropped_events > 0 {
				warn!(dropped_events, "session dropped inbound events under backpressure");
			}

			reconnect_attempt = reconnect_attempt.saturating_add(1);
		}

		let _ = events_tx.try_send(status(SessionState::Closed, None, "ingestion session stopped"));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn backoff_delay_is_capped_and_floored() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);

		assert_eq!(EventIngestionSession::backoff_delay(0, min, max), min);
		assert_eq!(EventIngestionSession::backoff_delay(1, min, max), Duration::from_secs(1));
		assert_eq!(EventIngestionSession::backoff_delay(2, min, max), Duration::from_secs(2));
		assert_eq!(EventIngestionSession::backoff_delay(16, min, max), max);
		assert_eq!(EventIngestionSession::backoff_delay(u32::MAX, min, max), max);
	}

	#[test]
	fn backoff_delay_handles_inverted_bounds() {
		// min > max still yields something within [max, min].
		let d = EventIngestionSession::backoff_delay(3, Duration::from_secs(10), Duration::from_secs(1));
		assert_eq!(d, Duration::from_secs(10));
	}
}
