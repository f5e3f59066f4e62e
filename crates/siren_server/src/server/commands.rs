#![forbid(unsafe_code)]

//! Chat command processing.
//!
//! Gate order is fixed: permission first, then cooldown, then
//! execution. An attempt rejected by either gate never arms or
//! re-arms the cooldown, so a viewer hammering a mod-only command
//! cannot lock moderators out of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use siren_domain::{PermissionLevel, TenantId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::eligibility::{Eligibility, EligibilityService};
use super::overlay_hub::{OverlayFrame, OverlayHub};
use super::stores::{ChatSink, CounterStore, TenantConfigStore};

/// One configured chat command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
	/// Name without the `!` prefix, lowercase.
	pub name: String,
	pub min_permission: PermissionLevel,
	pub cooldown: Duration,
	pub action: CommandAction,
}

#[derive(Debug, Clone)]
pub enum CommandAction {
	/// Bump a tenant counter and push the update to overlays.
	CounterDelta { kind: String, delta: i64 },

	/// Reply in chat through the bot account.
	Reply { text: String },
}

/// The chatter attempting a command.
#[derive(Debug, Clone)]
pub struct Chatter {
	pub user_id: String,
	pub login: String,
	pub level: PermissionLevel,
}

/// What happened to one chat line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
	NotACommand,
	UnknownCommand,
	PermissionDenied,
	OnCooldown,
	Executed,
}

pub struct ChatCommandProcessor {
	tenants: Arc<dyn TenantConfigStore>,
	counters: Arc<dyn CounterStore>,
	chat: Arc<dyn ChatSink>,
	eligibility: Arc<EligibilityService>,
	hub: OverlayHub,
	bot_user_id: String,
	cooldowns: Mutex<HashMap<(TenantId, String), Instant>>,
}

impl ChatCommandProcessor {
	pub fn new(
		tenants: Arc<dyn TenantConfigStore>,
		counters: Arc<dyn CounterStore>,
		chat: Arc<dyn ChatSink>,
		eligibility: Arc<EligibilityService>,
		hub: OverlayHub,
		bot_user_id: impl Into<String>,
	) -> Self {
		Self {
			tenants,
			counters,
			chat,
			eligibility,
			hub,
			bot_user_id: bot_user_id.into(),
			cooldowns: Mutex::new(HashMap::new()),
		}
	}

	/// Process one chat line for one tenant.
	pub async fn process(&self, tenant: &TenantId, chatter: &Chatter, text: &str) -> CommandOutcome {
		let Some(name) = parse_command_name(text) else {
			return CommandOutcome::NotACommand;
		};

		let specs = match self.tenants.commands(tenant).await {
			Ok(specs) => specs,
			Err(e) => {
				warn!(%tenant, error = ?e, "failed to load command config");
				Vec::new()
			}
		};

		let Some(spec) = specs.iter().find(|s| s.name == name) else {
			debug!(%tenant, command = %name, "unknown command ignored");
			return CommandOutcome::UnknownCommand;
		};

		// Permission outranks cooldown: denied attempts are invisible
		// to the cooldown state.
		if chatter.level < spec.min_permission {
			debug!(%tenant, command = %name, chatter = %chatter.login, "command permission denied");
			metrics::counter!("siren_commands_denied_total").increment(1);
			return CommandOutcome::PermissionDenied;
		}

		let now = Instant::now();
		let key = (tenant.clone(), spec.name.clone());
		{
			let mut cooldowns = self.cooldowns.lock().await;
			if let Some(armed_at) = cooldowns.get(&key)
				&& now.duration_since(*armed_at) < spec.cooldown
			{
				// Ignored attempts do not refresh the window.
				debug!(%tenant, command = %name, "command on cooldown");
				metrics::counter!("siren_commands_cooldown_total").increment(1);
				return CommandOutcome::OnCooldown;
			}
			cooldowns.insert(key, now);
		}

		self.execute(tenant, spec).await;
		metrics::counter!("siren_commands_executed_total").increment(1);
		CommandOutcome::Executed
	}

	async fn execute(&self, tenant: &TenantId, spec: &CommandSpec) {
		match &spec.action {
			CommandAction::CounterDelta { kind, delta } => {
				match self.counters.increment(tenant, kind, *delta).await {
					Ok(value) => {
						self.hub
							.broadcast(
								tenant,
								OverlayFrame::CounterUpdate {
									kind: kind.clone(),
									value,
								},
							)
							.await;
					}
					Err(e) => {
						warn!(%tenant, command = %spec.name, error = ?e, "counter increment failed");
					}
				}
			}
			CommandAction::Reply { text } => {
				// The tenant id doubles as the broadcaster user id.
				match self.eligibility.check(tenant.as_str(), &self.bot_user_id).await {
					Eligibility::Allowed => {
						if let Err(e) = self.chat.send_chat(tenant, text).await {
							warn!(%tenant, command = %spec.name, error = ?e, "chat reply failed");
						}
					}
					Eligibility::Denied | Eligibility::Unknown => {
						debug!(%tenant, command = %spec.name, "bot not eligible; reply skipped");
					}
				}
			}
		}
	}
}

/// Extract a lowercase command name from a chat line, if it is one.
fn parse_command_name(text: &str) -> Option<String> {
	let rest = text.trim().strip_prefix('!')?;
	let name = rest.split_whitespace().next()?;
	if name.is_empty() {
		return None;
	}
	Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn command_name_parsing() {
		assert_eq!(parse_command_name("!deaths"), Some("deaths".to_string()));
		assert_eq!(parse_command_name("  !Deaths add  "), Some("deaths".to_string()));
		assert_eq!(parse_command_name("hello there"), None);
		assert_eq!(parse_command_name("!"), None);
		assert_eq!(parse_command_name(""), None);
	}
}
