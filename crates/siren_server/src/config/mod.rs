#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use siren_domain::{MappedAlert, PermissionLevel, TenantId};
use siren_platform::SecretString;
use tracing::{info, warn};

use crate::server::commands::{CommandAction, CommandSpec};
use crate::server::stores::TenantSettings;

/// Default config path: `~/.siren/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".siren").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub platform: PlatformSettings,
	pub donations: DonationSettings,
	pub persistence: PersistenceSettings,
	pub tenants: Vec<(TenantId, TenantSettings)>,
	/// payer login → tenant claims, flattened from the tenant sections.
	pub payer_claims: Vec<(String, TenantId)>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Overlay websocket bind address (host:port).
	pub overlay_bind: String,
	/// Health + donation ingress HTTP bind address (host:port).
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			overlay_bind: "127.0.0.1:8090".to_string(),
			http_bind: "127.0.0.1:8091".to_string(),
			metrics_bind: None,
		}
	}
}

/// Platform (EventSub + API) settings.
#[derive(Debug, Clone, Default)]
pub struct PlatformSettings {
	/// App Client ID sent on every API call.
	pub client_id: Option<String>,
	/// Bearer token for API calls and subscription registration.
	pub token: Option<SecretString>,
	/// API base URL.
	pub api_base_url: Option<String>,
	/// EventSub websocket URL (optional override).
	pub eventsub_ws_url: Option<String>,
	/// Bot account user id, used for chat replies and eligibility probes.
	pub bot_user_id: Option<String>,
	/// Broadcaster ids to register subscriptions for. Tenant sections
	/// are appended automatically.
	pub broadcaster_ids: Vec<String>,
	/// Reconnect backoff min/max (optional).
	pub reconnect_min_delay: Option<Duration>,
	pub reconnect_max_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct DonationSettings {
	/// HMAC secret shared with the donation provider's webhook sender.
	pub webhook_secret: Option<SecretString>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Eligibility cache TTL in seconds. Zero disables caching.
	pub eligibility_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	platform: FilePlatformSettings,

	#[serde(default)]
	donations: FileDonationSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	tenants: BTreeMap<String, FileTenantSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	overlay_bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePlatformSettings {
	client_id: Option<String>,
	token: Option<String>,
	api_base_url: Option<String>,
	eventsub_ws_url: Option<String>,
	bot_user_id: Option<String>,

	#[serde(default)]
	broadcaster_ids: Vec<String>,

	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDonationSettings {
	webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	eligibility_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTenantSettings {
	/// event key → alert kind, with "none" suppressing the event.
	#[serde(default)]
	alerts: BTreeMap<String, String>,

	discord_webhook: Option<String>,

	/// Donation payer logins claimed by this tenant.
	#[serde(default)]
	payer_logins: Vec<String>,

	#[serde(default)]
	commands: Vec<FileCommandSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCommandSpec {
	name: String,
	min_permission: Option<String>,
	cooldown_secs: Option<u64>,

	/// Counter command: which counter to bump, and by how much.
	counter: Option<String>,
	delta: Option<i64>,

	/// Reply command: the bot's chat response.
	reply: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let platform = PlatformSettings {
			client_id: file.platform.client_id.filter(|s| !s.trim().is_empty()),
			token: file.platform.token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			api_base_url: file.platform.api_base_url.filter(|s| !s.trim().is_empty()),
			eventsub_ws_url: file.platform.eventsub_ws_url.filter(|s| !s.trim().is_empty()),
			bot_user_id: file.platform.bot_user_id.filter(|s| !s.trim().is_empty()),
			broadcaster_ids: file.platform.broadcaster_ids,
			reconnect_min_delay: file.platform.reconnect_min_delay_ms.map(Duration::from_millis),
			reconnect_max_delay: file.platform.reconnect_max_delay_ms.map(Duration::from_millis),
		};

		let mut tenants = Vec::with_capacity(file.tenants.len());
		let mut payer_claims = Vec::new();
		for (raw_id, tenant_file) in file.tenants {
			let tenant = TenantId::new(&raw_id).with_context(|| format!("invalid tenant id {raw_id:?}"))?;

			let mut alert_mapping = BTreeMap::new();
			for (event_key, mapped) in tenant_file.alerts {
				let mapped = MappedAlert::parse(&mapped)
					.with_context(|| format!("tenant {raw_id}: invalid alert mapping for {event_key:?}"))?;
				alert_mapping.insert(event_key, mapped);
			}

			let mut commands = Vec::with_capacity(tenant_file.commands.len());
			for cmd in tenant_file.commands {
				commands.push(command_from_file(&raw_id, cmd)?);
			}

			for payer in tenant_file.payer_logins {
				let payer = payer.trim().to_lowercase();
				if !payer.is_empty() {
					payer_claims.push((payer, tenant.clone()));
				}
			}

			tenants.push((
				tenant,
				TenantSettings {
					alert_mapping,
					commands,
					discord_webhook: tenant_file.discord_webhook.filter(|s| !s.trim().is_empty()),
				},
			));
		}

		Ok(Self {
			server: ServerSettings {
				overlay_bind: file
					.server
					.overlay_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| ServerSettings::default().overlay_bind),
				http_bind: file
					.server
					.http_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| ServerSettings::default().http_bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			platform,
			donations: DonationSettings {
				webhook_secret: file
					.donations
					.webhook_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				eligibility_ttl_secs: file.persistence.eligibility_ttl_secs,
			},
			tenants,
			payer_claims,
		})
	}
}

fn command_from_file(tenant: &str, cmd: FileCommandSpec) -> anyhow::Result<CommandSpec> {
	let name = cmd.name.trim().trim_start_matches('!').to_lowercase();
	if name.is_empty() {
		return Err(anyhow!("tenant {tenant}: command with empty name"));
	}

	let min_permission = match cmd.min_permission {
		Some(raw) => raw
			.parse::<PermissionLevel>()
			.with_context(|| format!("tenant {tenant}: command {name:?} has invalid min_permission"))?,
		None => PermissionLevel::Viewer,
	};

	let action = match (cmd.reply, cmd.counter) {
		(Some(text), None) => CommandAction::Reply { text },
		(None, Some(kind)) => CommandAction::CounterDelta {
			kind,
			delta: cmd.delta.unwrap_or(1),
		},
		(Some(_), Some(_)) => {
			return Err(anyhow!("tenant {tenant}: command {name:?} sets both reply and counter"));
		}
		(None, None) => {
			return Err(anyhow!("tenant {tenant}: command {name:?} needs either reply or counter"));
		}
	};

	Ok(CommandSpec {
		name,
		min_permission,
		cooldown: Duration::from_secs(cmd.cooldown_secs.unwrap_or(0)),
		action,
	})
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("SIREN_OVERLAY_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.overlay_bind = v;
			info!("server config: overlay_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_PLATFORM_CLIENT_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.platform.client_id = Some(v);
			info!("platform config: client_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_PLATFORM_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.platform.token = Some(SecretString::new(v));
			info!("platform config: token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_PLATFORM_API_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.platform.api_base_url = Some(v);
			info!("platform config: api_base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_EVENTSUB_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.platform.eventsub_ws_url = Some(v);
			info!("platform config: eventsub_ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_BOT_USER_ID") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.platform.bot_user_id = Some(v);
			info!("platform config: bot_user_id overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.platform.reconnect_min_delay = Some(Duration::from_millis(ms));
		info!(ms, "platform config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("SIREN_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.platform.reconnect_max_delay = Some(Duration::from_millis(ms));
		info!(ms, "platform config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("SIREN_DONATION_WEBHOOK_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.donations.webhook_secret = Some(SecretString::new(v));
			info!("donation config: webhook_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("SIREN_DB_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("SIREN_ELIGIBILITY_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.persistence.eligibility_ttl_secs = Some(secs);
		info!(secs, "persistence: eligibility_ttl_secs overridden by env");
	}

	if cfg.platform.client_id.as_ref().map(|v| !v.trim().is_empty()).unwrap_or(false) {
		info!("platform config: client_id provided by server config");
	} else {
		warn!("platform config: no client_id in server config; API calls will be rejected");
	}

	if let (Some(min), Some(max)) = (cfg.platform.reconnect_min_delay, cfg.platform.reconnect_max_delay)
		&& min > max
	{
		warn!(
			min_ms = min.as_millis(),
			max_ms = max.as_millis(),
			"platform config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		cfg.platform.reconnect_min_delay = Some(max);
		cfg.platform.reconnect_max_delay = Some(min);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(FileConfig::default()).unwrap();
		assert_eq!(cfg.server.overlay_bind, "127.0.0.1:8090");
		assert!(cfg.tenants.is_empty());
		assert!(!cfg.persistence.enabled);
	}

	#[test]
	fn tenant_sections_are_seeded() {
		let raw = r#"
			[tenants.1001]
			discord_webhook = "https://discord.example/hook"
			payer_logins = ["Alice", "bob"]

			[tenants.1001.alerts]
			"channel.follow" = "none"
			"channel.cheer" = "confetti"

			[[tenants.1001.commands]]
			name = "!deaths"
			counter = "deaths"
			min_permission = "mod"
			cooldown_secs = 10
		"#;
		let file: FileConfig = toml::from_str(raw).unwrap();
		let cfg = ServerConfig::from_file(file).unwrap();

		assert_eq!(cfg.tenants.len(), 1);
		let (tenant, settings) = &cfg.tenants[0];
		assert_eq!(tenant.as_str(), "1001");
		assert_eq!(settings.alert_mapping.get("channel.follow"), Some(&MappedAlert::Suppress));
		assert_eq!(settings.commands.len(), 1);
		assert_eq!(settings.commands[0].name, "deaths");
		assert_eq!(settings.commands[0].min_permission, PermissionLevel::Moderator);

		// payer logins are normalized to lowercase
		assert_eq!(cfg.payer_claims.len(), 2);
		assert_eq!(cfg.payer_claims[0].0, "alice");
	}

	#[test]
	fn command_needs_exactly_one_action() {
		let cmd = FileCommandSpec {
			name: "broken".to_string(),
			..Default::default()
		};
		assert!(command_from_file("1001", cmd).is_err());

		let cmd = FileCommandSpec {
			name: "both".to_string(),
			counter: Some("deaths".to_string()),
			reply: Some("hi".to_string()),
			..Default::default()
		};
		assert!(command_from_file("1001", cmd).is_err());
	}
}
