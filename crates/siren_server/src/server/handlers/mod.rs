#![forbid(unsafe_code)]

//! Topic handlers. Each decodes its topic's event payload, maintains
//! the relevant tenant counters and feeds the alert router.

pub mod chat;
pub mod cheer;
pub mod follow;
pub mod raid;
pub mod subscribe;

use siren_domain::{ParseIdError, TenantId};

/// Derive the tenant from a decoded `broadcaster_user_id` field.
fn tenant_from_broadcaster(broadcaster_user_id: &str) -> Result<TenantId, ParseIdError> {
	TenantId::new(broadcaster_user_id)
}
