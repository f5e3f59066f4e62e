#![forbid(unsafe_code)]

pub mod alert_router;
pub mod commands;
pub mod connection;
pub mod dispatcher;
pub mod donations;
pub mod eligibility;
pub mod handlers;
pub mod http;
pub mod overlay_hub;
pub mod registry;
pub mod stores;



#[cfg(test)]
mod donations_tests;

#[cfg(test)]
mod eligibility_tests;

#[cfg(test)]
mod overlay_hub_tests;

#[cfg(test)]
mod registry_tests;
