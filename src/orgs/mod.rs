//! Entitlement backends.
//!
//! Each member organization answers "may this card have a free drink" and
//! receives a report when one was dispensed. The coordinator only sees the
//! [`Org`] trait; the set and priority order of backends is fixed at startup
//! from the configured list.

use std::time::Duration;

use anyhow::Result;

use crate::config::OrgConfig;

pub mod ampel;
pub mod amiv;
pub mod vis;
pub mod vmp;

pub use ampel::AmpelProbe;

/// Shared request timeout for all membership services.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// One membership service.
pub trait Org: Send {
    fn name(&self) -> &str;

    /// True if the card is entitled to a free drink right now. `Ok(false)`
    /// covers both "unknown card" and "no credit"; errors are transport
    /// problems and let the coordinator fall through to the next org.
    fn get_status(&self, card: &str) -> Result<bool>;

    /// Report a completed dispense of `item` for `card`.
    fn report_dispensed(&self, card: &str, item: u32) -> Result<()>;
}

/// The site-wide traffic light gating all free dispenses.
pub trait TrafficLight: Send {
    /// True iff dispensing is currently allowed (green or yellow).
    fn get_status(&self) -> bool;
}

/// Build the ordered backend list from configuration.
pub fn build_registry(configs: &[OrgConfig]) -> Result<Vec<Box<dyn Org>>> {
    let mut orgs: Vec<Box<dyn Org>> = Vec::with_capacity(configs.len());
    for config in configs {
        match config {
            OrgConfig::Vis { base_url, key } => {
                orgs.push(Box::new(vis::VisClient::new(base_url.clone(), key.clone())?));
            }
            OrgConfig::Amiv {
                base_url,
                api_key,
                secret_key,
            } => {
                orgs.push(Box::new(amiv::AmivClient::new(
                    base_url.clone(),
                    api_key.clone(),
                    secret_key.clone(),
                )?));
            }
            OrgConfig::Vmp {
                status_url,
                report_url,
            } => {
                orgs.push(Box::new(vmp::VmpClient::new(
                    status_url.clone(),
                    report_url.clone(),
                )?));
            }
        }
    }
    Ok(orgs)
}
