//! VMP coffee check/billing endpoints.

use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{Org, HTTP_TIMEOUT};

#[derive(Debug, Deserialize)]
struct VmpStatus {
    status: i64,
}

pub struct VmpClient {
    client: Client,
    status_url: String,
    report_url: String,
}

impl VmpClient {
    pub fn new(status_url: String, report_url: String) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            status_url,
            report_url,
        })
    }
}

impl Org for VmpClient {
    fn name(&self) -> &str {
        "VMP"
    }

    fn get_status(&self, card: &str) -> Result<bool> {
        let response = self
            .client
            .get(&self.status_url)
            .query(&[("rfidnr", card)])
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            log::warn!("VMP status url returned {}", response.status());
            return Ok(false);
        }
        // status 0 means the card may draw a coffee
        let body: VmpStatus = response.json()?;
        Ok(body.status == 0)
    }

    fn report_dispensed(&self, card: &str, item: u32) -> Result<()> {
        log::info!("dispensed {item} for {card}, VMP");
        let slot_id = item.to_string();
        let response = self
            .client
            .get(&self.report_url)
            .query(&[("rfidnr", card), ("slot_id", slot_id.as_str())])
            .send()?;
        if !response.status().is_success() {
            log::warn!("VMP report url returned {}", response.status());
        }
        Ok(())
    }
}
