//! VIS coffee endpoints.

use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::StatusCode;

use super::{Org, HTTP_TIMEOUT};

pub struct VisClient {
    client: Client,
    base_url: String,
    key: String,
}

impl VisClient {
    pub fn new(base_url: String, key: String) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        })
    }
}

impl Org for VisClient {
    fn name(&self) -> &str {
        "VIS"
    }

    fn get_status(&self, card: &str) -> Result<bool> {
        let url = format!("{}/coffee/status/{card}", self.base_url);
        log::debug!("looking up status at {url}");
        let response = self.client.get(&url).query(&[("key", &self.key)]).send()?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            log::warn!("VIS status url returned {}", response.status());
            return Ok(false);
        }
        // the status route answers with the remaining free-drink count
        let count: i64 = response.json()?;
        Ok(count > 0)
    }

    fn report_dispensed(&self, card: &str, item: u32) -> Result<()> {
        log::info!("dispensed {item} for {card}, VIS");
        let url = format!("{}/coffee/dispensed/{card}", self.base_url);
        let item = item.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("key", self.key.as_str()), ("item", item.as_str())])
            .send()?;
        if !response.status().is_success() {
            log::warn!("VIS report url returned {}", response.status());
        }
        Ok(())
    }
}
