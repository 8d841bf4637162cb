//! The site traffic light ("Ampel") gating all free dispenses.

use anyhow::Result;
use reqwest::blocking::Client;

use super::{TrafficLight, HTTP_TIMEOUT};

pub struct AmpelProbe {
    client: Client,
    url: String,
}

impl AmpelProbe {
    pub fn new(host: &str, suffix: &str) -> Result<Self> {
        Self::from_url(format!("https://{host}{suffix}"))
    }

    pub fn from_url(url: String) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send()?.error_for_status()?;
        Ok(response.text()?.trim().to_lowercase())
    }
}

impl TrafficLight for AmpelProbe {
    fn get_status(&self) -> bool {
        match self.fetch() {
            Ok(colour) => {
                log::info!("ampel is {colour}");
                colour == "green" || colour == "yellow"
            }
            Err(e) => {
                log::warn!("ampel probe failed: {e}");
                false
            }
        }
    }
}
