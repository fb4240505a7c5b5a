//! nsqlookupd HTTP discovery.

use std::time::Duration;

use pylon_core::{DriverError, Endpoint};
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// nsqlookupd before 1.0 wraps the body in `{status_code, data}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped { data: Producers },
    Plain(Producers),
}

pub fn http_client(timeout: Duration) -> Result<reqwest::Client, DriverError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DriverError::Other(format!("lookupd client: {e}")))
}

/// Parse a `/lookup` body into nsqd TCP endpoints.
pub fn parse_producers(body: &[u8]) -> Result<Vec<Endpoint>, DriverError> {
    let response: LookupResponse = serde_json::from_slice(body)
        .map_err(|e| DriverError::Protocol(format!("invalid lookupd response: {e}")))?;
    let producers = match response {
        LookupResponse::Wrapped { data } => data.producers,
        LookupResponse::Plain(plain) => plain.producers,
    };
    Ok(producers
        .into_iter()
        .map(|p| Endpoint {
            host: p.broadcast_address,
            port: p.tcp_port,
        })
        .collect())
}

/// nsqd endpoints currently carrying `topic`. An unknown topic has none.
pub async fn producers(
    client: &reqwest::Client,
    lookupd: &Endpoint,
    topic: &str,
) -> Result<Vec<Endpoint>, DriverError> {
    let response = client
        .get(format!("http://{lookupd}/lookup"))
        .query(&[("topic", topic)])
        .send()
        .await
        .map_err(|e| DriverError::Other(format!("lookupd {lookupd}: {e}")))?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    if !response.status().is_success() {
        return Err(DriverError::Protocol(format!(
            "lookupd {lookupd} answered {}",
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| DriverError::Other(format!("lookupd {lookupd}: {e}")))?;
    parse_producers(&body)
}
