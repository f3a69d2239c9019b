//! Connection negotiation over HTTP.
//!
//! Before the socket opens, the client POSTs to `<url>/negotiate` to
//! obtain a connection id and the server's supported transfer formats.
//! Caller-supplied query parameters are percent-encoded into the URL and
//! survive into the socket URL (see [`crate::connection`]). A failed
//! negotiation aborts the connection attempt; there is no retry.

use reqwest::Url;
use serde::Deserialize;

use crate::error::HubError;

/// Result of the negotiate round trip. Immutable once stored.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiateResponse {
    /// Opaque connection identifier, appended to the socket URL.
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    /// Transfer formats the server supports (e.g. `"Text"`, `"Binary"`).
    #[serde(rename = "transferFormats", default)]
    pub transfer_formats: Vec<String>,
}

/// Build the negotiate endpoint URL with each query value percent-encoded.
pub fn negotiate_url(base: &str, query: &[(String, String)]) -> Result<Url, HubError> {
    let mut url = Url::parse(base)
        .map_err(|e| HubError::Negotiate(format!("invalid hub URL '{base}': {e}")))?;

    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);

    for (key, value) in query {
        url.query_pairs_mut().append_pair(key, value);
    }

    Ok(url)
}

/// POST the negotiate request and parse the response payload.
pub async fn negotiate(client: &reqwest::Client, url: Url) -> Result<NegotiateResponse, HubError> {
    log::debug!("Negotiating connection at {url}");

    let response = client
        .post(url.clone())
        .send()
        .await
        .map_err(|e| HubError::Negotiate(format!("request to {url} failed: {e}")))?;

    if !response.status().is_success() {
        return Err(HubError::Negotiate(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    let negotiated: NegotiateResponse = response
        .json()
        .await
        .map_err(|e| HubError::Negotiate(format!("unusable negotiate payload: {e}")))?;

    log::debug!("Negotiated connection id {}", negotiated.connection_id);
    Ok(negotiated)
}
