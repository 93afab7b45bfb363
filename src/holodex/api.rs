use std::collections::HashSet;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};

use super::error::{HolodexError, Result};
use super::types::{ApiChannel, ApiVideo, ChannelRecord, StreamEvent};

const BASE_URL: &str = "https://holodex.net/api/v2";
const API_KEY_HEADER: &str = "X-APIKEY";

const INITIAL_REQUEST_DELAY: Duration = Duration::from_millis(500);
const MAX_REQUEST_DELAY: Duration = Duration::from_secs(5);
const REQUEST_DELAY_GROWTH: f64 = 1.5;
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(10);
// Bounds a runaway pagination; ~100 pages of 100 covers the full listing.
const MAX_PAGE_REQUESTS: usize = 100;

/// Grows the inter-request delay after a 429, multiplicatively with a cap.
fn next_request_delay(current: Duration) -> Duration {
    current.mul_f64(REQUEST_DELAY_GROWTH).min(MAX_REQUEST_DELAY)
}

/// REST client for the provider API. One instance owns one HTTP client,
/// bound to the engine at construction.
pub struct HolodexApi {
    client: reqwest::Client,
    base_url: String,
}

impl HolodexApi {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(api_key)
            .map_err(|e| HolodexError::Config(format!("API key is not a valid header: {}", e)))?;
        headers.insert(API_KEY_HEADER, value);

        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Paginates through the full channel listing. 429 responses slow the
    /// cadence and retry after a cool-down; any other failure aborts the
    /// fetch and returns the pages accumulated so far, so callers can merge
    /// partial results with an existing cache instead of discarding it.
    pub async fn fetch_all_channels(&self, page_size: usize) -> Vec<ChannelRecord> {
        let url = format!("{}/channels", self.base_url);
        let mut records = Vec::new();
        let mut request_delay = INITIAL_REQUEST_DELAY;
        let mut offset = 0usize;
        let mut request_count = 0usize;

        tracing::info!("Fetching channel listing from provider");

        while request_count < MAX_PAGE_REQUESTS {
            tokio::time::sleep(request_delay).await;
            request_count += 1;

            let response = match self
                .client
                .get(&url)
                .query(&[
                    ("limit", page_size.to_string()),
                    ("offset", offset.to_string()),
                    ("type", "vtuber".to_string()),
                    ("org", "All Vtubers".to_string()),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, "Channel listing request failed, keeping partial results");
                    break;
                }
            };

            match response.status() {
                StatusCode::OK => {
                    let page: Vec<ApiChannel> = match response.json().await {
                        Ok(page) => page,
                        Err(e) => {
                            tracing::warn!(error = %e, "Channel listing page failed to decode, keeping partial results");
                            break;
                        }
                    };
                    if page.is_empty() {
                        break;
                    }
                    offset += page.len();
                    records.extend(
                        page.into_iter()
                            .filter(|channel| !channel.inactive)
                            .filter_map(ApiChannel::into_record),
                    );
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    request_delay = next_request_delay(request_delay);
                    tracing::warn!(
                        delay = ?request_delay,
                        "Rate limited while fetching channel listing, cooling down"
                    );
                    tokio::time::sleep(RATE_LIMIT_COOLDOWN).await;
                }
                status => {
                    tracing::error!(status = %status, "Channel listing request rejected, keeping partial results");
                    break;
                }
            }
        }

        tracing::info!(
            channels = records.len(),
            requests = request_count,
            "Channel listing fetch finished"
        );
        records
    }

    /// Looks up a single channel by id. 404 is an ordinary miss; any other
    /// failure is logged and also reported as a miss so callers never crash
    /// on a lookup.
    pub async fn fetch_channel(&self, channel_id: &str) -> Option<ChannelRecord> {
        self.fetch_single(channel_id).await
    }

    /// Looks up a channel by its `@handle`. The resolved record carries the
    /// requested handle so the caller can index it.
    pub async fn fetch_by_handle(&self, handle: &str) -> Option<ChannelRecord> {
        let mut record = self.fetch_single(handle).await?;
        record.handle = Some(handle.to_string());
        Some(record)
    }

    async fn fetch_single(&self, key: &str) -> Option<ChannelRecord> {
        let url = format!("{}/channels/{}", self.base_url, key);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(channel = %key, error = %e, "Channel lookup request failed");
                return None;
            }
        };

        match response.status() {
            StatusCode::OK => match response.json::<ApiChannel>().await {
                Ok(channel) => channel.into_record(),
                Err(e) => {
                    tracing::error!(channel = %key, error = %e, "Channel lookup failed to decode");
                    None
                }
            },
            StatusCode::NOT_FOUND => None,
            status => {
                tracing::error!(channel = %key, status = %status, "Channel lookup rejected");
                None
            }
        }
    }

    /// Fetches the current live/upcoming streams for the tracked channels in
    /// one bulk request. Returns `None` on any failure ("no update this
    /// cycle"), which is distinct from `Some(vec![])` ("zero streams"). An
    /// empty input set short-circuits without a network call.
    pub async fn fetch_live(&self, channel_ids: &HashSet<String>) -> Option<Vec<StreamEvent>> {
        if channel_ids.is_empty() {
            tracing::debug!("No tracked channels, skipping live-status request");
            return None;
        }

        let url = format!("{}/users/live", self.base_url);
        let joined = channel_ids.iter().cloned().collect::<Vec<_>>().join(",");

        let response = match self
            .client
            .get(&url)
            .query(&[("channels", joined)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Live-status request failed");
                return None;
            }
        };

        if response.status() != StatusCode::OK {
            tracing::error!(status = %response.status(), "Live-status request rejected");
            return None;
        }

        match response.json::<Vec<ApiVideo>>().await {
            Ok(videos) => {
                let events: Vec<StreamEvent> =
                    videos.into_iter().filter_map(StreamEvent::from_api).collect();
                tracing::debug!(streams = events.len(), "Live-status fetch succeeded");
                Some(events)
            }
            Err(e) => {
                tracing::error!(error = %e, "Live-status response failed to decode");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_delay_at_least_doubles_over_three_hits() {
        let first = INITIAL_REQUEST_DELAY;
        let second = next_request_delay(first);
        let third = next_request_delay(second);
        assert!(
            third >= first * 2,
            "delay after three rate limits should at least double: {:?} -> {:?}",
            first,
            third
        );
    }

    #[test]
    fn test_request_delay_is_capped() {
        let mut delay = INITIAL_REQUEST_DELAY;
        for _ in 0..20 {
            delay = next_request_delay(delay);
        }
        assert_eq!(delay, MAX_REQUEST_DELAY);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HolodexApi::with_base_url("key", "http://localhost:9999/api/v2/").unwrap();
        assert_eq!(api.base_url, "http://localhost:9999/api/v2");
    }

    #[test]
    fn test_invalid_api_key_rejected() {
        assert!(HolodexApi::new("bad\nkey").is_err());
    }
}
