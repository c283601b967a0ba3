use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    parse_envelopes, DirectoryClient, DirectoryResult, SearchQuery, SendFromVaultRequest,
    SendToVaultRequest, TxnEnvelope, View,
};
use crate::error::DirectoryError;
use crate::model::CandidateRecord;

type ApiRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the public NFD REST API.
pub struct NfdApiClient {
    http: HttpClient,
    base_url: String,
    rate_limiter: Option<Arc<ApiRateLimiter>>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    nfds: Option<Vec<CandidateRecord>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody {
    #[serde(default)]
    secs_remaining: u64,
}

#[derive(Deserialize)]
struct MessageBody {
    message: String,
}

impl NfdApiClient {
    /// `requests_per_second` paces every call client-side when set.
    pub fn new(base_url: &str, requests_per_second: Option<u32>) -> DirectoryResult<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DirectoryError::Other(e.to_string()))?;
        let rate_limiter = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        let base_url = base_url.trim_end_matches('/').to_string();
        info!(url = %base_url, paced = rate_limiter.is_some(), "Using NFD api");
        Ok(Self {
            http,
            base_url,
            rate_limiter,
        })
    }

    async fn send(&self, req: RequestBuilder) -> DirectoryResult<Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
        let resp = req
            .send()
            .await
            .map_err(|e| DirectoryError::Transient(e.to_string()))?;
        Self::check(resp).await
    }

    async fn check(resp: Response) -> DirectoryResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String, query: &[(&str, String)]) -> DirectoryResult<T> {
        debug!(%url, "GET");
        let resp = self.send(self.http.get(url).query(query)).await?;
        resp.json::<T>()
            .await
            .map_err(|e| DirectoryError::Other(format!("unexpected response: {}", e)))
    }

    async fn post_for_envelopes<B: serde::Serialize>(&self, url: String, body: &B) -> DirectoryResult<Vec<TxnEnvelope>> {
        debug!(%url, "POST");
        let resp = self.send(self.http.post(url).json(body)).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| DirectoryError::Transient(e.to_string()))?;
        parse_envelopes(&text)
    }
}

/// Map a non-success response onto the tagged error the retry layer understands.
fn classify_failure(status: StatusCode, body: &str) -> DirectoryError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        // some proxies answer with a plain "429 Too Many Requests"
        let secs_remaining = serde_json::from_str::<RateLimitBody>(body)
            .map(|b| b.secs_remaining)
            .unwrap_or(0);
        return DirectoryError::RateLimited { secs_remaining };
    }
    if status.is_server_error() {
        return DirectoryError::Transient(format!("status {}: {}", status.as_u16(), body.trim()));
    }
    match serde_json::from_str::<MessageBody>(body) {
        Ok(b) => DirectoryError::Api { message: b.message },
        Err(_) => DirectoryError::Other(format!("status {}: {}", status.as_u16(), body.trim())),
    }
}

#[async_trait]
impl DirectoryClient for NfdApiClient {
    async fn get_record(&self, name: &str, view: View) -> DirectoryResult<CandidateRecord> {
        self.get_json(
            format!("{}/nfd/{}", self.base_url, name),
            &[("view", view.as_str().to_string())],
        )
        .await
    }

    async fn search(&self, query: &SearchQuery) -> DirectoryResult<Vec<CandidateRecord>> {
        let mut params = vec![
            ("state", "owned".to_string()),
            ("view", query.view.as_str().to_string()),
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
        ];
        if query.only_roots {
            params.push(("traits", "pristine".to_string()));
        }
        if let Some(parent) = query.parent_app_id {
            params.push(("parentAppID", parent.to_string()));
        }
        let resp: SearchResponse = self
            .get_json(format!("{}/nfd/v2/search", self.base_url), &params)
            .await?;
        Ok(resp.nfds.unwrap_or_default())
    }

    async fn send_from_vault(
        &self,
        vault: &str,
        request: &SendFromVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>> {
        self.post_for_envelopes(
            format!("{}/nfd/vault/sendFrom/{}", self.base_url, vault),
            request,
        )
        .await
    }

    async fn send_to_vault(
        &self,
        name: &str,
        request: &SendToVaultRequest,
    ) -> DirectoryResult<Vec<TxnEnvelope>> {
        self.post_for_envelopes(
            format!("{}/nfd/vault/sendTo/{}", self.base_url, name),
            request,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_body() {
        let err = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"limit": 10, "secsRemaining": 7}"#,
        );
        assert_eq!(err, DirectoryError::RateLimited { secs_remaining: 7 });
    }

    #[test]
    fn test_rate_limit_plain_text() {
        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "429 Too Many Requests");
        assert_eq!(err, DirectoryError::RateLimited { secs_remaining: 0 });
    }

    #[test]
    fn test_api_message_surfaced() {
        let err = classify_failure(StatusCode::NOT_FOUND, r#"{"name":"notFound","message":"nfd not found"}"#);
        assert_eq!(
            err,
            DirectoryError::Api {
                message: "nfd not found".into()
            }
        );
    }

    #[test]
    fn test_server_errors_are_transient() {
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, "<html>"),
            DirectoryError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, "nope"),
            DirectoryError::Other(_)
        ));
    }

    #[test]
    fn test_search_body_null_list() {
        let resp: SearchResponse = serde_json::from_str(r#"{"nfds": null, "total": 0}"#).unwrap();
        assert!(resp.nfds.unwrap_or_default().is_empty());
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = NfdApiClient::new("https://api.testnet.nf.domains/", Some(5)).unwrap();
        assert_eq!(client.base_url, "https://api.testnet.nf.domains");
        assert!(client.rate_limiter.is_some());
    }
}
