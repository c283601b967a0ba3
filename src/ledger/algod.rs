use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{AccountBalance, AssetParams, LedgerClient, LedgerResult, SuggestedParams};
use crate::error::LedgerError;

const TOKEN_HEADER: &str = "X-Algo-API-Token";

/// algod REST client.
pub struct AlgodClient {
    http: HttpClient,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct AssetResponse {
    params: AssetParamsBody,
}

#[derive(Deserialize)]
struct AssetParamsBody {
    #[serde(default)]
    decimals: u32,
    #[serde(rename = "unit-name", default)]
    unit_name: String,
}

#[derive(Deserialize)]
struct AccountAssetResponse {
    #[serde(rename = "asset-holding")]
    asset_holding: HoldingBody,
}

#[derive(Deserialize)]
struct HoldingBody {
    #[serde(default)]
    amount: u64,
}

#[derive(Deserialize)]
struct AccountResponse {
    amount: u64,
    #[serde(rename = "min-balance", default)]
    min_balance: u64,
}

#[derive(Deserialize)]
struct ParamsResponse {
    #[serde(rename = "genesis-hash")]
    genesis_hash: String,
    #[serde(rename = "genesis-id")]
    genesis_id: String,
    #[serde(rename = "last-round")]
    last_round: u64,
    #[serde(rename = "min-fee")]
    min_fee: u64,
}

#[derive(Deserialize)]
struct PostTransactionResponse {
    #[serde(rename = "txId")]
    tx_id: String,
}

#[derive(Deserialize)]
struct PendingResponse {
    #[serde(rename = "confirmed-round", default)]
    confirmed_round: u64,
    #[serde(rename = "pool-error", default)]
    pool_error: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(rename = "last-round")]
    last_round: u64,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl AlgodClient {
    pub fn new(base_url: &str, token: &str) -> LedgerResult<Self> {
        let mut base_url = base_url.trim_end_matches('/').to_string();
        if let Some(rest) = base_url.strip_prefix("tcp://") {
            base_url = format!("http://{}", rest);
        }
        let http = HttpClient::builder()
            .pool_max_idle_per_host(100)
            // wait-for-block-after can hold the request for a while
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        info!(url = %base_url, "Connecting to algod");
        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if !self.token.is_empty() {
            req = req.header(TOKEN_HEADER, &self.token);
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> LedgerResult<T> {
        let resp = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Self::decode(Self::check(resp).await?).await
    }

    async fn check(resp: Response) -> LedgerResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(LedgerError::RateLimited),
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                Err(LedgerError::Unavailable {
                    status: status.as_u16(),
                })
            }
            _ => {
                let body = resp.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ErrorBody>(&body)
                    .map(|b| b.message)
                    .unwrap_or(body);
                Err(LedgerError::Rejected {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> LedgerResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }

    async fn status(&self) -> LedgerResult<u64> {
        let status: StatusResponse = self.get_json("/v2/status").await?;
        Ok(status.last_round)
    }
}

#[async_trait]
impl LedgerClient for AlgodClient {
    async fn asset_params(&self, asset_id: u64) -> LedgerResult<AssetParams> {
        let asset: AssetResponse = self.get_json(&format!("/v2/assets/{}", asset_id)).await?;
        Ok(AssetParams {
            decimals: asset.params.decimals,
            unit_name: asset.params.unit_name,
        })
    }

    async fn asset_holding(&self, account: &str, asset_id: u64) -> LedgerResult<u64> {
        let holding: AccountAssetResponse = self
            .get_json(&format!("/v2/accounts/{}/assets/{}", account, asset_id))
            .await?;
        Ok(holding.asset_holding.amount)
    }

    async fn account_balance(&self, account: &str) -> LedgerResult<AccountBalance> {
        let info: AccountResponse = self
            .get_json(&format!("/v2/accounts/{}?exclude=all", account))
            .await?;
        Ok(AccountBalance {
            amount: info.amount,
            min_balance: info.min_balance,
        })
    }

    async fn suggested_params(&self) -> LedgerResult<SuggestedParams> {
        let params: ParamsResponse = self.get_json("/v2/transactions/params").await?;
        let hash = STANDARD
            .decode(params.genesis_hash.as_bytes())
            .map_err(|e| LedgerError::Decode(format!("genesis hash: {}", e)))?;
        let genesis_hash: [u8; 32] = hash
            .try_into()
            .map_err(|_| LedgerError::Decode("genesis hash is not 32 bytes".into()))?;
        Ok(SuggestedParams::from_node(
            params.last_round,
            params.min_fee,
            params.genesis_id,
            genesis_hash,
        ))
    }

    async fn send_raw(&self, signed: &[u8]) -> LedgerResult<String> {
        let resp = self
            .request(Method::POST, "/v2/transactions")
            .header(reqwest::header::CONTENT_TYPE, "application/x-binary")
            .body(signed.to_vec())
            .send()
            .await
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        let posted: PostTransactionResponse = Self::decode(Self::check(resp).await?).await?;
        debug!(txid = %posted.tx_id, "Submitted transaction");
        Ok(posted.tx_id)
    }

    async fn wait_for_confirmation(&self, txid: &str, rounds: u64) -> LedgerResult<u64> {
        let last_round = self.status().await?;
        let mut current = last_round + 1;
        loop {
            if current > last_round + rounds {
                return Err(LedgerError::ConfirmationTimeout {
                    txid: txid.to_string(),
                    rounds,
                });
            }
            let pending: PendingResponse = self
                .get_json(&format!("/v2/transactions/pending/{}", txid))
                .await?;
            if pending.confirmed_round > 0 {
                return Ok(pending.confirmed_round);
            }
            if !pending.pool_error.is_empty() {
                return Err(LedgerError::PoolError(pending.pool_error));
            }
            let _: StatusResponse = self
                .get_json(&format!("/v2/status/wait-for-block-after/{}", current))
                .await?;
            current += 1;
        }
    }
}
