//! HTTP relay/builder endpoint client
//!
//! Speaks the JSON-RPC dialect builders commonly expose: `eth_callBundle`
//! for simulation, `eth_sendBundle` for submission, and
//! `eth_sendPrivateRawTransaction` for the private single-transaction
//! channel. One client per configured endpoint; the protection layer fans
//! out across them.

use crate::bundle::{Bundle, SimulationResult, TxOutcome};
use crate::error::{EngineError, EngineResult};
use crate::interfaces::{RelayAck, RelayEndpoint};
use crate::types::TxHash;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub struct HttpRelayEndpoint {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpRelayEndpoint {
    pub fn new(url: impl Into<String>, timeout: Duration) -> EngineResult<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Rpc(format!("relay client init failed: {e}")))?;
        let name = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or(&url)
            .to_string();
        Ok(Self { name, url, client })
    }

    async fn call(&self, method: &str, params: Value) -> EngineResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Rpc(format!("{}: {e}", self.name)))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Rpc(format!("{}: invalid response: {e}", self.name)))?;

        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown relay error");
            return Err(EngineError::Rpc(format!("{}: {message}", self.name)));
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| EngineError::Rpc(format!("{}: response missing result", self.name)))
    }

    fn bundle_params(bundle: &Bundle) -> Value {
        let txs: Vec<String> = bundle
            .transactions
            .iter()
            .map(|tx| format!("0x{}", hex::encode(&tx.raw)))
            .collect();
        let mut params = json!({
            "txs": txs,
            "blockNumber": format!("0x{:x}", bundle.target_block),
        });
        if let Some((min, max)) = bundle.window {
            params["minTimestamp"] = json!(min);
            params["maxTimestamp"] = json!(max);
        }
        json!([params])
    }
}

fn parse_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => {
            u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap_or(0)
        }
        _ => 0,
    }
}

#[async_trait]
impl RelayEndpoint for HttpRelayEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn simulate(&self, bundle: &Bundle) -> EngineResult<SimulationResult> {
        let result = self
            .call("eth_callBundle", Self::bundle_params(bundle))
            .await?;

        let empty = Vec::new();
        let raw_results = result
            .get("results")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        let mut outcomes = Vec::with_capacity(raw_results.len());
        let mut all_ok = true;
        let mut failure_reason = None;

        for (i, entry) in raw_results.iter().enumerate() {
            let revert = entry
                .get("error")
                .or_else(|| entry.get("revert"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(ref reason) = revert {
                all_ok = false;
                failure_reason.get_or_insert_with(|| reason.clone());
            }
            let hash = bundle
                .transactions
                .get(i)
                .map(|tx| tx.hash)
                .unwrap_or(TxHash([0u8; 32]));
            outcomes.push(TxOutcome {
                hash,
                success: revert.is_none(),
                gas_used: parse_u64(entry.get("gasUsed")),
                effective_fee: parse_u64(entry.get("gasFees")) as u128,
                revert_reason: revert,
            });
        }

        Ok(SimulationResult {
            success: all_ok && !outcomes.is_empty(),
            total_gas_used: parse_u64(result.get("totalGasUsed"))
                .max(outcomes.iter().map(|o| o.gas_used).sum()),
            total_fee: outcomes.iter().map(|o| o.effective_fee).sum(),
            failure_reason: if all_ok && outcomes.is_empty() {
                Some("empty simulation result".to_string())
            } else {
                failure_reason
            },
            outcomes,
        })
    }

    async fn submit_bundle(&self, bundle: &Bundle) -> EngineResult<RelayAck> {
        let result = self
            .call("eth_sendBundle", Self::bundle_params(bundle))
            .await?;

        let bundle_hash = result
            .get("bundleHash")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());

        Ok(RelayAck {
            endpoint: self.name.clone(),
            bundle_hash,
        })
    }

    async fn submit_private(&self, raw_tx: &[u8]) -> EngineResult<TxHash> {
        let params = json!([format!("0x{}", hex::encode(raw_tx))]);
        let result = self
            .call("eth_sendPrivateRawTransaction", params)
            .await?;

        result
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                EngineError::Rpc(format!("{}: malformed private tx response", self.name))
            })
    }
}
