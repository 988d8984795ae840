//! RPC Mock Builder for Ethereum JSON-RPC Testing
//!
//! Wraps mockito to provide JSON-RPC response builders for the methods the access layer
//! issues, plus the provider failure shapes it has to classify.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};

/// Builder for creating mock Ethereum RPC responses.
///
/// Uses mockito internally but provides Ethereum-specific helpers.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

fn method_matcher(method: &str) -> Matcher {
    Matcher::Regex(format!(r#""method"\s*:\s*"{method}""#))
}

fn result_body(result: &Value) -> String {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
}

fn error_body(code: i32, message: &str) -> String {
    json!({ "jsonrpc": "2.0", "id": 1, "error": { "code": code, "message": message } })
        .to_string()
}

impl RpcMockBuilder {
    /// Creates a new RPC mock builder with a fresh mockito server.
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    /// Returns the URL of the mock server.
    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Mocks a generic JSON-RPC method with custom response.
    pub fn mock_method(&mut self, method: &str, result: &Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(result_body(result))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks an `eth_blockNumber` request.
    pub fn mock_block_number(&mut self, block_number: u64) -> &mut Self {
        self.mock_method("eth_blockNumber", &json!(format!("0x{block_number:x}")))
    }

    /// Mocks an `eth_gasPrice` request.
    pub fn mock_gas_price(&mut self, wei: u128) -> &mut Self {
        self.mock_method("eth_gasPrice", &json!(format!("0x{wei:x}")))
    }

    /// Mocks an `eth_maxPriorityFeePerGas` request.
    pub fn mock_priority_fee(&mut self, wei: u128) -> &mut Self {
        self.mock_method("eth_maxPriorityFeePerGas", &json!(format!("0x{wei:x}")))
    }

    /// Mocks an RPC error response.
    pub fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(error_body(code, message))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Answers every request with HTTP 429.
    pub fn mock_rate_limited(&mut self) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(429)
            .with_body("Too Many Requests")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Answers every request with a provider quota error.
    pub fn mock_quota_exhausted(&mut self) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(error_body(-32000, "Monthly capacity limit exceeded. Upgrade your plan."))
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a timeout by returning a gateway timeout error.
    ///
    /// Note: mockito doesn't support actual delays, so we simulate timeout
    /// with a 504 Gateway Timeout response.
    pub fn mock_timeout(&mut self, method: &str) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(method_matcher(method))
            .with_status(504)
            .with_body("Gateway Timeout")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Mocks a server error (500).
    pub fn mock_server_error(&mut self) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(500)
            .with_body("Internal Server Error")
            .create();

        self.mocks.push(mock);
        self
    }

    /// Drops every registered mock; later requests get mockito's 501.
    pub fn reset(&mut self) -> &mut Self {
        self.mocks.clear();
        self.server.reset();
        self
    }

    /// Returns a reference to the underlying mockito server for advanced mocking.
    pub fn get_server(&mut self) -> &mut mockito::ServerGuard {
        &mut self.server
    }

    /// Verifies all mocks were called.
    #[must_use]
    pub fn verify_all_called(&self) -> bool {
        self.mocks.iter().all(mockito::Mock::matched)
    }

    /// Gets the number of mocks that were called at least once.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.mocks.iter().filter(|m| m.matched()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_access_core::{
        types::{EndpointConfig, ProviderClass},
        upstream::{FailureKind, HttpClient, RpcTransport, UpstreamError},
    };

    async fn call(mock: &RpcMockBuilder, method: &str) -> Result<Value, UpstreamError> {
        let client = HttpClient::new().unwrap();
        let endpoint = EndpointConfig::http("mock", mock.url(), ProviderClass::Free);
        client.call(&endpoint, method, json!([])).await
    }

    #[tokio::test]
    async fn test_block_number_mock() {
        let mut mock = RpcMockBuilder::new().await;
        mock.mock_block_number(1000);

        assert_eq!(call(&mock, "eth_blockNumber").await.unwrap(), json!("0x3e8"));
        assert!(mock.verify_all_called());
    }

    #[tokio::test]
    async fn test_failure_mocks_are_classified() {
        let mut mock = RpcMockBuilder::new().await;
        mock.mock_rate_limited();
        assert_eq!(call(&mock, "eth_call").await.unwrap_err().kind(), FailureKind::RateLimited);

        mock.reset().mock_quota_exhausted();
        assert_eq!(call(&mock, "eth_call").await.unwrap_err().kind(), FailureKind::QuotaExhausted);

        mock.reset().mock_server_error();
        assert_eq!(call(&mock, "eth_call").await.unwrap_err().kind(), FailureKind::Transient);
    }
}
