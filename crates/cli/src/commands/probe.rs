use futures::future::join_all;
use rpc_access_core::{
    runtime::AccessRuntime,
    types::parse_hex_quantity,
    upstream::{HttpClient, UpstreamEndpoint, UpstreamError},
};
use std::{sync::Arc, time::Duration};

use super::{
    config::load_config,
    utils::{print_error, print_info, print_success, CliError, CliResult},
};

/// Calls `eth_blockNumber` once on every configured HTTP endpoint, bypassing the pool.
pub async fn test_endpoints(file: &str, timeout: u64) -> CliResult<()> {
    let config = load_config(file)?;
    let transport = Arc::new(HttpClient::new().map_err(|e| CliError::Network(e.to_string()))?);
    let timeout = Duration::from_secs(timeout);

    let endpoints: Vec<_> = config
        .chains
        .iter()
        .flat_map(|chain| chain.http_endpoints())
        .map(|endpoint| UpstreamEndpoint::new(endpoint, transport.clone(), 1))
        .collect();
    print_info(&format!("Testing {} HTTP endpoints...", endpoints.len()));

    let outcomes = join_all(endpoints.iter().map(|endpoint| async move {
        let start = std::time::Instant::now();
        let result = tokio::time::timeout(
            timeout,
            endpoint.request("eth_blockNumber", serde_json::Value::Array(vec![])),
        )
        .await
        .unwrap_or(Err(UpstreamError::Timeout));
        (result, start.elapsed())
    }))
    .await;

    let mut failed = 0;
    for (endpoint, (result, elapsed)) in endpoints.iter().zip(outcomes) {
        let chain = &endpoint.config().chain;
        match result {
            Ok(block) => {
                let block = block.as_str().and_then(parse_hex_quantity).unwrap_or_default();
                println!("{chain}/{}: [OK] block {block} ({}ms)", endpoint.name(), elapsed.as_millis());
            }
            Err(e) => {
                println!("{chain}/{}: [ERROR] {e} ({})", endpoint.name(), e.kind().as_str());
                failed += 1;
            }
        }
    }

    println!("\nTest Results:");
    println!("  [SUCCESS] Successful: {}", endpoints.len() - failed);
    println!("  [ERROR] Failed: {failed}");

    if failed > 0 {
        print_error("Some endpoints are not responding correctly");
        print_info("Check your API keys and network connectivity");
    } else {
        print_success("All endpoints are working correctly!");
    }

    Ok(())
}

/// Prints the current fee data for one chain as JSON, going through the retrying pool.
pub async fn gas_price(file: &str, chain: &str) -> CliResult<()> {
    let config = load_config(file)?;
    let runtime = AccessRuntime::builder()
        .with_config(config)
        .disable_self_healing()
        .disable_websocket()
        .build()?;

    let result = match runtime.chain(chain) {
        Some(access) => access.get_gas_price().await.map_err(|e| CliError::Network(e.to_string())),
        None => Err(CliError::Config(format!("Unknown chain: {chain}"))),
    };
    runtime.shutdown().await;

    let fee = result?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "chain": chain,
            "gas_price": fee.gas_price.to_string(),
            "max_priority_fee_per_gas": fee.max_priority_fee_per_gas.map(|v| v.to_string()),
        }))?
    );

    Ok(())
}
