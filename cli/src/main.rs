//! tmrpc CLI — query a Tendermint-style node and follow its events.
//!
//! Usage:
//! ```bash
//! # Node status and chain check
//! tmrpc status --url tcp://127.0.0.1:26657 --network testnet
//!
//! # Send a raw JSON-RPC call
//! tmrpc call --url tcp://127.0.0.1:26657 --method block --params '{"height":"10"}'
//!
//! # Print events as they arrive
//! tmrpc subscribe --url tcp://127.0.0.1:26657 --query "tm.event = 'NewBlock'"
//! ```

use std::env;
use std::process;
use std::time::Duration;

use futures::StreamExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tmrpc_core::{ClientConfig, NetworkKind};
use tmrpc_node::NodeClient;
use tmrpc_ws::WsRpcClient;

const DEFAULT_URL: &str = "tcp://127.0.0.1:26657";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    init_tracing(parse_flag(rest, "--log-level").as_deref());

    let result = match args[1].as_str() {
        "status" => cmd_status(rest).await,
        "call" => cmd_call(rest).await,
        "subscribe" => cmd_subscribe(rest).await,
        "version" | "--version" | "-V" => {
            println!("tmrpc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("tmrpc {}", env!("CARGO_PKG_VERSION"));
    println!("Query a Tendermint-style node over its WebSocket JSON-RPC\n");
    println!("USAGE:");
    println!("    tmrpc <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    status     Print node status and check the chain id");
    println!("    call       Send a raw JSON-RPC call");
    println!("    subscribe  Print events matching a query until interrupted");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <ADDR>         Node address            [default: {DEFAULT_URL}]");
    println!("    --network <NAME>     testnet | prodnet | tmptestnet");
    println!("    --timeout-ms <MS>    Per-call timeout");
    println!("    --config <FILE>      JSON client config");
    println!("    --log-level <LEVEL>  trace | debug | info | warn | error  [default: info]\n");
    println!("CALL FLAGS:");
    println!("    --method <NAME>      RPC method  [required]");
    println!("    --params <JSON>      Named params object\n");
    println!("SUBSCRIBE FLAGS:");
    println!("    --query <QUERY>      Event query  [required]");
    println!("    --buffer <N>         Event buffer capacity");
}

/// `RUST_LOG` wins over `--log-level`; logs go to stderr.
fn init_tracing(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init();
}

fn load_config(args: &[String]) -> Result<(String, ClientConfig), String> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => ClientConfig::from_file(&path).map_err(|e| e.to_string())?,
        None => ClientConfig::default(),
    };
    if let Some(network) = parse_flag(args, "--network") {
        config.network = network.parse::<NetworkKind>().map_err(|e| e.to_string())?;
    }
    if let Some(ms) = parse_flag(args, "--timeout-ms") {
        let ms: u64 = ms.parse().map_err(|_| format!("invalid --timeout-ms: {ms}"))?;
        config = config.with_timeout(Duration::from_millis(ms));
    }
    let url = parse_flag(args, "--url").unwrap_or_else(|| DEFAULT_URL.to_string());
    tracing::debug!(%url, network = %config.network, timeout_ms = config.request_timeout_ms, "client configured");
    Ok((url, config))
}

async fn cmd_status(args: &[String]) -> Result<(), String> {
    let (url, config) = load_config(args)?;
    let client = NodeClient::with_config(&url, config).map_err(|e| e.to_string())?;

    println!("Querying {url}...");
    let start = std::time::Instant::now();
    let status = client.status().await.map_err(|e| e.to_string())?;
    let latency = start.elapsed();

    println!("  Moniker:      {}", status.node_info.moniker);
    println!("  Chain id:     {}", status.node_info.network);
    println!("  Version:      {}", status.node_info.version);
    println!("  Height:       {}", status.sync_info.latest_block_height);
    println!("  Catching up:  {}", status.sync_info.catching_up);
    println!("  Latency:      {}ms", latency.as_millis());

    match client.check_network().await {
        Ok(()) => println!("  Network:      {} (ok)", client.network()),
        Err(e) => println!("  Network:      {e}"),
    }

    client.close().await;
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<(), String> {
    let (url, config) = load_config(args)?;
    let method = parse_flag(args, "--method").ok_or("--method is required")?;
    let params: serde_json::Value = match parse_flag(args, "--params") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid --params: {e}"))?,
        None => serde_json::Value::Null,
    };

    let client = WsRpcClient::with_config(&url, config).map_err(|e| e.to_string())?;
    let result = client
        .call_raw(&method, params)
        .await
        .map_err(|e| e.to_string())?;

    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    client.close().await;
    Ok(())
}

async fn cmd_subscribe(args: &[String]) -> Result<(), String> {
    let (url, config) = load_config(args)?;
    let query = parse_flag(args, "--query").ok_or("--query is required")?;
    let capacity = match parse_flag(args, "--buffer") {
        Some(n) => n.parse().map_err(|_| format!("invalid --buffer: {n}"))?,
        None => config.default_buffer_capacity,
    };

    let client = WsRpcClient::with_config(&url, config).map_err(|e| e.to_string())?;
    let mut events = client
        .subscribe(&query, capacity)
        .await
        .map_err(|e| e.to_string())?;
    eprintln!("Subscribed to {}; Ctrl-C to stop", events.query());

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    let line = serde_json::json!({
                        "type": event.event_type(),
                        "query": event.query,
                        "data": event.data,
                    });
                    println!("{line}");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if events.dropped() > 0 {
        eprintln!("{} events dropped (buffer full)", events.dropped());
    }
    let _ = client.unsubscribe(&query).await;
    client.close().await;
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
