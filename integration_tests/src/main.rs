//! Integration tests for the LoRaWAN BLE node.
//!
//! Run against a flashed node that is within BLE range and can reach a
//! gateway. The node is activated with the given ABP credentials.

mod ble_client;
mod protocol;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use ble_client::BleClient;
use protocol::parse_hex;
use tests::{print_results, run_all_tests, Credentials};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "Integration tests for the LoRaWAN BLE node")]
struct Args {
    /// Advertised device name
    #[arg(short, long, default_value = "LoRaNode")]
    name: String,

    /// Scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,

    /// Device address, 4 hex bytes, most significant first
    #[arg(long)]
    dev_addr: String,

    /// Network session key, 16 hex bytes
    #[arg(long)]
    nwk_skey: String,

    /// Application session key, 16 hex bytes
    #[arg(long)]
    app_skey: String,

    /// Starting uplink frame counter
    #[arg(long, default_value = "0")]
    seq: u32,

    /// Spreading factor (7-10)
    #[arg(long, default_value = "10")]
    sf: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let credentials = Credentials {
        dev_addr: parse_hex(&args.dev_addr)?,
        nwk_skey: parse_hex(&args.nwk_skey)?,
        app_skey: parse_hex(&args.app_skey)?,
        seq_no_up: args.seq,
        spreading_factor: args.sf,
    };

    println!("{}", "LoRaWAN BLE Node Integration Tests".bold());
    println!("Device: {}", args.name);
    println!("SF: {}", args.sf);
    println!();

    println!("Scanning for device...");
    let client = BleClient::connect_by_name(&args.name, Duration::from_secs(args.scan_timeout)).await?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&client, &credentials).await;
    print_results(&results);

    client.disconnect().await?;

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
