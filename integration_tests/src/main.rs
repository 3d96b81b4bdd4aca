//! Integration tests for the SPS serial firmware.
//!
//! Run after flashing the firmware: connects over BLE, opens a credit
//! session and checks the echo application end to end.

mod sps_client;

use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use sps_client::SpsClient;
use tests::{print_results, run_all_tests};

#[derive(Parser)]
#[command(name = "integration-tests")]
#[command(about = "BLE integration tests for the SPS serial firmware")]
struct Args {
    /// BLE device name, "SPS-" followed by the last three MAC bytes in hex
    #[arg(short, long)]
    name: String,

    /// BLE scan timeout in seconds
    #[arg(long, default_value = "10")]
    scan_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("{}", "SPS Serial Integration Tests".bold());
    println!("Scanning for \"{}\"...", args.name);

    let client = SpsClient::connect_by_name(&args.name, Duration::from_secs(args.scan_timeout)).await?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let results = run_all_tests(&client).await;
    print_results(&results);

    client.disconnect().await.ok();

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
