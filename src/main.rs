use clap::Parser;
use tracing_subscriber::EnvFilter;

use diffbot_runtime::config::DEFAULT_PORT;
use diffbot_runtime::motor::SerialBoard;
use diffbot_runtime::sim::SimBoard;

/// Differential-drive base runtime: control loop, calibration, validation
#[derive(Parser)]
#[command(name = "diffbot-runtime", version)]
struct Args {
    /// Serial port of the motor-controller MCU
    #[arg(short, long, default_value = DEFAULT_PORT)]
    port: String,

    /// Run against the simulated board instead of hardware
    #[arg(long)]
    sim: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let result = if args.sim {
        diffbot_runtime::runtime::run(SimBoard::new()).await
    } else {
        match SerialBoard::open(&args.port) {
            Ok(board) => diffbot_runtime::runtime::run(board).await,
            Err(e) => {
                eprintln!("Failed to open {}: {}", args.port, e);
                std::process::exit(1);
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
