use clap::Parser;
use gateway_client::gateway::DispatchEvent;
use gateway_client::version::VERSION;
use gateway_client::{GatewayClient, GatewayConfig, GatewayError, GatewayEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "gateway.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info` level if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = match GatewayConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load gateway configuration: {e}");
            return Err(e.into());
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, endpoint = %config.endpoint_url(), "Starting gateway client...");

    let client = Arc::new(GatewayClient::from_config(&config)?);
    for event in GatewayEvent::ALL {
        client.dispatcher().register_event(event, |dispatch: Arc<DispatchEvent>| async move {
            info!(
                event = %dispatch.event,
                sequence = ?dispatch.sequence,
                data = %dispatch.data,
                "Received gateway event."
            );
            Ok(())
        });
    }

    let signal_client = client.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received. Closing the gateway session.");
                signal_client.close();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C."),
        }
    });

    match client.run().await {
        Ok(()) => {
            info!("Gateway client stopped.");
            Ok(())
        }
        Err(e @ GatewayError::SocketClosed { .. }) => {
            warn!(error = %e, close_code = ?e.close_code(), "Gateway closed the session.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Gateway client failed.");
            Err(e.into())
        }
    }
}
