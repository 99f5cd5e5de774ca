use busline::{
    config::RouterConfig,
    event::{handler_fn, sync_handler, AddressRouter, ChannelErrorSink, DeliveryOptions},
    BuslineResult,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Replays the publish / send / request walkthrough against an in-process router.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Address the consumers subscribe to
    #[arg(short, long, default_value = "example.address")]
    address: String,

    /// Request timeout in milliseconds, overrides the config
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: &Cli) -> BuslineResult<()> {
    let config = if cli.config.exists() {
        RouterConfig::from_file(&cli.config)?
    } else {
        RouterConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let errors = Arc::new(ChannelErrorSink::new(config.error_channel_capacity));
    let mut error_rx = errors.subscribe();
    tokio::spawn(async move {
        while let Ok(failure) = error_rx.recv().await {
            warn!("handler failure on {}: {}", failure.address, failure.cause);
        }
    });

    let router = AddressRouter::with_error_sink(config, errors);
    let address = cli.address.as_str();

    // two consumers on one address
    let first = router.subscribe(
        address,
        sync_handler(|message| {
            println!("[first] received {}: {}", message.kind(), message.body());
            Ok(())
        }),
    );
    let second = router.subscribe(
        address,
        sync_handler(|message| {
            println!("[second] received {}: {}", message.kind(), message.body());
            Ok(())
        }),
    );
    if first.is_registered() && second.is_registered() {
        println!("Both handlers registered at {}", address);
    }

    let reached = router.publish(address, format!("publish to all subscribers of {}", address))?;
    debug!("publish reached {} handlers", reached);

    router.send(address, format!("send to a single subscriber of {}", address))?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the second consumer now acknowledges what it processes
    second
        .replace_handler(handler_fn(|message| async move {
            println!("[second] received request & replying: {}", message.body());
            message.reply(format!("{} is processed", message.body()));
            Ok(())
        }))
        .await?;
    router.unsubscribe(&first);

    let mut options = DeliveryOptions::new();
    if let Some(timeout_ms) = cli.timeout_ms {
        options = options.timeout(Duration::from_millis(timeout_ms));
    }
    match router
        .request_with_options(address, "request a message & reply on success", options)
        .await
    {
        Ok(reply) => println!("Received reply: {}", reply),
        Err(e) => println!("Request failed: {}", e),
    }

    router.close();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
