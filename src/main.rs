use clap::Parser;
use flowmaster::configuration::{Args, Config};
use flowmaster::controller::Controller;
use log::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = Config::from_args(&args).unwrap_or_else(|e| {
        eprintln!(
            "Unable to import configuration from {}: {e}",
            args.config_file.display()
        );
        std::process::exit(1);
    });

    // RUST_LOG still wins over the configured level.
    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .format_target(false)
        .init();

    info!(
        "flowmaster {} starting with {}",
        env!("CARGO_PKG_VERSION"),
        args.config_file.display()
    );

    let mut controller = Controller::new(config).unwrap_or_else(|e| {
        error!("Unable to create a controller instance: {e}, exiting...");
        std::process::exit(1);
    });

    if let Err(e) = controller.run().await {
        error!("Error occured in the controller process: {e}, exiting...");
        std::process::exit(1);
    }
}
