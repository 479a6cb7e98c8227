use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod config;
#[cfg(test)]
mod integration_test;
mod service;
mod tracing;
use tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Directory of job manifests to submit at startup")]
    jobs_dir: Option<PathBuf>,

    #[arg(short, long, help = "Number of reconciliation workers")]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match config::ControllerConfig::load(cli.config.as_deref())
        .and_then(|config| config.with_overrides(cli.jobs_dir, cli.workers))
    {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:?}", err);
            std::process::exit(1);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let root_span = info_span!(
        "trainjob-controller",
        env = config.env,
        "trainjob-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    match Service::new(config).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("error running controller: {:?}", err);
            }
        }
        Err(err) => error!("error creating service: {:?}", err),
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("error shutting down tracer provider: {:?}", err);
        }
    }
}
