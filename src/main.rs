use std::{net::SocketAddr, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tesira_gateway::{
    config::Config,
    dsp::{Dsp, Options},
    http,
    transport::{Connection, SessionConfig, ssh::Ssh},
};

#[derive(Debug, Parser)]
#[command(name = "tesira-gateway", version, about = "REST gateway for Biamp Tesira DSPs")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: std::path::PathBuf,

    /// Force debug-level logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration unreadable: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut session = SessionConfig::new(
        config.connection.host.clone(),
        config.connection.username.clone(),
        config.connection.password.clone(),
    );
    session.port = config.connection.port;
    let conn: Arc<dyn Connection> = Arc::new(Ssh::start(session));

    let dsp = match Dsp::start(
        conn,
        Options {
            cache_file: config.dsp.attribute_cache.clone(),
            ..Options::default()
        },
    ) {
        Ok(dsp) => Arc::new(dsp),
        Err(e) => {
            error!("device bring-up failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("device ready, starting API");
    let status = match serve_api(dsp.clone(), config.http.listen) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("API server failed: {e}");
            ExitCode::FAILURE
        }
    };

    dsp.close();
    status
}

#[tokio::main]
async fn serve_api(dsp: Arc<Dsp>, listen: SocketAddr) -> std::io::Result<()> {
    http::serve(dsp, listen).await
}
