use std::process;

use clap::{Arg, Command};
use env_logger::Builder;
use log::{error, info, LevelFilter};

use apvd::config::ServerConfig;
use apvd::handler::serve;

#[tokio::main]
async fn main() {
    let matches = Command::new("apvd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Agent path-vector routing daemon")
        .arg(
            Arg::new("configpath")
                .short('c')
                .long("config-path")
                .help("Path to the server config (TOML)")
                .takes_value(true),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of logging verbosity"),
        )
        .get_matches();

    let (apvd_level, other_level) = match matches.occurrences_of("v") {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("apvd"), apvd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", apvd_level, other_level);

    // Invalid configuration refuses to start
    let config = match ServerConfig::load(matches.value_of("configpath")) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    info!(
        "Local AS{} [{} peers configured, {} static agents]",
        config.local_asn,
        config.peers.len(),
        config.agents.len()
    );

    if let Err(err) = serve(config).await {
        error!("{}", err);
        process::exit(1);
    }
}
