use riptide::config::Config;
use riptide::protocol::BuiltinFactory;
use riptide::runtime::Reactor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        workers = config.workers,
        max_connections = config.max_connections,
        idle_timeout_ms = config.idle_timeout_ms,
        "Starting riptide server"
    );

    let factory = Box::new(BuiltinFactory::new(config.protocol));
    let mut reactor = Reactor::new(&config, factory)?;
    reactor.run()?;

    Ok(())
}
