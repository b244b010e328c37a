//! Binary entry point: parses CLI args, wires up logging and the
//! reactor, and runs it to completion. Mirrors `volo-cli`'s
//! `clap::Parser` + `anyhow::Result<()>` + `tracing-subscriber`
//! bootstrap shape.

use std::sync::Arc;

use clap::Parser;
use reactord::{
    config::Cli,
    conn::EchoConnection,
    logsink::{Logger, TracingLogger},
    reactor::Reactor,
};

fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config();

    let logger: Arc<dyn Logger> = Arc::new(TracingLogger::init(
        &config.log_file,
        usize::MAX,
        config.log_queue_depth,
    )?);

    logger.info(&format!(
        "binding {}:{} (threads={}, max_queue={}, max_fd={})",
        config.bind, config.port, config.threads, config.max_queue, config.max_fd
    ));

    let reactor = Reactor::bind(config, EchoConnection::new, logger)?;
    reactor.run()?;
    Ok(())
}
