//! Attach this terminal to a session published by a host.

use clap::Parser;
use telerepl::{
    config::{RendezvousAddress, DEFAULT_HOST, DEFAULT_PORT, HOST_ENV, PORT_ENV},
    operator::{attach, OperatorConfig, OperatorIo, RETRY_DELAY},
};

#[derive(Parser, Debug)]
#[command(version, about = "Attach this terminal to a remote REPL session")]
struct Args {
    /// Host publishing the session
    #[arg(short, long, env = HOST_ENV, default_value = DEFAULT_HOST)]
    server: String,

    /// Port of the session handle
    #[arg(short, long, env = PORT_ENV, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keep trying until the host is up
    #[arg(long)]
    wait: bool,

    /// Attach again after each session
    #[arg(long)]
    persist: bool,

    /// Also receive the host's standard output and error
    #[arg(long)]
    capture: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Err(e) = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
    {
        eprintln!("Failed to initialize tracing: {e}");
    }

    let config = OperatorConfig {
        address: RendezvousAddress::new(args.server, args.port),
        wait: args.wait,
        persist: args.persist,
        capture: args.capture,
        retry_delay: RETRY_DELAY,
    };
    attach(config, OperatorIo::terminal())?;

    Ok(())
}
