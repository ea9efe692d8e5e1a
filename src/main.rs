//! weft - host-local container network fabric
//!
//! Creates the fabric bridge, attaches container network namespaces to it
//! through veth pairs, and maintains the NAT rules for fabric traffic.

mod cli;
mod error;
mod manifest;
mod network;
mod orchestrator;
mod sys;
#[cfg(test)]
mod testing;

use cli::{Cli, Commands};
use error::Result;
use network::{Attacher, Bridge, Masquerade};
use orchestrator::Docker;
use sys::SystemRunner;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`
fn init_logging(verbose: bool) {
    let filter = if verbose { "weft=debug" } else { "weft=info" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = cli.command {
        Cli::generate_completion(shell);
        return Ok(());
    }

    let config = manifest::load_or_default(cli.config.as_deref())?;
    let runner = SystemRunner;

    match cli.command {
        Commands::CreateBridge => Bridge::new(&config, &runner).create(),
        Commands::DestroyBridge => Bridge::new(&config, &runner).destroy(),
        Commands::SetupMasquerading { subnet } => Masquerade::new(&config, &runner).setup(&subnet),
        Commands::StopMasquerading => Masquerade::new(&config, &runner).stop(),
        Commands::Attach {
            cidr,
            container,
            offload_device,
        } => {
            let docker = Docker::new(&config.tools.docker, &runner);
            let device = offload_device.as_deref().unwrap_or(config.container.offload_device.as_str());
            Attacher::new(&config, &runner, &docker)
                .attach(&container, &cidr, device)
                .map(|_| ())
        }
        Commands::Detach { cidr, container } => {
            let docker = Docker::new(&config.tools.docker, &runner);
            Attacher::new(&config, &runner, &docker)
                .detach(&container, &cidr)
                .map(|_| ())
        }
        Commands::Completion { .. } => Ok(()),
    }
}
