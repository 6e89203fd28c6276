//! authgate - authentication and session guard

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use authgate::{
    cli::{Cli, Command},
    config::{AuthenticatorConfig, Config},
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => match run_check(&cli) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Validate configuration and print the chain
fn run_check(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let guard = config.build_guard().context("Invalid configuration")?;

    println!("✅ Configuration valid\n");
    for (link, entry) in guard.chain().links().iter().zip(&config.authenticators) {
        let kind = match entry {
            AuthenticatorConfig::Jwt(c) => format!("jwt, {} issuer(s)", c.issuers.len()),
            AuthenticatorConfig::Hmac(c) => format!("hmac, {:?}", c.algorithm),
        };
        let required = if link.required { " [required]" } else { "" };
        println!("  {} ({kind}){required}", link.authenticator.name());
    }
    match guard.sessions() {
        Some(s) => println!(
            "\n  session: {:?} '{}'{}",
            s.channel().kind(),
            s.key(),
            if s.is_secure() { " (encrypted)" } else { "" }
        ),
        None => println!("\n  session: disabled"),
    }
    if !config.authorization.required_roles.is_empty() {
        println!(
            "  required roles: {}",
            config.authorization.required_roles.join(", ")
        );
    }
    Ok(())
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        authenticators = config.authenticators.len(),
        "Starting authgate"
    );

    if let Err(e) = server::serve(config).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
