//! Consent gateway - OAuth2 token exchange for data recipients
//!
//! Redeems authorization codes and refresh tokens at data holders and keeps
//! consent records current.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use consent_gateway::{
    cli::{Cli, Command},
    config::Config,
    consent::{ConsentRecord, FileConsentStore},
    pathways::Pathways,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_holders = config.data_holders.len(),
        registrations = config.registrations.len(),
        mtls = config.mtls.enabled,
        "Starting consent gateway"
    );

    let store = FileConsentStore::open(&config.store.directory)
        .await
        .context("Failed to open consent store")?;
    let pathways = Pathways::new(config, Arc::new(store)).context("Failed to build pathways")?;

    match cli.command {
        Command::Exchange { consent, code } => {
            let updated = pathways
                .exchange_code(consent, code)
                .await
                .with_context(|| format!("Code exchange for consent {consent} failed"))?;
            print_consent("Exchanged authorization code", &updated);
        }
        Command::Refresh { consent } => {
            let updated = pathways
                .refresh(consent)
                .await
                .with_context(|| format!("Refresh for consent {consent} failed"))?;
            print_consent("Refreshed tokens", &updated);
        }
        Command::Current { consent } => {
            let current = pathways
                .current_consent(consent)
                .await
                .with_context(|| format!("Consent {consent} has no usable access token"))?;
            print_consent("Current access token", &current);
        }
        Command::Check => run_check(&pathways).await?,
    }

    Ok(())
}

async fn run_check(pathways: &Pathways) -> anyhow::Result<()> {
    let report = pathways.check().await.context("Signing key unusable")?;
    println!("✅ Signing key loaded");

    let mut failures = 0;
    for (brand_id, result) in report {
        match result {
            Ok(metadata) => {
                println!("✅ {brand_id}");
                println!("   Issuer: {}", metadata.issuer);
                println!("   Token endpoint: {}", metadata.token_endpoint);
            }
            Err(e) => {
                failures += 1;
                println!("❌ {brand_id}: {e}");
            }
        }
    }

    anyhow::ensure!(failures == 0, "{failures} data holder(s) unreachable");
    Ok(())
}

/// Print a consent summary; token values are never shown
fn print_consent(action: &str, consent: &ConsentRecord) {
    println!("✅ {action} for consent {}", consent.id);
    println!("   Data holder: {}", consent.data_holder_brand_id);
    if let Some(expires_at) = consent.access_token_expires_at {
        println!("   Access token expires: {expires_at}");
    }
    if let Some(expires_at) = consent.refresh_token_expires_at {
        println!("   Refresh token expires: {expires_at}");
    }
    if let Some(expires_at) = consent.sharing_expires_at {
        println!("   Sharing expires: {expires_at}");
    }
    if let Some(scope) = &consent.scope {
        println!("   Scope: {scope}");
    }
    println!("   Version: {}", consent.version);
}
