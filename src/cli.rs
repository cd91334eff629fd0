//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Consent gateway - OAuth2 token exchange with mTLS and self-healing dependencies
#[derive(Parser, Debug)]
#[command(name = "consent-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CONSENT_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CONSENT_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CONSENT_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Redeem an authorization code for a consent
    Exchange {
        /// Consent identifier
        #[arg(long)]
        consent: u64,

        /// Authorization code returned to the redirect URI
        #[arg(long)]
        code: String,
    },

    /// Redeem the stored refresh token of a consent
    Refresh {
        /// Consent identifier
        #[arg(long)]
        consent: u64,
    },

    /// Return a consent with a current access token, refreshing if needed
    Current {
        /// Consent identifier
        #[arg(long)]
        consent: u64,
    },

    /// Load the signing key and discover every configured data holder
    Check,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_exchange() {
        let cli = Cli::parse_from([
            "consent-gateway",
            "--config",
            "gateway.yaml",
            "exchange",
            "--consent",
            "7",
            "--code",
            "abc123",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        assert!(matches!(
            cli.command,
            Command::Exchange { consent: 7, ref code } if code == "abc123"
        ));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["consent-gateway", "check", "--log-format", "json"]);
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(cli.command, Command::Check));
    }
}
