//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth 2.0 client-credentials client and protected resource server
#[derive(Parser, Debug)]
#[command(name = "oauth-m2m")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OAUTH_M2M_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OAUTH_M2M_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OAUTH_M2M_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to a single downstream call)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire a token and call the downstream service (default)
    Call {
        /// Client registration to use (defaults to `default_client`)
        #[arg(short, long)]
        registration: Option<String>,

        /// Principal the call is made on behalf of
        #[arg(long)]
        principal: Option<String>,

        /// Downstream path (defaults to `downstream.path`)
        #[arg(long)]
        path: Option<String>,
    },

    /// Acquire a token and print it
    Token {
        /// Client registration to use (defaults to `default_client`)
        #[arg(short, long)]
        registration: Option<String>,

        /// Principal the token is acquired for
        #[arg(long)]
        principal: Option<String>,

        /// Print only the raw access token
        #[arg(long)]
        raw: bool,
    },

    /// Run the protected resource server
    Serve {
        /// Host to bind to
        #[arg(long, env = "OAUTH_M2M_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "OAUTH_M2M_PORT")]
        port: Option<u16>,
    },
}
