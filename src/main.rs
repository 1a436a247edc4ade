//! oauth-m2m - OAuth 2.0 client-credentials client and protected resource server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oauth_m2m::{
    bootstrap::{ClientSide, build_gate, build_http_client},
    cli::{Cli, Command},
    config::Config,
    oauth::AuthorizeRequest,
    resource::ResourceServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Serve { host, port }) => run_server(config, host, port).await,
        Some(Command::Token {
            registration,
            principal,
            raw,
        }) => run_token(&config, registration, principal, raw).await,
        Some(Command::Call {
            registration,
            principal,
            path,
        }) => run_call(&config, registration, principal, path).await,
        None => run_call(&config, None, None, None).await,
    }
}

/// Pick the registration and principal, falling back to configuration
fn authorize_request(
    config: &Config,
    registration: Option<String>,
    principal: Option<String>,
) -> Option<AuthorizeRequest> {
    let registration = registration.or_else(|| config.default_registration().map(str::to_string))?;
    let principal = principal.unwrap_or_else(|| config.principal.clone());
    Some(AuthorizeRequest::new(registration, principal))
}

async fn client_side(config: &Config) -> Option<ClientSide> {
    let http = match build_http_client(&config.http) {
        Ok(http) => http,
        Err(e) => {
            error!("Failed to create HTTP client: {e}");
            return None;
        }
    };
    match ClientSide::build(config, http).await {
        Ok(side) => Some(side),
        Err(e) => {
            error!("Failed to initialize client: {e}");
            None
        }
    }
}

/// Acquire a token and call the downstream service once
async fn run_call(
    config: &Config,
    registration: Option<String>,
    principal: Option<String>,
    path: Option<String>,
) -> ExitCode {
    let Some(request) = authorize_request(config, registration, principal) else {
        error!("No client registration selected; set default_client or pass --registration");
        return ExitCode::FAILURE;
    };
    let Some(side) = client_side(config).await else {
        return ExitCode::FAILURE;
    };
    let path = path.unwrap_or_else(|| config.downstream.path.clone());

    info!(
        registration = %request.registration_id,
        principal = %request.principal,
        downstream = %config.downstream.base_url,
        path = %path,
        "Calling downstream service"
    );

    match side.call(&request, &path).await {
        Ok(response) => {
            println!("Response from Service 2: {}", response.body);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Downstream call failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Acquire a token and print it
async fn run_token(
    config: &Config,
    registration: Option<String>,
    principal: Option<String>,
    raw: bool,
) -> ExitCode {
    let Some(request) = authorize_request(config, registration, principal) else {
        error!("No client registration selected; set default_client or pass --registration");
        return ExitCode::FAILURE;
    };
    let Some(side) = client_side(config).await else {
        return ExitCode::FAILURE;
    };

    let token = match side.authorize(&request).await {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to acquire token: {e}");
            return ExitCode::FAILURE;
        }
    };

    if raw {
        println!("{token}");
        return ExitCode::SUCCESS;
    }

    println!("Registration: {}", request.registration_id);
    println!("Principal:    {}", request.principal);
    if let Some(cached) = side.manager.cache().get(&request.cache_key()) {
        println!("Token type:   {}", cached.token_type);
        println!("Expires at:   {}", cached.expires_at.to_rfc3339());
        if !cached.scopes.is_empty() {
            let scopes: Vec<&str> = cached.scopes.iter().map(String::as_str).collect();
            println!("Scopes:       {}", scopes.join(" "));
        }
    }
    println!("Access token: {token}");
    ExitCode::SUCCESS
}

/// Run the protected resource server
async fn run_server(mut config: Config, host: Option<String>, port: Option<u16>) -> ExitCode {
    if let Some(port) = port {
        config.resource.port = port;
    }
    if let Some(host) = host {
        config.resource.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.resource.port,
        issuer = %config.issuer.base_url,
        "Starting resource server"
    );

    let http = match build_http_client(&config.http) {
        Ok(http) => http,
        Err(e) => {
            error!("Failed to create HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let gate = match build_gate(&config, http).await {
        Ok(gate) => gate,
        Err(e) => {
            error!("Failed to initialize token validation: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = ResourceServer::new(config.resource, gate).run().await {
        error!("Resource server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Resource server shutdown complete");
    ExitCode::SUCCESS
}
