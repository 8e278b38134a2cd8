// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use rmcp::{transport::stdio, ServiceExt};
use std::str::FromStr;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use strata::api;
use strata::config::CONFIG;
use strata::context::{create_pool, run_migrations};
use strata::mcp::StrataServer;
use strata::state::create_app_state;

#[derive(Parser)]
#[command(name = "strata", version, about = "Hierarchical context backend for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST server
    Serve,
    /// Run the MCP server on stdio
    Mcp,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr: in MCP mode stdout carries the protocol.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::from_str(&CONFIG.log_level).unwrap_or(Level::INFO))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let pool = create_pool(&CONFIG.database_url).await?;
    run_migrations(&pool).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve_http(pool).await,
        Command::Mcp => serve_mcp(pool).await,
        Command::Migrate => {
            info!("Migrations applied to {}", CONFIG.database_url);
            Ok(())
        }
    }
}

async fn serve_http(pool: sqlx::SqlitePool) -> Result<()> {
    let state = create_app_state(pool);
    let app = api::router(state);

    let bind_address = format!("{}:{}", CONFIG.host, CONFIG.port);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Strata listening on http://{}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn serve_mcp(pool: sqlx::SqlitePool) -> Result<()> {
    let state = create_app_state(pool);
    let server = StrataServer::new(state);

    info!("Strata MCP server starting on stdio");
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
