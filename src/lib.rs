pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod generation;
pub mod llm;
pub mod models;
pub mod server;
pub mod store;

use cli::Args;
use log::info;
use server::api::AppState;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP Port: {}", args.http_port);
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("(provider default)"));
    info!("Chat API Key: {}", if args.api_key().is_some() { "set" } else { "missing" });
    if let Some(url) = &args.generate_url {
        info!("Generate URL: {}", url);
    }
    info!("Store Type: {}", args.store_type);
    if let Some(url) = &args.supabase_url {
        info!("Supabase URL: {}", url);
    }
    info!("Default Framework: {}", args.default_framework);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let state = AppState::from_args(&args)?;
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, state, args.server_api_key.clone(), args.clone());
    server.run().await?;

    Ok(())
}
