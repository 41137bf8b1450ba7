pub mod api;
pub mod error;
pub mod websocket;

use crate::cli::Args;
use api::AppState;
use log::{ info, warn };
use std::error::Error;

pub struct Server {
    addr: String,
    state: AppState,
    api_key: Option<String>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, state: AppState, api_key: Option<String>, args: Args) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());

        if api_key.is_some() {
            info!("Server configured with API Key authentication.");
        } else {
            warn!("Server configured WITHOUT API Key authentication. Connections are open.");
        }

        Self { addr, state, api_key, args }
    }

    /// Starts the HTTP API in the background, then serves chat sessions.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(self.args.http_port, self.state.clone(), self.args.clone()).await?;
        websocket::start_ws_server(&self.addr, self.state.clone(), self.api_key.clone(), self.args.clone()).await
    }
}
