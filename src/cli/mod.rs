use clap::Parser;

use crate::llm::{ LlmConfig, LlmType, ParseLlmTypeError };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address and port for the WebSocket chat server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP API, bound on the same host as SERVER_ADDR.
    #[arg(long, env = "HTTP_PORT", default_value = "4001")]
    pub http_port: u16,

    /// Optional API Key required for clients to connect to the WebSocket server. If set, clients must provide this key.
    #[arg(long, env = "SERVER_API_KEY")]
    pub server_api_key: Option<String>,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for copy generation (deepseek, openai, ollama)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "deepseek")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., https://api.deepseek.com)
    #[arg(long, env = "CHAT_BASE_URL")] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider. Without one, generation returns fallback copy.
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Legacy name for CHAT_API_KEY, used when CHAT_API_KEY is empty.
    #[arg(long, env = "DEEPSEEK_API_KEY", hide = true)]
    pub deepseek_api_key: Option<String>,

    /// Model name for copy generation (e.g., deepseek-chat, gpt-4o, llama3)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Sampling temperature sent with every completion request.
    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub chat_temperature: f32,

    /// Optional URL of a running /api/generate endpoint. When set, chat sessions generate through it instead of calling the LLM directly.
    #[arg(long, env = "GENERATE_URL")]
    pub generate_url: Option<String>,

    // --- Store Args ---
    /// Persistence backend for users, chats and profiles (memory, supabase)
    #[arg(long, env = "STORE_TYPE", default_value = "memory")]
    pub store_type: String,

    /// Supabase project URL (e.g., https://xyzcompany.supabase.co)
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Supabase anon key, sent as the apikey header.
    #[arg(long, env = "SUPABASE_ANON_KEY")]
    pub supabase_anon_key: Option<String>,

    // --- General App Args ---
    /// Framework selected for new chats (aida, fab, pas)
    #[arg(long, env = "DEFAULT_FRAMEWORK", default_value = "aida")]
    pub default_framework: String,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Optional path to the TLS certificate file (PEM format) for enabling WSS and HTTPS. Requires --tls-key.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for enabling WSS and HTTPS. Requires --tls-cert.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    /// The configured key, falling back to `DEEPSEEK_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        let primary = self.chat_api_key.trim();
        if !primary.is_empty() {
            return Some(primary.to_string());
        }
        self.deepseek_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }

    pub fn llm_config(&self) -> Result<LlmConfig, ParseLlmTypeError> {
        Ok(LlmConfig {
            llm_type: self.chat_llm_type.parse::<LlmType>()?,
            api_key: self.api_key(),
            completion_model: self.chat_model.clone(),
            base_url: self.chat_base_url.clone(),
            temperature: self.chat_temperature,
        })
    }
}
