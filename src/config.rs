// Application configuration, loaded from environment variables and CLI flags.

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (SQLite connection string).
    pub database_url: String,
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// API key for the completion endpoint.
    pub openai_api_key: Option<String>,
    /// Base URL of the OpenAI-compatible completion API.
    pub openai_base_url: String,
    /// Model id used for the generate/refine stages.
    pub model_premium: String,
    /// Model id used for the critique/judge stages.
    pub model_economy: String,
    /// Token required by the entitlement-creation endpoint.
    pub admin_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `DATABASE_URL` - SQLite connection string (default: `sqlite:arena.db?mode=rwc`)
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `OPENAI_API_KEY` - completion API key (required to run battles)
    /// - `OPENAI_BASE_URL` - completion API base (default: `https://api.openai.com/v1`)
    /// - `OPENAI_MODEL_PREMIUM` - generate/refine model (default: `gpt-4o`)
    /// - `OPENAI_MODEL_ECONOMY` - critique/judge model (default: `gpt-4o-mini`)
    /// - `ADMIN_TOKEN` - shared secret for POST /api/entitlements
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:arena.db?mode=rwc".to_string());

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3000);

        // Some deployment tooling feeds env vars through heredocs and leaves
        // trailing newlines on the values, hence the trims.
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|v| v.trim().to_string());

        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let model_premium = std::env::var("OPENAI_MODEL_PREMIUM")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "gpt-4o".to_string());

        let model_economy = std::env::var("OPENAI_MODEL_ECONOMY")
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let admin_token = std::env::var("ADMIN_TOKEN").ok();

        Config {
            database_url,
            port,
            openai_api_key,
            openai_base_url,
            model_premium,
            model_economy,
            admin_token,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}
