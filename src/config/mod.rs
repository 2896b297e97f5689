use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Object storage bucket name (S3-compatible)
    pub s3_bucket: String,

    /// Object storage access key ID
    pub s3_access_key: String,

    /// Object storage secret access key
    pub s3_secret_key: String,

    /// Object storage endpoint URL
    pub s3_endpoint: String,

    /// Base URL under which stored objects are publicly reachable
    pub s3_public_base_url: String,

    /// Recognition service endpoint URL
    pub recognition_url: String,

    /// Recognition service API token
    pub recognition_token: String,

    /// Managed-function processing channel URL (primary trigger candidate)
    #[serde(default)]
    pub process_function_url: Option<String>,

    /// Deployment environment; the localhost trigger fallback is only
    /// enabled when this is not "production".
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Upload rate limit: max requests per identifier per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,

    /// Upload rate limit window in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_rate_limit_max() -> usize {
    100
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Port the server listens on, for the localhost trigger fallback.
    pub fn local_port(&self) -> u16 {
        self.bind_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(3000)
    }
}
