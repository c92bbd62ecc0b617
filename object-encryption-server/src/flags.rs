use std::net::SocketAddr;

/// Defines flag options.
#[derive(Debug, Clone)]
pub struct Options {
    pub log_level: String,
    pub http_host: SocketAddr,
    pub base_bucket: String,
    pub kms_key_name: String,
    /// "aws" or "memory".
    pub backend: String,
    pub region: Option<String>,
    pub seed_dir: Option<String>,
}
