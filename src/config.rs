use std::env;
use std::time::Duration;

/// Environment-derived settings, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Base URL used for certificate verification links.
    pub app_url: String,
    pub bakong: BakongConfig,
}

#[derive(Clone, Debug)]
pub struct BakongConfig {
    pub base_url: String,
    pub merchant_account: String,
    pub merchant_name: String,
    /// Shared secret for webhook HMAC signatures.
    pub webhook_secret: String,
    pub request_timeout: Duration,
    /// How long a generated QR stays payable.
    pub qr_ttl: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8081);
        let app_url =
            env::var("APP_URL").unwrap_or_else(|_| format!("http://localhost:{}", port));

        let timeout_secs: u64 = env::var("BAKONG_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let bakong = BakongConfig {
            base_url: env::var("BAKONG_BASE_URL")
                .unwrap_or_else(|_| "https://api-bakong.nbc.gov.kh".into()),
            merchant_account: env::var("BAKONG_MERCHANT_ACCOUNT")
                .unwrap_or_else(|_| "merchant@devb".into()),
            merchant_name: env::var("BAKONG_MERCHANT_NAME")
                .unwrap_or_else(|_| "LMS".into()),
            webhook_secret: env::var("BAKONG_WEBHOOK_SECRET").unwrap_or_default(),
            request_timeout: Duration::from_secs(timeout_secs),
            qr_ttl: Duration::from_secs(15 * 60),
        };

        Ok(Config {
            database_url,
            port,
            app_url,
            bakong,
        })
    }
}
