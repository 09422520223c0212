use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub payment: PaymentGatewayConfig,
    pub sms_code_ttl_seconds: u64,
}

/// Gateway settings. Without `base_url` the simulated WeChat/Alipay gateway is used.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentGatewayConfig {
    pub base_url: Option<String>,
    pub merchant_id: String,
    pub signing_secret: String,
    pub notify_url: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first (two levels up), local .env as fallback
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP__ overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017/?replicaSet=rs0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "eduplatform".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}/0", host, port)
            });

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::NotFound(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let payment = PaymentGatewayConfig {
            base_url: settings
                .get_string("payment.gateway_url")
                .or_else(|_| env::var("PAYMENT_GATEWAY_URL"))
                .ok()
                .filter(|url| !url.trim().is_empty()),
            merchant_id: settings
                .get_string("payment.merchant_id")
                .or_else(|_| env::var("PAYMENT_MERCHANT_ID"))
                .unwrap_or_else(|_| "dev-merchant".to_string()),
            signing_secret: settings
                .get_string("payment.signing_secret")
                .or_else(|_| env::var("PAYMENT_SIGNING_SECRET"))
                .unwrap_or_else(|_| "dev-signing-secret".to_string()),
            notify_url: settings
                .get_string("payment.notify_url")
                .or_else(|_| env::var("PAYMENT_NOTIFY_URL"))
                .unwrap_or_else(|_| "http://localhost:8081/api/v1/payments/webhook".to_string()),
        };

        let sms_code_ttl_seconds = settings
            .get_int("sms.code_ttl_seconds")
            .ok()
            .map(|v| v.max(1) as u64)
            .or_else(|| {
                env::var("SMS_CODE_TTL_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(300);

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            payment,
            sms_code_ttl_seconds,
        })
    }
}
