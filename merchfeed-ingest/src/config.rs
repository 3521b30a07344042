use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

/// Worker configuration, read from the environment over built-in defaults.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: usize,
    pub batch_size: usize,
    /// Feed request timeout in seconds.
    pub http_timeout: u64,
    pub user_agent: String,
    pub rabbitmq_url: String,
    pub rabbitmq_exchange: String,
    pub rabbitmq_queue: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_pool_size: 5,
            batch_size: 50,
            http_timeout: 10,
            user_agent: concat!("merchfeed/", env!("CARGO_PKG_VERSION")).to_owned(),
            rabbitmq_url: String::new(),
            rabbitmq_exchange: "merchfeed-ex".to_owned(),
            rabbitmq_queue: "merchfeed.commands".to_owned(),
        }
    }
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Env::raw().only(&[
            "DATABASE_URL",
            "DB_POOL_SIZE",
            "BATCH_SIZE",
            "HTTP_TIMEOUT",
            "USER_AGENT",
            "RABBITMQ_URL",
            "RABBITMQ_EXCHANGE",
            "RABBITMQ_QUEUE",
        ]))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}
