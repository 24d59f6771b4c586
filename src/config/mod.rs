use std::env;
use std::time::Duration;

/// Process-wide configuration snapshot, loaded once at startup and threaded
/// explicitly through [`crate::state::AppState`]. There is no ambient global
/// config — every component that needs a setting receives it through its
/// constructor.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
    pub is_dev: bool,

    /// NOTIFY channel name the Notify Listener subscribes to.
    pub listen_channel: String,
    /// Poll Watcher sweep interval.
    pub poll_interval: Duration,
    /// Poll Watcher batch size per sweep.
    pub poll_batch_size: i64,
    /// Notify Listener reconnect base delay.
    pub reconnect_base_delay: Duration,
    /// Notify Listener hard reconnect-attempt ceiling.
    pub reconnect_attempt_ceiling: u32,
    /// Window before token expiry at which TOKEN_EXPIRING_SOON is emitted.
    pub token_expiry_warning: Duration,
    /// Per-connection outbound byte cap before the connection is considered stuck.
    pub outbound_byte_cap: usize,
    /// Window after which an unclaimed subscription row is eligible for stale cleanup.
    pub stale_subscription_window: Duration,
    /// Deadline for any single database call (spec section 5).
    pub db_call_deadline: Duration,
    /// Deadline for any single outbound socket write (spec section 5's
    /// "whichever trips first" alongside the queued-bytes cap).
    pub socket_write_deadline: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            jwt_secret: env::var("JWT_SECRET")?,
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            is_dev: env::var("APP_ENV").as_deref() != Ok("production"),

            listen_channel: env::var("LISTEN_CHANNEL")
                .unwrap_or_else(|_| "entity_changes".to_string()),
            poll_interval: Duration::from_millis(parse_or(
                env::var("POLL_INTERVAL_MS").ok(),
                60_000,
            )),
            poll_batch_size: parse_or(env::var("POLL_BATCH_SIZE").ok(), 1000),
            reconnect_base_delay: Duration::from_millis(parse_or(
                env::var("RECONNECT_BASE_DELAY_MS").ok(),
                5_000,
            )),
            reconnect_attempt_ceiling: parse_or(env::var("RECONNECT_ATTEMPT_CEILING").ok(), 10),
            token_expiry_warning: Duration::from_secs(parse_or(
                env::var("TOKEN_EXPIRY_WARNING_SECS").ok(),
                300,
            )),
            outbound_byte_cap: parse_or(env::var("OUTBOUND_BYTE_CAP").ok(), 1_048_576),
            stale_subscription_window: Duration::from_secs(parse_or(
                env::var("STALE_SUBSCRIPTION_WINDOW_SECS").ok(),
                300,
            )),
            db_call_deadline: Duration::from_secs(parse_or(
                env::var("DB_CALL_DEADLINE_SECS").ok(),
                5,
            )),
            socket_write_deadline: Duration::from_secs(parse_or(
                env::var("SOCKET_WRITE_DEADLINE_SECS").ok(),
                5,
            )),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
