use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;
use crate::error::Result;
use crate::parse::RecordParser;

const ENV_BATCH_SIZE: &str = "INFLUXBRIDGE_BATCH_SIZE";
const ENV_MAX_QUEUE_SIZE: &str = "INFLUXBRIDGE_MAX_QUEUE_SIZE";
const ENV_FLUSH_INTERVAL_SECS: &str = "INFLUXBRIDGE_FLUSH_INTERVAL_SECS";
const ENV_MAX_PARALLELISM: &str = "INFLUXBRIDGE_MAX_PARALLELISM";
const ENV_MAX_RETRIES: &str = "INFLUXBRIDGE_MAX_RETRIES";
const ENV_RETRY_BASE_DELAY_MS: &str = "INFLUXBRIDGE_RETRY_BASE_DELAY_MS";
const ENV_RETRY_MAX_DELAY_MS: &str = "INFLUXBRIDGE_RETRY_MAX_DELAY_MS";
const ENV_BREAKER_THRESHOLD: &str = "INFLUXBRIDGE_BREAKER_THRESHOLD";
const ENV_BREAKER_COOLDOWN_SECS: &str = "INFLUXBRIDGE_BREAKER_COOLDOWN_SECS";
const ENV_POLL_TIMEOUT_MS: &str = "INFLUXBRIDGE_POLL_TIMEOUT_MS";
const ENV_SHUTDOWN_GRACE_SECS: &str = "INFLUXBRIDGE_SHUTDOWN_GRACE_SECS";
const ENV_READINESS_TIMEOUT_MS: &str = "INFLUXBRIDGE_READINESS_TIMEOUT_MS";
const ENV_SERVER_PORT: &str = "INFLUXBRIDGE_SERVER_PORT";
const ENV_DEAD_LETTER_PATH: &str = "INFLUXBRIDGE_DEAD_LETTER_PATH";
const ENV_COMMIT_ON_PARSE_FAILURE: &str = "INFLUXBRIDGE_COMMIT_ON_PARSE_FAILURE";
const ENV_PARSER: &str = "INFLUXBRIDGE_PARSER";

const ENV_KAFKA_BROKERS: &str = "INFLUXBRIDGE_KAFKA_BROKERS";
const ENV_KAFKA_TOPIC: &str = "INFLUXBRIDGE_KAFKA_TOPIC";
const ENV_KAFKA_GROUP_ID: &str = "INFLUXBRIDGE_KAFKA_GROUP_ID";
const ENV_KAFKA_SECURITY_PROTOCOL: &str = "INFLUXBRIDGE_KAFKA_SECURITY_PROTOCOL";
const ENV_KAFKA_SASL_MECHANISM: &str = "INFLUXBRIDGE_KAFKA_SASL_MECHANISM";
const ENV_KAFKA_USERNAME: &str = "INFLUXBRIDGE_KAFKA_USERNAME";
// secrets are read without the prefix
const ENV_KAFKA_PASSWORD: &str = "KAFKA_PASSWORD";

const ENV_INFLUXDB_URL: &str = "INFLUXBRIDGE_INFLUXDB_URL";
const ENV_INFLUXDB_ORG: &str = "INFLUXBRIDGE_INFLUXDB_ORG";
const ENV_INFLUXDB_BUCKET: &str = "INFLUXBRIDGE_INFLUXDB_BUCKET";
const ENV_INFLUXDB_RETENTION_SECS: &str = "INFLUXBRIDGE_INFLUXDB_RETENTION_SECS";
const ENV_INFLUXDB_TIMEOUT_MS: &str = "INFLUXBRIDGE_INFLUXDB_TIMEOUT_MS";
const ENV_INFLUXDB_TOKEN: &str = "INFLUXDB_TOKEN";

const DEFAULT_SASL_MECHANISM: &str = "PLAIN";

/// Retry policy of the resilient writer. One initial attempt is followed by up to
/// `max_retries` retries, the delay before retry k being `base_delay * 2^(k-1)` capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub threshold: usize,
    /// How long the breaker stays open before a trial call is let through.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub group_id: String,
    pub security_protocol: Option<String>,
    pub sasl: Option<SaslSettings>,
}

#[derive(Clone, PartialEq)]
pub struct SaslSettings {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

impl Debug for SaslSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslSettings")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"*****")
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct InfluxSettings {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    /// 0 keeps data forever.
    pub retention_seconds: u64,
    pub timeout: Duration,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            org: String::new(),
            bucket: String::new(),
            token: None,
            retention_seconds: 0,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Debug for InfluxSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxSettings")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "*****"))
            .field("retention_seconds", &self.retention_seconds)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub flush_interval: Duration,
    pub max_parallelism: usize,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub poll_timeout: Duration,
    /// Pause after a failed poll before polling again.
    pub poll_error_delay: Duration,
    pub shutdown_grace: Duration,
    pub readiness_timeout: Duration,
    pub server_port: u16,
    pub dead_letter_path: PathBuf,
    pub commit_on_parse_failure: bool,
    pub parser: RecordParser,
    pub kafka: KafkaSettings,
    pub influx: InfluxSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_queue_size: 10_000,
            flush_interval: Duration::from_secs(5),
            max_parallelism: 10,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            poll_timeout: Duration::from_millis(1000),
            poll_error_delay: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
            readiness_timeout: Duration::from_millis(2000),
            server_port: 8080,
            dead_letter_path: PathBuf::from("dead-letter.jsonl"),
            commit_on_parse_failure: false,
            parser: RecordParser::default(),
            kafka: KafkaSettings::default(),
            influx: InfluxSettings::default(),
        }
    }
}

impl Settings {
    /// Reads the settings from the process environment.
    pub fn load() -> Result<Self> {
        env::vars().collect::<HashMap<String, String>>().try_into()
    }
}

/// Parses an optional variable that must be strictly positive.
fn positive<T>(env_vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr + PartialOrd + Default,
    T::Err: Debug,
{
    let Some(raw) = env_vars.get(key) else {
        return Ok(None);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Parsing {key}(set to '{raw}'): {e:?}")))?;
    if value <= T::default() {
        return Err(Error::Config(format!(
            "{key} must be positive, set to '{raw}'"
        )));
    }
    Ok(Some(value))
}

fn required(env_vars: &HashMap<String, String>, key: &str) -> Result<String> {
    match env_vars.get(key).map(|v| v.trim()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(Error::Config(format!(
            "Environment variable {key} is not set"
        ))),
    }
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl TryFrom<HashMap<String, String>> for Settings {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> std::result::Result<Self, Self::Error> {
        let mut settings = Settings::default();

        if let Some(v) = positive(&env_vars, ENV_BATCH_SIZE)? {
            settings.batch_size = v;
        }
        if let Some(v) = positive(&env_vars, ENV_MAX_QUEUE_SIZE)? {
            settings.max_queue_size = v;
        }
        if let Some(v) = positive(&env_vars, ENV_FLUSH_INTERVAL_SECS)? {
            settings.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = positive(&env_vars, ENV_MAX_PARALLELISM)? {
            settings.max_parallelism = v;
        }
        if let Some(v) = positive(&env_vars, ENV_MAX_RETRIES)? {
            settings.retry.max_retries = v;
        }
        if let Some(v) = positive(&env_vars, ENV_RETRY_BASE_DELAY_MS)? {
            settings.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = positive(&env_vars, ENV_RETRY_MAX_DELAY_MS)? {
            settings.retry.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = positive(&env_vars, ENV_BREAKER_THRESHOLD)? {
            settings.breaker.threshold = v;
        }
        if let Some(v) = positive(&env_vars, ENV_BREAKER_COOLDOWN_SECS)? {
            settings.breaker.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = positive(&env_vars, ENV_POLL_TIMEOUT_MS)? {
            settings.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = positive(&env_vars, ENV_SHUTDOWN_GRACE_SECS)? {
            settings.shutdown_grace = Duration::from_secs(v);
        }
        if let Some(v) = positive(&env_vars, ENV_READINESS_TIMEOUT_MS)? {
            settings.readiness_timeout = Duration::from_millis(v);
        }
        if let Some(v) = positive(&env_vars, ENV_SERVER_PORT)? {
            settings.server_port = v;
        }
        if let Some(path) = env_vars.get(ENV_DEAD_LETTER_PATH) {
            settings.dead_letter_path = PathBuf::from(path);
        }
        if let Some(raw) = env_vars.get(ENV_COMMIT_ON_PARSE_FAILURE) {
            settings.commit_on_parse_failure = raw.trim().parse().map_err(|e| {
                Error::Config(format!(
                    "Parsing {ENV_COMMIT_ON_PARSE_FAILURE}(set to '{raw}'): {e:?}"
                ))
            })?;
        }
        if let Some(raw) = env_vars.get(ENV_PARSER) {
            settings.parser = raw.trim().parse()?;
        }

        if settings.retry.max_delay < settings.retry.base_delay {
            return Err(Error::Config(format!(
                "{ENV_RETRY_MAX_DELAY_MS} must not be smaller than {ENV_RETRY_BASE_DELAY_MS}"
            )));
        }
        if settings.batch_size > settings.max_queue_size {
            return Err(Error::Config(format!(
                "{ENV_BATCH_SIZE} must not be larger than {ENV_MAX_QUEUE_SIZE}"
            )));
        }

        settings.kafka.brokers = list(&required(&env_vars, ENV_KAFKA_BROKERS)?);
        settings.kafka.topics = list(&required(&env_vars, ENV_KAFKA_TOPIC)?);
        if settings.kafka.brokers.is_empty() || settings.kafka.topics.is_empty() {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_BROKERS} and {ENV_KAFKA_TOPIC} must name at least one entry"
            )));
        }
        settings.kafka.group_id = required(&env_vars, ENV_KAFKA_GROUP_ID)?;
        settings.kafka.security_protocol = env_vars.get(ENV_KAFKA_SECURITY_PROTOCOL).cloned();

        // If username is set, the password also must be set
        if let Some(username) = env_vars.get(ENV_KAFKA_USERNAME) {
            let Some(password) = env_vars.get(ENV_KAFKA_PASSWORD) else {
                return Err(Error::Config(format!(
                    "Env variable {ENV_KAFKA_USERNAME} is set, but {ENV_KAFKA_PASSWORD} is not set"
                )));
            };
            settings.kafka.sasl = Some(SaslSettings {
                mechanism: env_vars
                    .get(ENV_KAFKA_SASL_MECHANISM)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_SASL_MECHANISM.to_string()),
                username: username.to_owned(),
                password: password.to_owned(),
            });
        }

        settings.influx.url = required(&env_vars, ENV_INFLUXDB_URL)?;
        settings.influx.org = required(&env_vars, ENV_INFLUXDB_ORG)?;
        settings.influx.bucket = required(&env_vars, ENV_INFLUXDB_BUCKET)?;
        settings.influx.token = env_vars.get(ENV_INFLUXDB_TOKEN).cloned();
        if let Some(raw) = env_vars.get(ENV_INFLUXDB_RETENTION_SECS) {
            settings.influx.retention_seconds = raw.trim().parse().map_err(|e| {
                Error::Config(format!(
                    "Parsing {ENV_INFLUXDB_RETENTION_SECS}(set to '{raw}'): {e:?}"
                ))
            })?;
        }
        if let Some(v) = positive(&env_vars, ENV_INFLUXDB_TIMEOUT_MS)? {
            settings.influx.timeout = Duration::from_millis(v);
        }

        Ok(settings)
    }
}
