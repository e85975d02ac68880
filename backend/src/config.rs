use std::time::Duration;

use clap::{Args, Parser};
use dotenvy::dotenv;

use crate::ingest::IngestionPolicy;

#[derive(Debug, Clone, Args)]
pub struct HttpConfig {
    #[arg(id = "http_host", long = "http-host", env = "HTTP_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(id = "http_port", long = "http-port", env = "HTTP_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Allowed CORS origin. Any origin is allowed when unset.
    #[arg(long = "cors-allowed-origin", env = "CORS_ALLOWED_ORIGIN")]
    pub cors_origin: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct MqttConfig {
    #[arg(id = "mqtt_host", long = "mqtt-host", env = "MQTT_HOST")]
    pub host: String,

    #[arg(id = "mqtt_port", long = "mqtt-port", env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    #[arg(
        long = "mqtt-client-id",
        env = "MQTT_CLIENT_ID",
        default_value = "gas-leak-backend"
    )]
    pub client_id: String,

    #[arg(long = "mqtt-username", env = "MQTT_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "mqtt-password", env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(
        long = "mqtt-data-topic",
        env = "MQTT_DATA_TOPIC",
        default_value = "/gas_leak/data"
    )]
    pub data_topic: String,

    #[arg(
        long = "mqtt-command-topic",
        env = "MQTT_COMMAND_TOPIC",
        default_value = "/gas_leak/command"
    )]
    pub command_topic: String,

    /// Keep-alive interval in seconds, at least 5.
    #[arg(
        long = "mqtt-keep-alive-secs",
        env = "MQTT_KEEP_ALIVE_SECS",
        default_value = "30",
        value_parser = keep_alive_secs
    )]
    pub keep_alive: Duration,

    /// Pause between reconnect attempts, in seconds.
    #[arg(
        long = "mqtt-reconnect-delay-secs",
        env = "MQTT_RECONNECT_DELAY_SECS",
        default_value = "5",
        value_parser = positive_secs
    )]
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Gas leak sensor and door bridge")]
pub struct Config {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[command(flatten)]
    pub http: HttpConfig,

    #[command(flatten)]
    pub mqtt: MqttConfig,

    /// Upper bound on a single store call, in milliseconds.
    #[arg(
        long = "store-timeout-ms",
        env = "STORE_TIMEOUT_MS",
        default_value = "5000",
        value_parser = positive_millis
    )]
    pub store_timeout: Duration,

    /// How long a door command may wait for its write confirmation, in milliseconds.
    #[arg(
        long = "publish-timeout-ms",
        env = "PUBLISH_TIMEOUT_MS",
        default_value = "5000",
        value_parser = positive_millis
    )]
    pub publish_timeout: Duration,

    /// `best-effort` or `retry:<attempts>:<backoff_ms>`.
    #[arg(long, env = "INGESTION_POLICY", default_value = "best-effort")]
    pub ingestion_policy: IngestionPolicy,
}

impl Config {
    /// Reads flags and the process environment, after loading `.env` if
    /// present. Exits with a usage message on invalid values.
    pub fn load() -> Self {
        dotenv().ok();
        Self::parse()
    }
}

fn positive(raw: &str) -> Result<u64, String> {
    match raw.parse::<u64>().map_err(|e| e.to_string())? {
        0 => Err("must be greater than zero".to_string()),
        n => Ok(n),
    }
}

fn positive_millis(raw: &str) -> Result<Duration, String> {
    positive(raw).map(Duration::from_millis)
}

fn positive_secs(raw: &str) -> Result<Duration, String> {
    positive(raw).map(Duration::from_secs)
}

fn keep_alive_secs(raw: &str) -> Result<Duration, String> {
    let keep_alive = positive_secs(raw)?;
    if keep_alive < Duration::from_secs(5) {
        return Err("must be at least 5 seconds".to_string());
    }
    Ok(keep_alive)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 4] = ["--database-url", "gas.db", "--mqtt-host", "broker.local"];

    fn config_from(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(
            std::iter::once("gas-leak-backend")
                .chain(REQUIRED)
                .chain(args.iter().copied()),
        )
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&[]).unwrap();

        assert_eq!(config.database_url, "gas.db");
        assert_eq!(config.http.port, 3000);
        assert_eq!(config.http.cors_origin, None);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.data_topic, "/gas_leak/data");
        assert_eq!(config.mqtt.command_topic, "/gas_leak/command");
        assert_eq!(config.mqtt.username, None);
        assert_eq!(config.mqtt.keep_alive, Duration::from_secs(30));
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.ingestion_policy, IngestionPolicy::BestEffort);
    }

    #[test]
    fn overrides_apply() {
        let config = config_from(&[
            "--mqtt-port",
            "8883",
            "--mqtt-username",
            "nhom9_gas",
            "--mqtt-password",
            "secret",
            "--http-port",
            "8081",
            "--cors-allowed-origin",
            "http://127.0.0.1:8080",
            "--publish-timeout-ms",
            "250",
            "--ingestion-policy",
            "retry:2:100",
        ])
        .unwrap();

        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("nhom9_gas"));
        assert_eq!(config.http.port, 8081);
        assert_eq!(
            config.http.cors_origin.as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(config.publish_timeout, Duration::from_millis(250));
        assert!(matches!(
            config.ingestion_policy,
            IngestionPolicy::Retry { attempts: 2, .. }
        ));
    }

    #[test]
    fn missing_required_values_fail() {
        let err = Config::try_parse_from(["gas-leak-backend", "--mqtt-host", "broker.local"])
            .unwrap_err();
        assert!(err.to_string().contains("--database-url"));

        let err =
            Config::try_parse_from(["gas-leak-backend", "--database-url", "gas.db"]).unwrap_err();
        assert!(err.to_string().contains("--mqtt-host"));
    }

    #[test]
    fn invalid_values_fail() {
        for args in [
            ["--http-port", "http"],
            ["--mqtt-keep-alive-secs", "1"],
            ["--ingestion-policy", "sometimes"],
            ["--store-timeout-ms", "0"],
            ["--publish-timeout-ms", "0"],
            ["--mqtt-reconnect-delay-secs", "0"],
        ] {
            let err = config_from(&args).unwrap_err();
            assert!(err.to_string().contains(args[0]), "{err}");
        }
    }
}
