use crate::error::ConfigError;
use crate::lifecycle::LifecyclePolicy;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for every configured duration: one year.
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8121")]
    pub listen: String,

    /// Base URL of the OpenAI-compatible completion service.
    #[arg(
        long,
        env = "RELAY_UPSTREAM_URL",
        default_value = "https://api.siliconflow.cn/v1"
    )]
    pub upstream_url: String,

    #[arg(long, env = "RELAY_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "RELAY_MODEL", default_value = "Qwen/Qwen3-8B")]
    pub model: String,

    /// Maximum lifetime of a completion stream.
    #[arg(long, env = "RELAY_COMPLETION_TIMEOUT_SECS", default_value_t = 300)]
    pub completion_timeout_secs: u64,

    /// Maximum lifetime of a hot content stream.
    #[arg(long, env = "RELAY_HOT_TIMEOUT_SECS", default_value_t = 3600)]
    pub hot_timeout_secs: u64,

    /// Pause between two hot content items.
    #[arg(long, env = "RELAY_HOT_INTERVAL_SECS", default_value_t = 5)]
    pub hot_interval_secs: u64,

    #[arg(long, env = "RELAY_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,

    /// Threads running upstream calls.
    #[arg(long, env = "RELAY_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Events buffered between a worker and its connection.
    #[arg(long, env = "RELAY_CHANNEL_CAPACITY", default_value_t = 64)]
    pub channel_capacity: usize,

    /// JSON array of hot content entries.
    #[arg(long, env = "RELAY_HOT_CONTENT")]
    pub hot_content: Option<PathBuf>,

    /// JSON object mapping session tokens to user ids.
    #[arg(long, env = "RELAY_SESSIONS")]
    pub sessions: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub upstream_url: String,
    pub api_key: String,
    pub model: String,
    pub completion: LifecyclePolicy,
    pub hot: LifecyclePolicy,
    pub hot_interval: Duration,
    pub workers: usize,
    pub channel_capacity: usize,
    pub hot_content: Option<PathBuf>,
    pub sessions: Option<PathBuf>,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen = args
            .listen
            .parse()
            .map_err(|_| ConfigError::Listen(args.listen.clone()))?;

        let keep_alive = seconds("keep-alive-secs", args.keep_alive_secs)?;

        Ok(Self {
            listen,
            upstream_url: args.upstream_url,
            api_key: args.api_key,
            model: args.model,
            completion: LifecyclePolicy {
                max_lifetime: seconds("completion-timeout-secs", args.completion_timeout_secs)?,
                keep_alive,
            },
            hot: LifecyclePolicy {
                max_lifetime: seconds("hot-timeout-secs", args.hot_timeout_secs)?,
                keep_alive,
            },
            hot_interval: seconds("hot-interval-secs", args.hot_interval_secs)?,
            workers: non_zero("workers", args.workers)?,
            channel_capacity: non_zero("channel-capacity", args.channel_capacity)?,
            hot_content: args.hot_content,
            sessions: args.sessions,
        })
    }
}

fn seconds(name: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if non_zero(name, value)? > MAX_DURATION_SECS {
        return Err(ConfigError::TooLong {
            name,
            max_secs: MAX_DURATION_SECS,
        });
    }
    Ok(Duration::from_secs(value))
}

fn non_zero<T: PartialEq + Default>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Zero(name));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use clap::Parser;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["chat-relay", "serve", "--api-key", "k"];
        argv.extend_from_slice(extra);
        match Cli::parse_from(argv).command {
            crate::Command::Serve(args) => args,
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn defaults_produce_two_lifetime_bounds() {
        let config = RelayConfig::try_from(serve_args(&[])).unwrap();
        assert_eq!(config.completion.max_lifetime, Duration::from_secs(300));
        assert_eq!(config.hot.max_lifetime, Duration::from_secs(3600));
        assert_eq!(config.hot_interval, Duration::from_secs(5));
        assert_eq!(config.listen.port(), 8121);
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = RelayConfig::try_from(serve_args(&["--workers", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Zero("workers")));

        let err = RelayConfig::try_from(serve_args(&["--completion-timeout-secs", "0"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("completion-timeout-secs")));
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = RelayConfig::try_from(serve_args(&[
            "--hot-timeout-secs",
            "18446744073709551615",
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::TooLong {
                name: "hot-timeout-secs",
                ..
            }
        ));

        let err = RelayConfig::try_from(serve_args(&["--keep-alive-secs", "31536001"]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TooLong { name: "keep-alive-secs", .. }));

        let config = RelayConfig::try_from(serve_args(&[
            "--hot-timeout-secs",
            "31536000",
            "--sessions",
            "sessions.json",
        ]))
        .unwrap();
        assert_eq!(config.hot.max_lifetime, Duration::from_secs(31_536_000));
        assert_eq!(config.sessions, Some(PathBuf::from("sessions.json")));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let err = RelayConfig::try_from(serve_args(&["--listen", "nowhere"])).unwrap_err();
        assert!(matches!(err, ConfigError::Listen(_)));
    }
}
