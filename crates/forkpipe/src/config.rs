//! Run configuration: CLI vector length plus `FORKPIPE_*` environment
//! variables, with builder methods for programmatic use.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_VECTOR_LEN: usize = 5;
pub const MAX_CLI_VECTOR_LEN: usize = 9;

const MAX_POLL_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("vector length must be an integer between 1 and 9, got {0:?}")]
    VectorLength(String),

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("FORKPIPE_INPUT has {actual} values but the vector length is {expected}")]
    InputLength { expected: usize, actual: usize },
}

/// Parses the CLI vector length: digits only, `1..=9`.
pub fn parse_vector_len(arg: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::VectorLength(arg.to_string());
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    match arg.parse::<usize>() {
        Ok(n) if (1..=MAX_CLI_VECTOR_LEN).contains(&n) => Ok(n),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// `fifo1` / `fifo2` in a directory.
    Named,
    /// Two `pipe(2)` pairs inherited across fork.
    Anonymous,
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" | "named" => Ok(Self::Named),
            "pipe" | "anonymous" => Ok(Self::Anonymous),
            other => Err(format!("expected fifo or pipe, got {other}")),
        }
    }
}

/// Bound and backoff for the Command Worker's aggregate poll.
///
/// The poll is a liveness risk by construction: a Sum Worker slower than
/// the whole backoff schedule makes the Command Worker give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl PollPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(400, Duration::from_millis(5), MAX_POLL_BACKOFF)
    }
}

/// Settings a forked worker needs.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Sum Worker startup delay.
    pub sum_delay: Duration,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub vector_len: usize,
    pub channel_kind: ChannelKind,
    pub fifo_dir: PathBuf,
    pub command: String,
    pub seed: Option<u64>,
    pub input: Option<Vec<i32>>,
    pub wait_interval: Duration,
    pub kill_grace: Duration,
    pub worker: WorkerConfig,
}

impl RunConfig {
    pub fn new(vector_len: usize) -> Self {
        Self {
            vector_len,
            channel_kind: ChannelKind::Named,
            fifo_dir: PathBuf::from("."),
            command: "multiply".to_string(),
            seed: None,
            input: None,
            wait_interval: Duration::from_secs(2),
            kill_grace: Duration::from_secs(5),
            worker: WorkerConfig::default(),
        }
    }

    pub fn with_channel_kind(mut self, kind: ChannelKind) -> Self {
        self.channel_kind = kind;
        self
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_input(mut self, input: Vec<i32>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_sum_delay(mut self, delay: Duration) -> Self {
        self.worker.sum_delay = delay;
        self
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.worker.poll = policy;
        self
    }

    pub fn from_env(vector_len: usize) -> Result<Self, ConfigError> {
        Self::from_lookup(vector_len, |var| std::env::var(var).ok())
    }

    /// Builds a config from `vector_len` and whatever `lookup` returns for
    /// each `FORKPIPE_*` variable.
    pub fn from_lookup(vector_len: usize, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new(vector_len);

        if let Some(kind) = parse_var(&lookup, "FORKPIPE_TRANSPORT")? {
            config.channel_kind = kind;
        }
        if let Some(dir) = lookup("FORKPIPE_FIFO_DIR") {
            config.fifo_dir = PathBuf::from(dir);
        }
        if let Some(command) = lookup("FORKPIPE_COMMAND") {
            config.command = command;
        }
        config.seed = parse_var(&lookup, "FORKPIPE_SEED")?;
        if let Some(raw) = lookup("FORKPIPE_INPUT") {
            let input = parse_input(&raw)?;
            if input.len() != vector_len {
                return Err(ConfigError::InputLength {
                    expected: vector_len,
                    actual: input.len(),
                });
            }
            config.input = Some(input);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FORKPIPE_SUM_DELAY_MS")? {
            config.worker.sum_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FORKPIPE_WAIT_INTERVAL_MS")? {
            config.wait_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "FORKPIPE_POLL_ATTEMPTS")? {
            config.worker.poll.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FORKPIPE_POLL_BACKOFF_MS")? {
            let initial = Duration::from_millis(ms);
            config.worker.poll.initial_backoff = initial;
            config.worker.poll.max_backoff = MAX_POLL_BACKOFF.max(initial);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FORKPIPE_KILL_GRACE_MS")? {
            config.kill_grace = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
        value,
    })
}

fn parse_input(raw: &str) -> Result<Vec<i32>, ConfigError> {
    raw.split(',')
        .map(|item| {
            item.trim().parse::<i32>().map_err(|e| ConfigError::Invalid {
                var: "FORKPIPE_INPUT",
                value: raw.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn vector_len_accepts_one_through_nine() {
        for n in 1..=9 {
            assert_eq!(parse_vector_len(&n.to_string()).unwrap(), n);
        }
    }

    #[test]
    fn vector_len_rejects_everything_else() {
        for arg in ["0", "10", "", "abc", "-3", "+3", " 3", "3x", "99999999999999999999999"] {
            assert!(
                matches!(parse_vector_len(arg), Err(ConfigError::VectorLength(_))),
                "{arg:?} should be rejected"
            );
        }
    }

    #[test]
    fn defaults_without_environment() {
        let config = RunConfig::from_lookup(5, lookup(&[])).unwrap();

        assert_eq!(config.vector_len, 5);
        assert_eq!(config.channel_kind, ChannelKind::Named);
        assert_eq!(config.fifo_dir, PathBuf::from("."));
        assert_eq!(config.command, "multiply");
        assert_eq!(config.seed, None);
        assert_eq!(config.input, None);
        assert_eq!(config.wait_interval, Duration::from_secs(2));
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert_eq!(config.worker.sum_delay, Duration::ZERO);
        assert_eq!(config.worker.poll, PollPolicy::default());
    }

    #[test]
    fn environment_overrides() {
        let config = RunConfig::from_lookup(
            3,
            lookup(&[
                ("FORKPIPE_TRANSPORT", "pipe"),
                ("FORKPIPE_FIFO_DIR", "/tmp/run"),
                ("FORKPIPE_COMMAND", "unknown"),
                ("FORKPIPE_SEED", "42"),
                ("FORKPIPE_INPUT", "2, 5,9"),
                ("FORKPIPE_SUM_DELAY_MS", "100"),
                ("FORKPIPE_WAIT_INTERVAL_MS", "50"),
                ("FORKPIPE_POLL_ATTEMPTS", "7"),
                ("FORKPIPE_POLL_BACKOFF_MS", "1000"),
                ("FORKPIPE_KILL_GRACE_MS", "10"),
            ]),
        )
        .unwrap();

        assert_eq!(config.channel_kind, ChannelKind::Anonymous);
        assert_eq!(config.fifo_dir, PathBuf::from("/tmp/run"));
        assert_eq!(config.command, "unknown");
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.input, Some(vec![2, 5, 9]));
        assert_eq!(config.worker.sum_delay, Duration::from_millis(100));
        assert_eq!(config.wait_interval, Duration::from_millis(50));
        assert_eq!(config.kill_grace, Duration::from_millis(10));
        assert_eq!(
            config.worker.poll,
            PollPolicy::new(7, Duration::from_secs(1), Duration::from_secs(1))
        );
    }

    #[test]
    fn input_length_must_match() {
        let err = RunConfig::from_lookup(4, lookup(&[("FORKPIPE_INPUT", "2,5,9")])).unwrap_err();
        assert!(matches!(err, ConfigError::InputLength { expected: 4, actual: 3 }));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = RunConfig::from_lookup(5, lookup(&[("FORKPIPE_TRANSPORT", "socket")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid FORKPIPE_TRANSPORT="socket": expected fifo or pipe, got socket"#
        );

        let err = RunConfig::from_lookup(5, lookup(&[("FORKPIPE_KILL_GRACE_MS", "-1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FORKPIPE_KILL_GRACE_MS", .. }));

        let err = RunConfig::from_lookup(1, lookup(&[("FORKPIPE_INPUT", "x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "FORKPIPE_INPUT", .. }));
    }

    #[test]
    fn builders_override_defaults() {
        let config = RunConfig::new(2)
            .with_channel_kind(ChannelKind::Anonymous)
            .with_command("multiply")
            .with_input(vec![3, 4])
            .with_seed(7)
            .with_sum_delay(Duration::from_millis(1))
            .with_poll_policy(PollPolicy::new(1, Duration::ZERO, Duration::ZERO));

        assert_eq!(config.channel_kind, ChannelKind::Anonymous);
        assert_eq!(config.input.as_deref(), Some(&[3, 4][..]));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.worker.poll.max_attempts, 1);
    }
}
