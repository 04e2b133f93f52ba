use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::{
    application::{invoker::InvokerSettings, puller::PullSettings, writer::WriterSettings},
    domain::{
        blob_path::{AppendNaming, WriteMode},
        error::PersistorError,
    },
};

/// Upper bound for messages stored in one batch.
pub const MAX_ALLOWED_BATCH_SIZE: usize = 10_000;

/// Upper bound for concurrent workers in one invocation.
pub const MAX_WORKERS: usize = 64;

/// Upper bound for calls issued by one fan-out.
pub const MAX_CALLS: usize = 256;

/// Upper bound for any configured duration (one day).
pub const MAX_DURATION_SECONDS: f64 = 86_400.0;

/// Per-append limit of the storage backend (4 MiB).
pub const DEFAULT_MAX_APPEND_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Sqs {
        queue_url: String,
    },
    JetStream {
        url: String,
        stream: String,
        consumer_group: String,
    },
}

impl SourceConfig {
    /// Destination folder used when `STORE_PARAM` is not set: the queue or stream name.
    pub fn default_folder(&self) -> String {
        match self {
            SourceConfig::Sqs { queue_url } => queue_url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or(queue_url)
                .to_string(),
            SourceConfig::JetStream { stream, .. } => stream.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    S3,
    Filesystem { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PersistorConfig {
    pub source: SourceConfig,
    pub storage: StorageConfig,
    pub container: String,
    pub store_param: String,
    pub aws_endpoint_url: Option<String>,
    pub write_mode: WriteMode,
    pub include_metadata: bool,
    pub max_batch_size: usize,
    pub pull_timeout: Duration,
    pub worker_count: usize,
    pub deadline: Duration,
    pub safety_margin: Duration,
    pub stop_when_idle: bool,
    pub max_append_bytes: usize,
    pub write_attempts: u32,
    pub function_url: Option<String>,
    pub invoker_timeout: Duration,
    pub inter_call_delay: Duration,
    pub listen_addr: String,
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn require(&self, name: &str, what: &str) -> Result<String, PersistorError> {
        self.get(name)
            .ok_or_else(|| PersistorError::Config(format!("No {} given ({} is not set)", what, name)))
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T, PersistorError> {
        match self.get(name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| PersistorError::Config(format!("Invalid value for {}: '{}'", name, raw))),
            None => Ok(default),
        }
    }

    fn seconds(&self, name: &str, default: f64) -> Result<Duration, PersistorError> {
        let secs: f64 = self.parse(name, default)?;
        if !secs.is_finite() || !(0.0..=MAX_DURATION_SECONDS).contains(&secs) {
            return Err(PersistorError::Config(format!(
                "Invalid value for {}: must be between 0 and {} seconds",
                name, MAX_DURATION_SECONDS
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| PersistorError::Config(format!("Invalid value for {}: {}", name, e)))
    }
}

impl PersistorConfig {
    pub fn from_env() -> Result<Self, PersistorError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, PersistorError> {
        Self::from_lookup(|name| vars.get(name).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PersistorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let source = match vars.require("PERSISTOR_SOURCE", "messaging source")?.to_uppercase().as_str() {
            "SQS" => SourceConfig::Sqs {
                queue_url: vars.require("SQS_QUEUE_URL", "SQS queue URL")?,
            },
            "JETSTREAM" => SourceConfig::JetStream {
                url: vars.get("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
                stream: vars.require("JETSTREAM_STREAM", "JetStream stream name")?,
                consumer_group: vars
                    .get("JETSTREAM_CONSUMER_GROUP")
                    .unwrap_or_else(|| "persistor".to_string()),
            },
            other => {
                return Err(PersistorError::Config(format!(
                    "Invalid messaging source '{}' (must be SQS or JETSTREAM)",
                    other
                )))
            }
        };
        debug!("Messaging source: {:?}", source);

        let storage = match vars.get("PERSISTOR_STORAGE").unwrap_or_else(|| "S3".to_string()).to_uppercase().as_str() {
            "S3" => StorageConfig::S3,
            "FILESYSTEM" => StorageConfig::Filesystem {
                root: PathBuf::from(vars.require("PERSISTOR_FILESYSTEM_ROOT", "filesystem root")?),
            },
            other => {
                return Err(PersistorError::Config(format!(
                    "Invalid storage '{}' (must be S3 or FILESYSTEM)",
                    other
                )))
            }
        };

        let container = vars.require("PERSISTOR_CONTAINER_NAME", "container name")?;
        let store_param = vars.get("STORE_PARAM").unwrap_or_else(|| source.default_folder());

        let timed_append = vars.flag("TIMED_APPEND", false);
        // TIMED_APPEND on its own is enough to switch to append blobs.
        let append = vars.flag("APPEND", false) || timed_append;
        let write_mode = if timed_append {
            let minutes: u32 = vars.parse("TIMED_APPEND_BUCKET_MINUTES", 1)?;
            if minutes == 0 {
                return Err(PersistorError::Config(
                    "TIMED_APPEND_BUCKET_MINUTES must be at least 1".to_string(),
                ));
            }
            WriteMode::Append(AppendNaming::TimeBucket { minutes })
        } else if append {
            match vars.get("APPEND_BLOB_NAME") {
                Some(name) => WriteMode::Append(AppendNaming::Fixed(name)),
                None => WriteMode::Append(AppendNaming::PerInvocation),
            }
        } else {
            WriteMode::Block
        };

        let max_batch_size: usize = vars.parse("PULL_MAX_BATCH", 200)?;
        let worker_count: usize = vars.parse("WORKER_COUNT", 1)?;
        if worker_count == 0 {
            return Err(PersistorError::Config("WORKER_COUNT must be at least 1".to_string()));
        }

        let deadline = vars.seconds("INVOCATION_DEADLINE_SECONDS", 230.0)?;
        let safety_margin = vars.seconds("DEADLINE_SAFETY_MARGIN_SECONDS", 15.0)?;
        if safety_margin >= deadline {
            return Err(PersistorError::Config(
                "DEADLINE_SAFETY_MARGIN_SECONDS must be smaller than INVOCATION_DEADLINE_SECONDS".to_string(),
            ));
        }

        let max_append_bytes: usize = vars.parse("MAX_APPEND_BYTES", DEFAULT_MAX_APPEND_BYTES)?;
        if max_append_bytes == 0 {
            return Err(PersistorError::Config("MAX_APPEND_BYTES must be positive".to_string()));
        }

        let config = Self {
            source,
            storage,
            container,
            store_param,
            aws_endpoint_url: vars.get("AWS_ENDPOINT_URL"),
            write_mode,
            include_metadata: vars.flag("GET_METADATA", false),
            max_batch_size: max_batch_size.clamp(1, MAX_ALLOWED_BATCH_SIZE),
            pull_timeout: vars.seconds("PULL_TIMEOUT_SECONDS", 10.0)?,
            worker_count: worker_count.min(MAX_WORKERS),
            deadline,
            safety_margin,
            stop_when_idle: vars.flag("STOP_WHEN_IDLE", true),
            max_append_bytes,
            write_attempts: vars.parse::<u32>("WRITE_ATTEMPTS", 3)?.max(1),
            function_url: vars.get("FUNC_TO_INVOKE"),
            invoker_timeout: vars.seconds("INVOKER_TIMEOUT", 75.0)?,
            inter_call_delay: vars.seconds("DELAY_BETWEEN_FUNCS", 0.25)?,
            listen_addr: vars.get("PERSISTOR_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        };

        info!(
            "Configuration loaded: container={}, folder={}, mode={:?}, metadata={}, workers={}",
            config.container, config.store_param, config.write_mode, config.include_metadata, config.worker_count
        );
        Ok(config)
    }

    pub fn pull_settings(&self) -> PullSettings {
        PullSettings {
            max_batch_size: self.max_batch_size,
            timeout: self.pull_timeout,
        }
    }

    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            max_append_bytes: self.max_append_bytes,
            write_attempts: self.write_attempts,
            ..WriterSettings::default()
        }
    }

    pub fn invoker_settings(&self) -> InvokerSettings {
        InvokerSettings {
            call_timeout: self.invoker_timeout,
            inter_call_delay: self.inter_call_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn sqs(extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map = vars(&[
            ("PERSISTOR_SOURCE", "sqs"),
            ("SQS_QUEUE_URL", "https://sqs.eu-west-1.amazonaws.com/123456789012/orders"),
            ("PERSISTOR_CONTAINER_NAME", "archive"),
        ]);
        map.extend(vars(extra));
        map
    }

    #[test]
    fn defaults_for_sqs() {
        let config = PersistorConfig::from_map(&sqs(&[])).unwrap();

        assert_eq!(config.store_param, "orders");
        assert_eq!(config.storage, StorageConfig::S3);
        assert_eq!(config.write_mode, WriteMode::Block);
        assert!(!config.include_metadata);
        assert_eq!(config.max_batch_size, 200);
        assert_eq!(config.pull_timeout, Duration::from_secs(10));
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.invoker_timeout, Duration::from_secs(75));
        assert_eq!(config.inter_call_delay, Duration::from_millis(250));
        assert_eq!(config.max_append_bytes, DEFAULT_MAX_APPEND_BYTES);
        assert!(config.stop_when_idle);
        assert!(config.function_url.is_none());
    }

    #[test]
    fn jetstream_source_defaults_folder_to_stream() {
        let config = PersistorConfig::from_map(&vars(&[
            ("PERSISTOR_SOURCE", "JetStream"),
            ("JETSTREAM_STREAM", "telemetry"),
            ("PERSISTOR_CONTAINER_NAME", "archive"),
            ("PERSISTOR_STORAGE", "filesystem"),
            ("PERSISTOR_FILESYSTEM_ROOT", "/var/lib/persistor"),
        ]))
        .unwrap();

        assert_eq!(
            config.source,
            SourceConfig::JetStream {
                url: "nats://localhost:4222".to_string(),
                stream: "telemetry".to_string(),
                consumer_group: "persistor".to_string(),
            }
        );
        assert_eq!(config.store_param, "telemetry");
        assert_eq!(
            config.storage,
            StorageConfig::Filesystem {
                root: PathBuf::from("/var/lib/persistor")
            }
        );
    }

    #[yare::parameterized(
        block            = { &[],                                                   WriteMode::Block },
        append_uuid      = { &[("APPEND", "TRUE")],                                 WriteMode::Append(AppendNaming::PerInvocation) },
        append_fixed     = { &[("APPEND", "true"), ("APPEND_BLOB_NAME", "all")],    WriteMode::Append(AppendNaming::Fixed("all".into())) },
        timed_implies    = { &[("TIMED_APPEND", "True")],                           WriteMode::Append(AppendNaming::TimeBucket { minutes: 1 }) },
        timed_bucketed   = { &[("TIMED_APPEND", "true"), ("TIMED_APPEND_BUCKET_MINUTES", "15")], WriteMode::Append(AppendNaming::TimeBucket { minutes: 15 }) },
        not_true_is_off  = { &[("APPEND", "yes")],                                  WriteMode::Block },
    )]
    fn write_modes(extra: &[(&str, &str)], expected: WriteMode) {
        assert_eq!(PersistorConfig::from_map(&sqs(extra)).unwrap().write_mode, expected);
    }

    #[yare::parameterized(
        missing_source     = { &[("PERSISTOR_SOURCE", "")] },
        unknown_source     = { &[("PERSISTOR_SOURCE", "KAFKA")] },
        missing_queue      = { &[("SQS_QUEUE_URL", " ")] },
        missing_container  = { &[("PERSISTOR_CONTAINER_NAME", "")] },
        unknown_storage    = { &[("PERSISTOR_STORAGE", "FTP")] },
        fs_without_root    = { &[("PERSISTOR_STORAGE", "FILESYSTEM")] },
        bad_batch          = { &[("PULL_MAX_BATCH", "many")] },
        zero_workers       = { &[("WORKER_COUNT", "0")] },
        negative_delay     = { &[("DELAY_BETWEEN_FUNCS", "-1")] },
        huge_timeout       = { &[("INVOKER_TIMEOUT", "1e300")] },
        huge_deadline      = { &[("INVOCATION_DEADLINE_SECONDS", "1e19")] },
        deadline_over_day  = { &[("INVOCATION_DEADLINE_SECONDS", "86401")] },
        margin_too_large   = { &[("INVOCATION_DEADLINE_SECONDS", "10"), ("DEADLINE_SAFETY_MARGIN_SECONDS", "10")] },
        zero_bucket        = { &[("TIMED_APPEND", "true"), ("TIMED_APPEND_BUCKET_MINUTES", "0")] },
    )]
    fn invalid_configuration(extra: &[(&str, &str)]) {
        let result = PersistorConfig::from_map(&sqs(extra));
        assert!(matches!(result, Err(PersistorError::Config(_))), "{:?}", result);
    }

    #[test]
    fn batch_size_is_clamped() {
        let config = PersistorConfig::from_map(&sqs(&[("PULL_MAX_BATCH", "50000")])).unwrap();
        assert_eq!(config.max_batch_size, MAX_ALLOWED_BATCH_SIZE);
    }

    #[test]
    fn worker_count_is_clamped() {
        let config = PersistorConfig::from_map(&sqs(&[("WORKER_COUNT", "18446744073709551615")])).unwrap();
        assert_eq!(config.worker_count, MAX_WORKERS);
    }

    #[test]
    fn one_day_is_the_longest_duration() {
        let config = PersistorConfig::from_map(&sqs(&[("INVOCATION_DEADLINE_SECONDS", "86400")])).unwrap();
        assert_eq!(config.deadline, Duration::from_secs(86_400));
    }

    #[test]
    fn settings_follow_configuration() {
        let config = PersistorConfig::from_map(&sqs(&[
            ("PULL_MAX_BATCH", "32"),
            ("PULL_TIMEOUT_SECONDS", "2.5"),
            ("MAX_APPEND_BYTES", "1024"),
            ("WRITE_ATTEMPTS", "0"),
            ("INVOKER_TIMEOUT", "30"),
            ("FUNC_TO_INVOKE", "https://persistor.example.com/api/persist"),
        ]))
        .unwrap();

        let pull = config.pull_settings();
        assert_eq!(pull.max_batch_size, 32);
        assert_eq!(pull.timeout, Duration::from_millis(2500));

        let writer = config.writer_settings();
        assert_eq!(writer.max_append_bytes, 1024);
        assert_eq!(writer.write_attempts, 1);

        assert_eq!(config.invoker_settings().call_timeout, Duration::from_secs(30));
        assert_eq!(
            config.function_url.as_deref(),
            Some("https://persistor.example.com/api/persist")
        );
    }
}
