use facelog_core::{ReconcilerConfig, Thresholds};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub redis_url: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Work queue (Redis list) name.
    pub queue: String,
    /// Names this worker's processing list; must be unique per live worker.
    pub worker_id: String,
    /// RediSearch vector index name.
    pub index: String,
    pub reconciler: ReconcilerConfig,
    pub metrics_interval: Duration,
}

impl Config {
    /// Load configuration from `FACELOG_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facelog");

        let defaults = ReconcilerConfig::default();
        let secs = |key: &str, default: Duration| Duration::from_secs(env_u64(&lookup, key, default.as_secs()));
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(env_u64(&lookup, key, default.as_millis() as u64))
        };

        let reconciler = ReconcilerConfig {
            thresholds: Thresholds {
                accept: env_f32(&lookup, "FACELOG_MATCH_THRESHOLD", defaults.thresholds.accept),
                margin: env_f32(&lookup, "FACELOG_HYSTERESIS_MARGIN", defaults.thresholds.margin),
            },
            top_k: env_usize(&lookup, "FACELOG_TOP_K", defaults.top_k),
            dedup_ttl: secs("FACELOG_DEDUP_TTL_SECS", defaults.dedup_ttl),
            camera_lock_ttl: secs("FACELOG_CAMERA_LOCK_TTL_SECS", defaults.camera_lock_ttl),
            employee_cooldown: secs("FACELOG_EMPLOYEE_COOLDOWN_SECS", defaults.employee_cooldown),
            guess_cooldown: secs("FACELOG_GUESS_COOLDOWN_SECS", defaults.guess_cooldown),
            hold_window: millis("FACELOG_HOLD_WINDOW_MS", defaults.hold_window),
            hold_poll: millis("FACELOG_HOLD_POLL_MS", defaults.hold_poll),
            confirm_ttl: secs("FACELOG_CONFIRM_TTL_SECS", defaults.confirm_ttl),
        };

        Self {
            redis_url: lookup("FACELOG_REDIS_URL")
                .unwrap_or_else(|| facelog_store::DEFAULT_REDIS_URL.to_string()),
            db_path: lookup("FACELOG_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("facelog.db")),
            model_dir: lookup("FACELOG_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(facelog_vision::default_model_dir),
            queue: lookup("FACELOG_QUEUE").unwrap_or_else(|| facelog_store::DEFAULT_QUEUE.to_string()),
            worker_id: lookup("FACELOG_WORKER_ID")
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            index: lookup("FACELOG_INDEX")
                .unwrap_or_else(|| facelog_store::DEFAULT_INDEX_NAME.to_string()),
            reconciler: validated(reconciler),
            metrics_interval: Duration::from_secs(
                env_u64(&lookup, "FACELOG_METRICS_INTERVAL_SECS", 60).max(1),
            ),
        }
    }
}

/// Replace inconsistent settings with defaults, logging what was rejected.
fn validated(mut config: ReconcilerConfig) -> ReconcilerConfig {
    let defaults = ReconcilerConfig::default();
    let Thresholds { accept, margin } = config.thresholds;

    if !(margin > 0.0 && margin < accept && accept <= 1.0) {
        tracing::warn!(accept, margin, "thresholds must satisfy 0 < margin < accept <= 1; using defaults");
        config.thresholds = defaults.thresholds;
    }
    if config.hold_poll.is_zero() || config.hold_window < config.hold_poll {
        tracing::warn!(
            hold_window_ms = config.hold_window.as_millis() as u64,
            hold_poll_ms = config.hold_poll.as_millis() as u64,
            "hold window must cover at least one non-zero poll interval; using defaults"
        );
        config.hold_window = defaults.hold_window;
        config.hold_poll = defaults.hold_poll;
    }
    if config.top_k == 0 {
        tracing::warn!("FACELOG_TOP_K must be positive; using default");
        config.top_k = defaults.top_k;
    }
    config
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
