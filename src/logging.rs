//! Logging initialization and helpers.
//!
//! Structured logging via the `tracing` ecosystem: pretty console output by
//! default, JSON when the logs are collected by a machine.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(Default)]
pub struct LogConfig {
    /// Emit logs as JSON instead of pretty console lines.
    pub json: bool,
    /// Default the level to DEBUG instead of INFO.
    pub verbose: bool,
}

/// Initialize the tracing subscriber. Called once, early in main(), before
/// any component logs. `RUST_LOG` overrides the computed default level.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("luksbak={}", default_level.as_str().to_lowercase()))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_file(false))
            .init();
    }
}

/// Rate limiter for log lines produced by streaming subprocess output;
/// rsync repaints its progress many times per second.
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True when enough time has passed since the last accepted log. The
    /// first call always passes.
    pub fn should_log(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Allow the next log immediately.
    pub fn reset(&self) {
        *self.last.lock().unwrap() = None;
    }
}
