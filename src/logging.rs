use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const RETENTION_DAYS: u64 = 30;
const LOG_FILE_PREFIX: &str = "codestream";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Dependencies that are only interesting when something goes wrong.
const QUIET_TARGETS: &[&str] = &["axum", "tower_http", "hyper", "hyper_util", "reqwest", "mio"];

pub struct LoggingSettings<'a> {
    pub level: Option<&'a str>,
    pub directory: Option<&'a str>,
    pub retention_days: Option<u64>,
    /// Keep stdout free for event frames.
    pub suppress_stdout: bool,
}

/// Install the global subscriber: a daily file log, plus stdout unless
/// suppressed. A configured level wins over `RUST_LOG`. Returns the log
/// directory, or `None` when it could not be created.
pub fn setup_tracing_with_settings(settings: LoggingSettings<'_>) -> Option<PathBuf> {
    let log_dir = resolve_log_dir(settings.directory).ok()?;
    let retention = DAY * settings.retention_days.unwrap_or(RETENTION_DAYS) as u32;
    let _ = cleanup_old_logs(&log_dir, retention);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));
    let _ = LOG_GUARD.set(guard);

    let filter = match settings.level {
        Some(level) => EnvFilter::new(default_directives(level)),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives("info"))),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with((!settings.suppress_stdout).then(|| compact_layer(std::io::stdout, true)))
        .with(compact_layer(file_writer, false))
        .try_init();

    Some(log_dir)
}

fn compact_layer<S, W>(writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .boxed()
}

fn default_directives(level: &str) -> String {
    std::iter::once(format!("codestream={level}"))
        .chain(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

fn resolve_log_dir(configured: Option<&str>) -> Result<PathBuf> {
    let dir = configured
        .map(expand_tilde)
        .unwrap_or_else(crate::paths::logs_dir);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Delete our own rolled files older than `retention`. Returns how many were
/// removed.
fn cleanup_old_logs(log_dir: &Path, retention: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let removed = std::fs::read_dir(log_dir)?
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| {
            let Ok(meta) = entry.metadata() else {
                return false;
            };
            let age = meta.modified().ok().and_then(|m| now.duration_since(m).ok());
            meta.is_file() && age.is_some_and(|age| age > retention)
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count();
    Ok(removed)
}
