use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_PREFIX: &str = "sparkinsight-";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const LOG_RETENTION_DAYS: i64 = 30;

fn env_filter() -> EnvFilter {
    EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
}

/// Log to stderr so stdout stays free for command output.
pub fn init_console_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to install console logger: {e}"))
}

/// Log to hourly files under `log_dir`, dropping files older than the retention window.
pub fn init_logging(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    cleanup_old_logs(log_dir, Utc::now(), LOG_RETENTION_DAYS)?;

    let writer = HourlyLogWriter::new(log_dir.to_path_buf(), LOG_RETENTION_DAYS)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install file logger: {e}"))
}

#[derive(Debug)]
struct OpenLog {
    hour: String,
    file: File,
}

#[derive(Clone, Debug)]
struct HourlyLogWriter {
    log_dir: PathBuf,
    retention_days: i64,
    current: Arc<Mutex<OpenLog>>,
}

impl HourlyLogWriter {
    fn new(log_dir: PathBuf, retention_days: i64) -> Result<Self> {
        let hour = hour_key(Utc::now());
        let file = open_log_file(&log_dir, &hour)
            .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            retention_days,
            current: Arc::new(Mutex::new(OpenLog { hour, file })),
        })
    }

    fn write_now(&self, buf: &[u8]) -> io::Result<usize> {
        let now = Utc::now();
        let hour = hour_key(now);
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;

        if current.hour != hour {
            current.file.flush()?;
            current.file = open_log_file(&self.log_dir, &hour)?;
            current.hour = hour;
            let _ = cleanup_old_logs(&self.log_dir, now, self.retention_days);
        }

        current.file.write(buf)
    }

    fn flush_current(&self) -> io::Result<()> {
        self.current
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?
            .file
            .flush()
    }
}

impl<'a> MakeWriter<'a> for HourlyLogWriter {
    type Writer = HourlyLogHandle;

    fn make_writer(&'a self) -> Self::Writer {
        HourlyLogHandle(self.clone())
    }
}

struct HourlyLogHandle(HourlyLogWriter);

impl Write for HourlyLogHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_now(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush_current()
    }
}

fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn open_log_file(log_dir: &Path, hour: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{LOG_FILE_PREFIX}{hour}{LOG_FILE_SUFFIX}")))
}

fn parse_log_filename_time(file_name: &str) -> Option<DateTime<Utc>> {
    let body = file_name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let naive =
        NaiveDateTime::parse_from_str(&format!("{body}:00:00"), "%Y-%m-%d-%H:%M:%S").ok()?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

pub fn cleanup_old_logs(log_dir: &Path, now: DateTime<Utc>, retention_days: i64) -> Result<()> {
    let cutoff = now - Duration::days(retention_days);
    let entries = match fs::read_dir(log_dir) {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", log_dir.display())),
    };

    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(log_time) = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(parse_log_filename_time)
        else {
            continue;
        };
        if log_time < cutoff {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
