use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write as _,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use serde::Serialize;

use crate::config::RunLogConfig;

pub const RUN_LOG_COLUMNS: [&str; 6] = [
    "method",
    "path",
    "backend_status",
    "body_size",
    "statediff_size",
    "body",
];

/// One row of a run log. Field order is the on-disk column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeRecord {
    pub method: String,
    pub path: String,
    pub backend_status: u16,
    pub body_size: u64,
    pub statediff_size: u64,
    pub body: String,
}

impl ExchangeRecord {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        request_body: &[u8],
        backend_status: u16,
        statediff_size: u64,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            backend_status,
            body_size: request_body.len() as u64,
            statediff_size,
            body: String::from_utf8_lossy(request_body).into_owned(),
        }
    }
}

/// Read-side view of a logged row. Numeric columns that are missing or not
/// numeric are `None` so they can be left out of statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRow {
    pub method: String,
    pub path: String,
    pub backend_status: Option<u16>,
    /// Raw status text, used for frequency counts even when not numeric.
    pub backend_status_raw: String,
    pub body_size: Option<u64>,
    pub statediff_size: Option<u64>,
    pub body: String,
}

impl RunRow {
    pub fn into_record(self) -> Option<ExchangeRecord> {
        Some(ExchangeRecord {
            method: self.method,
            path: self.path,
            backend_status: self.backend_status?,
            body_size: self.body_size?,
            statediff_size: self.statediff_size?,
            body: self.body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogTargetError {
    reason: String,
}

impl RunLogTargetError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RunLogTargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for RunLogTargetError {}

/// Checks a caller-supplied log name: relative, non-empty, and made only of
/// plain path segments so it cannot escape the log directory.
pub fn validate_log_target(name: &str) -> Result<(), RunLogTargetError> {
    if name.trim().is_empty() {
        return Err(RunLogTargetError::new("log file name cannot be empty"));
    }
    if name != name.trim() {
        return Err(RunLogTargetError::new(
            "log file name cannot have leading or trailing whitespace",
        ));
    }
    if name.contains('\\') {
        return Err(RunLogTargetError::new(
            "log file name cannot contain backslashes",
        ));
    }
    let path = Path::new(name);
    if path.has_root() {
        return Err(RunLogTargetError::new("log file name must be relative"));
    }
    if !path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(RunLogTargetError::new(
            "log file name cannot contain `.` or `..` segments",
        ));
    }
    if name.ends_with('/') {
        return Err(RunLogTargetError::new("log file name cannot be a directory"));
    }

    Ok(())
}

#[derive(Debug)]
pub struct RunLogger {
    base_dir: PathBuf,
    default_file: String,
    /// One entry per log file ever written. Bounded by the number of
    /// distinct run names used during an experiment.
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RunLogger {
    pub fn new(base_dir: impl Into<PathBuf>, default_file: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            default_file: default_file.into(),
            file_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RunLogConfig) -> anyhow::Result<Self> {
        validate_log_target(&config.default_file)
            .with_context(|| format!("invalid `run_log.default_file` `{}`", config.default_file))?;
        Ok(Self::new(config.dir.clone(), config.default_file.clone()))
    }

    /// Resolves the requested log name, falling back to the default file
    /// when it is absent or unsafe.
    pub fn resolve_target(&self, requested: Option<&str>) -> PathBuf {
        let name = match requested {
            Some(name) => match validate_log_target(name) {
                Ok(()) => name,
                Err(err) => {
                    tracing::warn!(
                        requested = name,
                        default = %self.default_file,
                        "rejected run log name, using default: {err}"
                    );
                    self.default_file.as_str()
                }
            },
            None => self.default_file.as_str(),
        };
        self.base_dir.join(name)
    }

    pub async fn append(&self, path: PathBuf, record: ExchangeRecord) -> anyhow::Result<()> {
        let file_lock = self.file_lock(&path);
        tokio::task::spawn_blocking(move || {
            let _guard = file_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            append_record_blocking(&path, &record)
        })
        .await
        .context("join run log append task")?
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .file_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }
}

/// Caller must hold the per-file lock.
fn append_record_blocking(path: &Path, record: &ExchangeRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create run log dir {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open run log {}", path.display()))?;
    let needs_header = file
        .metadata()
        .with_context(|| format!("stat run log {}", path.display()))?
        .len()
        == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(Vec::new());
    writer.serialize(record).context("encode run log row")?;
    let buffer = writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flush run log row: {}", err.error()))?;

    file.write_all(&buffer)
        .with_context(|| format!("append run log {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync run log {}", path.display()))?;
    Ok(())
}

/// Parses a run log by header name. Column order does not matter and
/// missing columns read as empty. Invalid UTF-8 is decoded lossily and rows
/// the CSV reader cannot parse are skipped, so one bad row never hides the
/// rest of the run.
pub fn load_run(path: &Path) -> anyhow::Result<Vec<RunRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open run log {}", path.display()))?;
    let headers: Vec<String> = reader
        .byte_headers()
        .with_context(|| format!("read run log header {}", path.display()))?
        .iter()
        .map(|header| String::from_utf8_lossy(header).trim().to_owned())
        .collect();
    let column = |name: &str| headers.iter().position(|header| header == name);
    let method_idx = column("method");
    let path_idx = column("path");
    let status_idx = column("backend_status");
    let body_size_idx = column("body_size");
    let statediff_idx = column("statediff_size");
    let body_idx = column("body");

    let mut rows = Vec::new();
    for (line, record) in reader.byte_records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => {
                return Err(err)
                    .with_context(|| format!("read run log {}", path.display()));
            }
            Err(err) => {
                tracing::warn!(
                    file = %path.display(),
                    row = line + 1,
                    "skipping unparseable run log row: {err}"
                );
                continue;
            }
        };
        let field = |idx: Option<usize>| {
            idx.and_then(|idx| record.get(idx))
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
        };
        let status_raw = field(status_idx);
        rows.push(RunRow {
            method: field(method_idx).into_owned(),
            path: field(path_idx).into_owned(),
            backend_status: parse_integer(&status_raw),
            backend_status_raw: status_raw.into_owned(),
            body_size: parse_integer(&field(body_size_idx)),
            statediff_size: parse_integer(&field(statediff_idx)),
            body: field(body_idx).into_owned(),
        });
    }
    Ok(rows)
}

fn parse_integer<T: std::str::FromStr>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}
