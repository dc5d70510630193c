//! Offline aggregation of run logs.
//!
//! Run logs live under `results*/` directories. The directory name encodes
//! the optimization mode and the file name encodes the backend under test:
//!
//! ```text
//! results/bookcatalog_results_sqlite_run1.csv            -> (baseline, sqlite)
//! results_plus_prune/bookcatalog_results_redis_run3.csv  -> (plus_prune, redis)
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Serialize, Serializer};

use crate::{
    run_log::{RunRow, load_run},
    stats::{Distribution, stats},
};

pub const RUN_GLOB: &str = "results*/*.csv";
const MODE_DIR_PREFIX: &str = "results_";
const BASELINE_DIR: &str = "results";
const BACKEND_FILE_PREFIX: &str = "bookcatalog_results_";
const BACKEND_SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mode {
    Baseline,
    Tagged(String),
    /// Directory name did not follow the `results_<mode>` convention.
    Unparsed(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Baseline => "baseline",
            Self::Tagged(name) | Self::Unparsed(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backend {
    Named(String),
    Unknown,
}

impl Backend {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::Unknown => "unknown",
        }
    }
}

macro_rules! serialize_as_str {
    ($($ty:ty),*) => {$(
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    )*};
}

serialize_as_str!(Mode, Backend);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLabel {
    pub mode: Mode,
    pub backend: Backend,
}

impl RunLabel {
    pub fn used_fallback(&self) -> bool {
        matches!(self.mode, Mode::Unparsed(_)) || self.backend == Backend::Unknown
    }

    fn key(&self) -> (String, String) {
        (self.mode.as_str().to_owned(), self.backend.as_str().to_owned())
    }
}

pub fn classify(path: &Path) -> RunLabel {
    RunLabel {
        mode: parse_mode(path),
        backend: parse_backend(path),
    }
}

fn parse_mode(path: &Path) -> Mode {
    let dir_name = path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if let Some(mode) = dir_name.strip_prefix(MODE_DIR_PREFIX)
        && !mode.is_empty()
    {
        return Mode::Tagged(mode.to_owned());
    }
    if dir_name == BASELINE_DIR {
        return Mode::Baseline;
    }
    Mode::Unparsed(dir_name)
}

fn parse_backend(path: &Path) -> Backend {
    let Some(stem) = path.file_stem().map(|stem| stem.to_string_lossy()) else {
        return Backend::Unknown;
    };
    let Some(remainder) = stem.strip_prefix(BACKEND_FILE_PREFIX) else {
        return Backend::Unknown;
    };
    match remainder.split(BACKEND_SEPARATOR).next() {
        Some(backend) if !backend.is_empty() => Backend::Named(backend.to_owned()),
        _ => Backend::Unknown,
    }
}

/// Drops one warm-up cycle. Runs no longer than the cycle yield nothing.
pub fn drop_warmup<T>(rows: &[T], cycle_size: usize) -> &[T] {
    if rows.len() <= cycle_size {
        return &[];
    }
    &rows[cycle_size..]
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file: PathBuf,
    pub mode: Mode,
    pub backend: Backend,
    pub label_fallback: bool,
    pub cycle_size: usize,
    pub rows_total: usize,
    pub rows_after_drop: usize,
    pub statediff_stats: Distribution,
    pub body_stats: Distribution,
    pub methods: BTreeMap<String, usize>,
    pub statuses: BTreeMap<String, usize>,
    #[serde(skip)]
    statediff_samples: Vec<u64>,
}

impl FileSummary {
    pub fn label(&self) -> RunLabel {
        RunLabel {
            mode: self.mode.clone(),
            backend: self.backend.clone(),
        }
    }

    /// State-diff sizes kept after the warm-up drop.
    pub fn statediff_samples(&self) -> &[u64] {
        &self.statediff_samples
    }
}

pub fn summarize_file(path: &Path, cycle_size: usize) -> anyhow::Result<FileSummary> {
    let rows = load_run(path)?;
    Ok(summarize_rows(path, &rows, cycle_size))
}

fn summarize_rows(path: &Path, rows: &[RunRow], cycle_size: usize) -> FileSummary {
    let label = classify(path);
    if label.used_fallback() {
        tracing::warn!(
            file = %path.display(),
            mode = label.mode.as_str(),
            backend = label.backend.as_str(),
            "run log name does not follow the results naming convention"
        );
    }

    let trimmed = drop_warmup(rows, cycle_size);
    let statediff_samples: Vec<u64> = trimmed.iter().filter_map(|row| row.statediff_size).collect();
    let body_samples: Vec<u64> = trimmed.iter().filter_map(|row| row.body_size).collect();

    let mut methods = BTreeMap::new();
    let mut statuses = BTreeMap::new();
    for row in trimmed {
        *methods.entry(row.method.clone()).or_insert(0) += 1;
        *statuses.entry(row.backend_status_raw.clone()).or_insert(0) += 1;
    }

    FileSummary {
        file: path.to_path_buf(),
        label_fallback: label.used_fallback(),
        mode: label.mode,
        backend: label.backend,
        cycle_size,
        rows_total: rows.len(),
        rows_after_drop: trimmed.len(),
        statediff_stats: stats(&statediff_samples),
        body_stats: stats(&body_samples),
        methods,
        statuses,
        statediff_samples,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateBucket {
    pub mode: String,
    pub backend: String,
    pub sample_count: usize,
    pub statediff_stats: Distribution,
}

/// Pools post-warm-up state-diff samples per `(mode, backend)`. Files whose
/// mode is not in `allowed_modes` are left out of the pool.
pub fn aggregate(summaries: &[FileSummary], allowed_modes: &[String]) -> Vec<AggregateBucket> {
    let mut buckets: BTreeMap<(String, String), Vec<u64>> = BTreeMap::new();
    for summary in summaries {
        let mode = summary.mode.as_str();
        if !allowed_modes.iter().any(|allowed| allowed == mode) {
            tracing::debug!(
                file = %summary.file.display(),
                mode,
                "mode not recognized, excluded from aggregation"
            );
            continue;
        }
        buckets
            .entry(summary.label().key())
            .or_default()
            .extend_from_slice(summary.statediff_samples());
    }

    buckets
        .into_iter()
        .map(|((mode, backend), values)| AggregateBucket {
            mode,
            backend,
            sample_count: values.len(),
            statediff_stats: stats(&values),
        })
        .collect()
}

/// Finds `results*/*.csv` under `root`, sorted by path. The root itself is
/// matched literally.
pub fn discover_runs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    let pattern = Path::new(&escaped_root).join(RUN_GLOB);
    let pattern = pattern.to_string_lossy();
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern).with_context(|| format!("invalid run glob `{pattern}`"))? {
        match entry {
            Ok(path) if path.is_file() => paths.push(path),
            Ok(_) => {}
            Err(err) => tracing::warn!("skipping unreadable run log path: {err}"),
        }
    }
    paths.sort();
    Ok(paths)
}

/// Modes in presentation order: the configured order first, then any other
/// mode alphabetically.
pub fn mode_display_order(buckets: &[AggregateBucket], preferred: &[String]) -> Vec<String> {
    let found: std::collections::BTreeSet<&str> =
        buckets.iter().map(|bucket| bucket.mode.as_str()).collect();
    let mut ordered: Vec<String> = preferred
        .iter()
        .filter(|mode| found.contains(mode.as_str()))
        .cloned()
        .collect();
    ordered.extend(
        found
            .iter()
            .filter(|mode| !preferred.iter().any(|preferred| preferred == *mode))
            .map(|mode| (*mode).to_owned()),
    );
    ordered
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub aggregated: Vec<AggregateBucket>,
    pub files: Vec<FileSummary>,
}

impl SummaryReport {
    pub fn build(paths: &[PathBuf], cycle_size: usize, allowed_modes: &[String]) -> Self {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            match summarize_file(path, cycle_size) {
                Ok(summary) => files.push(summary),
                Err(err) => tracing::error!(file = %path.display(), "failed to summarize run log: {err:#}"),
            }
        }
        let aggregated = aggregate(&files, allowed_modes);
        Self { aggregated, files }
    }

    pub fn write_json(&self, out_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = out_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create summary dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("encode summary JSON")?;
        fs::write(out_path, json)
            .with_context(|| format!("write summary {}", out_path.display()))?;
        Ok(())
    }

    pub fn render_text(&self) -> String {
        let mut out = String::from("Per-file summaries (after drop):\n");
        for summary in &self.files {
            out.push_str(&format!(
                "- {}: mode={}, backend={}, rows_after_drop={}, statediff_median={}, p95={}, max={}\n",
                summary.file.display(),
                summary.mode.as_str(),
                summary.backend.as_str(),
                summary.rows_after_drop,
                summary.statediff_stats.display_with(|s| s.median.to_string()),
                summary.statediff_stats.display_with(|s| s.p95.to_string()),
                summary.statediff_stats.display_with(|s| s.max.to_string()),
            ));
        }

        out.push_str("\nAggregated by mode/backend:\n");
        for bucket in &self.aggregated {
            out.push_str(&format!(
                "- mode={}, backend={}, samples={}, median={}, p95={}, max={}\n",
                bucket.mode,
                bucket.backend,
                bucket.sample_count,
                bucket.statediff_stats.display_with(|s| s.median.to_string()),
                bucket.statediff_stats.display_with(|s| s.p95.to_string()),
                bucket.statediff_stats.display_with(|s| s.max.to_string()),
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use tempfile::tempdir;

    use super::{
        Backend, Mode, SummaryReport, aggregate, classify, discover_runs, drop_warmup,
        mode_display_order, summarize_file,
    };
    use crate::stats::Distribution;

    const HEADER: &str = "method,path,backend_status,body_size,statediff_size,body\n";

    fn write_run(root: &Path, dir: &str, file: &str, statediff_sizes: &[&str]) {
        let dir = root.join(dir);
        fs::create_dir_all(&dir).unwrap();
        let mut contents = String::from(HEADER);
        for (idx, size) in statediff_sizes.iter().enumerate() {
            let method = ["POST", "GET", "PUT", "DELETE"][idx % 4];
            contents.push_str(&format!("{method},/books/1,200,12,{size},{{}}\n"));
        }
        fs::write(dir.join(file), contents).unwrap();
    }

    fn allowed() -> Vec<String> {
        crate::config::DEFAULT_MODES
            .iter()
            .map(|mode| (*mode).to_owned())
            .collect()
    }

    #[test]
    fn classify_reads_mode_from_dir_and_backend_from_file() {
        let label = classify(Path::new(
            "results_plus_compression/bookcatalog_results_redis_run1.csv",
        ));
        assert_eq!(label.mode, Mode::Tagged("plus_compression".to_owned()));
        assert_eq!(label.backend, Backend::Named("redis".to_owned()));
        assert!(!label.used_fallback());
    }

    #[test]
    fn classify_maps_bare_results_dir_to_baseline() {
        let label = classify(Path::new("results/bookcatalog_results_sqlite.csv"));
        assert_eq!(label.mode, Mode::Baseline);
        assert_eq!(label.backend, Backend::Named("sqlite".to_owned()));
    }

    #[test]
    fn classify_falls_back_to_sentinel_labels() {
        let label = classify(Path::new("archive_2024/run1.csv"));
        assert_eq!(label.mode, Mode::Unparsed("archive_2024".to_owned()));
        assert_eq!(label.mode.as_str(), "archive_2024");
        assert_eq!(label.backend, Backend::Unknown);
        assert_eq!(label.backend.as_str(), "unknown");
        assert!(label.used_fallback());
    }

    #[test]
    fn drop_warmup_discards_whole_cycle_only() {
        let four = [1, 2, 3, 4];
        let five = [1, 2, 3, 4, 5];
        assert!(drop_warmup(&four, 4).is_empty());
        assert_eq!(drop_warmup(&five, 4), &[5]);
        assert_eq!(drop_warmup(&five, 0), &five);
        assert!(drop_warmup(&[1, 2], 4).is_empty());
    }

    #[test]
    fn summarize_file_skips_warmup_and_malformed_values() {
        let root = tempdir().unwrap();
        write_run(
            root.path(),
            "results_plus_prune",
            "bookcatalog_results_redis_run1.csv",
            &["900", "900", "900", "900", "10", "", "oops", "30"],
        );

        let summary = summarize_file(
            &root
                .path()
                .join("results_plus_prune/bookcatalog_results_redis_run1.csv"),
            4,
        )
        .unwrap();

        assert_eq!(summary.rows_total, 8);
        assert_eq!(summary.rows_after_drop, 4);
        assert_eq!(summary.statediff_samples(), &[10, 30]);
        let stats = summary.statediff_stats.observed().expect("samples expected");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max, 30);
        assert_eq!(summary.methods.get("POST"), Some(&1));
        assert_eq!(summary.statuses.get("200"), Some(&4));
        let body = summary.body_stats.observed().expect("body sizes expected");
        assert_eq!(body.count, 4);
    }

    #[test]
    fn short_run_has_no_data_after_warmup() {
        let root = tempdir().unwrap();
        write_run(root.path(), "results", "bookcatalog_results_sqlite.csv", &["1", "2", "3", "4"]);

        let summary =
            summarize_file(&root.path().join("results/bookcatalog_results_sqlite.csv"), 4).unwrap();
        assert_eq!(summary.rows_after_drop, 0);
        assert_eq!(summary.statediff_stats, Distribution::NoData);
    }

    #[test]
    fn aggregate_pools_runs_and_excludes_unrecognized_modes() {
        let root = tempdir().unwrap();
        write_run(
            root.path(),
            "results_plus_prune",
            "bookcatalog_results_redis_run1.csv",
            &["0", "0", "0", "0", "10", "20"],
        );
        write_run(
            root.path(),
            "results_plus_prune",
            "bookcatalog_results_redis_run2.csv",
            &["0", "0", "0", "0", "30"],
        );
        write_run(
            root.path(),
            "results_experimental",
            "bookcatalog_results_redis_run1.csv",
            &["0", "0", "0", "0", "99"],
        );

        let paths = discover_runs(root.path()).unwrap();
        assert_eq!(paths.len(), 3);
        let report = SummaryReport::build(&paths, 4, &allowed());

        assert_eq!(report.files.len(), 3);
        assert_eq!(report.aggregated.len(), 1);
        let bucket = &report.aggregated[0];
        assert_eq!(bucket.mode, "plus_prune");
        assert_eq!(bucket.backend, "redis");
        assert_eq!(bucket.sample_count, 3);
        let stats = bucket.statediff_stats.observed().unwrap();
        assert_eq!(stats.median, 20.0);

        let with_experimental = aggregate(
            &report.files,
            &["experimental".to_owned(), "plus_prune".to_owned()],
        );
        assert_eq!(with_experimental.len(), 2);
        assert_eq!(with_experimental[0].mode, "experimental");
    }

    #[test]
    fn discover_runs_ignores_other_directories() {
        let root = tempdir().unwrap();
        write_run(root.path(), "results", "bookcatalog_results_a.csv", &["1"]);
        write_run(root.path(), "other", "bookcatalog_results_b.csv", &["1"]);
        fs::create_dir_all(root.path().join("results_x").join("nested.csv")).unwrap();
        fs::write(root.path().join("results").join("notes.txt"), "x").unwrap();

        let paths = discover_runs(root.path()).unwrap();
        assert_eq!(paths, vec![root.path().join("results/bookcatalog_results_a.csv")]);
    }

    #[test]
    fn invalid_utf8_row_keeps_the_rest_of_the_run() {
        let root = tempdir().unwrap();
        let dir = root.path().join("results_plus_prune");
        fs::create_dir_all(&dir).unwrap();
        let mut contents = HEADER.as_bytes().to_vec();
        for size in [1, 2, 3, 4, 10, 30] {
            contents.extend_from_slice(format!("PUT,/books/1,200,2,{size},{{}}\n").as_bytes());
        }
        contents.extend_from_slice(b"PUT,/books/1,200,2,50,\xff\xfe\n");
        let path = dir.join("bookcatalog_results_redis_run1.csv");
        fs::write(&path, contents).unwrap();

        let report = SummaryReport::build(&[path], 4, &["plus_prune".to_owned()]);
        assert_eq!(report.files.len(), 1);
        assert_eq!(report.files[0].rows_after_drop, 3);
        assert_eq!(report.aggregated.len(), 1);
        assert_eq!(report.aggregated[0].sample_count, 3);
    }

    #[test]
    fn discover_runs_treats_root_literally() {
        let sandbox = tempdir().unwrap();
        let root = sandbox.path().join("exp[1]*?");
        write_run(&root, "results", "bookcatalog_results_redis.csv", &["1"]);
        write_run(&sandbox.path().join("exp1ab"), "results", "decoy.csv", &["1"]);

        let paths = discover_runs(&root).unwrap();
        assert_eq!(paths, vec![root.join("results/bookcatalog_results_redis.csv")]);
    }

    #[test]
    fn mode_display_order_prefers_configured_order() {
        let root = tempdir().unwrap();
        for dir in ["results_zeta", "results_plus_prune", "results", "results_alpha"] {
            write_run(root.path(), dir, "bookcatalog_results_redis.csv", &["1", "2"]);
        }
        let paths = discover_runs(root.path()).unwrap();
        let report = SummaryReport::build(&paths, 1, &[
            "baseline".to_owned(),
            "plus_prune".to_owned(),
            "alpha".to_owned(),
            "zeta".to_owned(),
        ]);

        let order = mode_display_order(&report.aggregated, &allowed());
        assert_eq!(order, ["baseline", "plus_prune", "alpha", "zeta"]);
    }

    #[test]
    fn report_exports_json_and_text() {
        let root = tempdir().unwrap();
        write_run(
            root.path(),
            "results_plus_compression",
            "bookcatalog_results_postgres_run1.csv",
            &["5", "5", "5", "5", "7"],
        );
        let paths = discover_runs(root.path()).unwrap();
        let report = SummaryReport::build(&paths, 4, &allowed());

        let out = root.path().join("out").join("summary.json");
        report.write_json(&out).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(json["aggregated"][0]["mode"], "plus_compression");
        assert_eq!(json["aggregated"][0]["statediff_stats"]["max"], 7);
        assert_eq!(json["files"][0]["backend"], "postgres");
        assert_eq!(json["files"][0]["rows_after_drop"], 1);
        assert!(json["files"][0].get("statediff_samples").is_none());

        let text = report.render_text();
        assert!(text.contains("mode=plus_compression, backend=postgres, samples=1"));
    }
}
