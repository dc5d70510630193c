use serde::Serialize;

const P95: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub count: usize,
    pub min: u64,
    pub median: f64,
    pub p95: f64,
    pub max: u64,
    pub mean: f64,
}

/// Summary of a sample set. An empty set is `NoData`, never zeroes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Distribution {
    NoData,
    Observed(Stats),
}

impl Distribution {
    pub fn observed(&self) -> Option<&Stats> {
        match self {
            Self::NoData => None,
            Self::Observed(stats) => Some(stats),
        }
    }

    /// Formats `pick(stats)` for console output, `n/a` without data.
    pub fn display_with(&self, pick: impl Fn(&Stats) -> String) -> String {
        self.observed()
            .map(pick)
            .unwrap_or_else(|| "n/a".to_owned())
    }
}

pub fn stats(values: &[u64]) -> Distribution {
    if values.is_empty() {
        return Distribution::NoData;
    }

    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let count = sorted.len();
    let sum: f64 = sorted.iter().map(|value| *value as f64).sum();

    Distribution::Observed(Stats {
        count,
        min: sorted[0],
        median: median(&sorted),
        p95: percentile(&sorted, P95),
        max: sorted[count - 1],
        mean: sum / count as f64,
    })
}

fn median(sorted: &[u64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    }
}

/// Linear interpolation between the order statistics around
/// `k = (n - 1) * pct`.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    let k = (sorted.len() - 1) as f64 * pct;
    let lower = k.floor() as usize;
    let upper = k.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let frac = k - lower as f64;
    let low = sorted[lower] as f64;
    low + (sorted[upper] as f64 - low) * frac
}
