use std::{
    io::Write as _,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::Context as _;
use serde::Serialize;

use crate::summary::{AggregateBucket, mode_display_order};

const CHART_METRICS: [&str; 2] = ["median", "p95"];

/// Payload written to the renderer's stdin.
#[derive(Debug, Serialize)]
pub struct ChartRequest<'a> {
    pub output: &'a Path,
    pub log_scale: bool,
    pub metrics: &'a [&'a str],
    pub modes: Vec<String>,
    pub backends: Vec<String>,
    pub buckets: &'a [AggregateBucket],
}

impl<'a> ChartRequest<'a> {
    pub fn new(
        buckets: &'a [AggregateBucket],
        preferred_modes: &[String],
        output: &'a Path,
        log_scale: bool,
    ) -> Self {
        let mut backends: Vec<String> = buckets.iter().map(|bucket| bucket.backend.clone()).collect();
        backends.sort();
        backends.dedup();
        Self {
            output,
            log_scale,
            metrics: &CHART_METRICS,
            modes: mode_display_order(buckets, preferred_modes),
            backends,
            buckets,
        }
    }
}

pub trait ChartRenderer {
    fn render(&self, request: &ChartRequest<'_>) -> anyhow::Result<()>;
}

/// Hands the chart request to an external program as JSON on stdin.
#[derive(Debug, Clone)]
pub struct CommandChartRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandChartRenderer {
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ChartRenderer for CommandChartRenderer {
    fn render(&self, request: &ChartRequest<'_>) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(request).context("encode chart request")?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn chart renderer `{}`", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .context("write chart request to renderer")?;
        }

        let output = child
            .wait_with_output()
            .context("wait for chart renderer")?;
        if !output.status.success() {
            anyhow::bail!(
                "chart renderer exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Renders when a renderer and output are available. Failures are logged and
/// never affect the computed statistics.
pub fn render_optional(
    renderer: Option<&dyn ChartRenderer>,
    buckets: &[AggregateBucket],
    preferred_modes: &[String],
    output: Option<&PathBuf>,
    log_scale: bool,
) -> bool {
    let Some(output) = output else {
        return false;
    };
    let Some(renderer) = renderer else {
        tracing::info!("no chart renderer configured; skipping plot generation");
        return false;
    };
    if buckets.is_empty() {
        tracing::info!("no aggregated data to plot");
        return false;
    }

    let request = ChartRequest::new(buckets, preferred_modes, output, log_scale);
    match renderer.render(&request) {
        Ok(()) => {
            tracing::info!(output = %output.display(), "wrote plot");
            true
        }
        Err(err) => {
            tracing::warn!(output = %output.display(), "chart rendering failed: {err:#}");
            false
        }
    }
}
