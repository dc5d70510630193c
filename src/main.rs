use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use statediff_proxy::{
    chart::{self, ChartRenderer, CommandChartRenderer},
    config::Config,
    logging::{self, LogSurface},
    summary::{self, SummaryReport},
};

const DEFAULT_PLOT_PATH: &str = "results/summary.png";

#[derive(Debug, Parser)]
#[command(name = "statediff-proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the measuring proxy.
    Serve {
        /// Optional path to config TOML. If omitted, ./statediff-proxy.toml or defaults are used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Override the backend base URL.
        #[arg(long)]
        backend: Option<String>,
        /// Override the run log directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Summarize run logs found under results*/.
    Summarize(SummarizeArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
struct SummarizeArgs {
    /// Optional path to config TOML.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Root directory to scan.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Rows dropped per file as the warm-up CRUD cycle.
    #[arg(long)]
    cycle_size: Option<usize>,
    /// Write the per-file and aggregated summaries as JSON.
    #[arg(long)]
    out_json: Option<PathBuf>,
    /// Chart output path, or `none` to skip plotting.
    #[arg(long, default_value = DEFAULT_PLOT_PATH)]
    plot: String,
    /// Disable log scale for the chart Y axis.
    #[arg(long)]
    no_log_scale: bool,
    /// Modes pooled into aggregates (repeatable). Defaults to the configured list.
    #[arg(long = "mode")]
    modes: Vec<String>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SummarizeOptions {
    root: PathBuf,
    cycle_size: usize,
    allowed_modes: Vec<String>,
    out_json: Option<PathBuf>,
    plot: Option<PathBuf>,
    log_scale: bool,
    chart_command: Option<Vec<String>>,
}

impl SummarizeOptions {
    fn resolve(config: &Config, args: SummarizeArgs) -> Self {
        let plot = if args.plot.eq_ignore_ascii_case("none") || args.plot.is_empty() {
            None
        } else {
            Some(PathBuf::from(args.plot))
        };
        let allowed_modes = if args.modes.is_empty() {
            config.summary.modes.clone()
        } else {
            args.modes
        };

        Self {
            root: args.root,
            cycle_size: args.cycle_size.unwrap_or(config.summary.cycle_size),
            allowed_modes,
            out_json: args.out_json,
            plot,
            log_scale: config.summary.log_scale && !args.no_log_scale,
            chart_command: config.summary.chart_command.clone(),
        }
    }
}

fn apply_serve_overrides(
    config: &mut Config,
    listen: Option<SocketAddr>,
    backend: Option<String>,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(listen) = listen {
        config.proxy.listen = listen;
    }
    if let Some(backend) = backend {
        config.proxy.backend = backend;
        config.backend_uri()?;
    }
    if let Some(log_dir) = log_dir {
        config.run_log.dir = log_dir;
    }
    Ok(())
}

fn run_summarize(options: &SummarizeOptions) -> anyhow::Result<Option<SummaryReport>> {
    let paths = summary::discover_runs(&options.root)?;
    if paths.is_empty() {
        println!("No CSV files found under {}", options.root.join(summary::RUN_GLOB).display());
        return Ok(None);
    }

    let report = SummaryReport::build(&paths, options.cycle_size, &options.allowed_modes);

    if let Some(out_json) = options.out_json.as_deref() {
        report.write_json(out_json)?;
        println!("Wrote JSON summary to {}", out_json.display());
    }

    print!("{}", report.render_text());

    let renderer = options
        .chart_command
        .as_deref()
        .and_then(CommandChartRenderer::from_command);
    chart::render_optional(
        renderer.as_ref().map(|renderer| renderer as &dyn ChartRenderer),
        &report.aggregated,
        &options.allowed_modes,
        options.plot.as_ref(),
        options.log_scale,
    );

    Ok(Some(report))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            backend,
            log_dir,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            apply_serve_overrides(&mut config, listen, backend, log_dir)?;
            logging::init(&config, LogSurface::Proxy, log_level.as_deref())?;
            let proxy = statediff_proxy::proxy::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, proxy.listen_addr));
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
        Command::Summarize(args) => {
            let config = Config::load(args.config.as_deref())?;
            logging::init(&config, LogSurface::Summarizer, args.log_level.as_deref())?;
            let options = SummarizeOptions::resolve(&config, args);
            run_summarize(&options)?;
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, proxy_listen_addr: SocketAddr) -> String {
    format!(
        "startup config: proxy_listen={}, backend={}, measure_command={}, run_log_dir={}, default_log={}, log_header={}, serialize={}, config={}",
        proxy_listen_addr,
        config.proxy.backend,
        config.measure.command.join(" "),
        config.run_log.dir.display(),
        config.run_log.default_file,
        config.run_log.header,
        config.proxy.serialize.as_str(),
        config
            .source_path()
            .map(Path::display)
            .map(|path| path.to_string())
            .unwrap_or_else(|| "defaults".to_owned()),
    )
}
