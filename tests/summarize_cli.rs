use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use tempfile::tempdir;

const HEADER: &str = "method,path,backend_status,body_size,statediff_size,body\n";

fn write_run(root: &Path, dir: &str, file: &str, statediff_sizes: &[u64]) {
    let dir = root.join(dir);
    fs::create_dir_all(&dir).expect("results dir should be created");
    let mut contents = String::from(HEADER);
    for size in statediff_sizes {
        contents.push_str(&format!("PUT,/books/1,200,2,{size},{{}}\n"));
    }
    fs::write(dir.join(file), contents).expect("run log should be written");
}

fn run_statediff_proxy<I, S>(args: I, cwd: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_statediff-proxy"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("statediff-proxy command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn summarize_uses_project_config_and_writes_json() {
    let project = tempdir().expect("tempdir should be created");
    fs::write(
        project.path().join("statediff-proxy.toml"),
        "[summary]\ncycle_size = 2\nmodes = [\"plus_prune\"]\n",
    )
    .expect("config should be written");
    write_run(
        project.path(),
        "results_plus_prune",
        "bookcatalog_results_redis_run1.csv",
        &[100, 200, 10, 30],
    );
    write_run(
        project.path(),
        "results_baseline",
        "bookcatalog_results_redis_run1.csv",
        &[100, 200, 7],
    );

    let output = run_statediff_proxy(
        ["summarize", "--out-json", "summary.json", "--plot", "none"],
        project.path(),
    );
    assert_success(&output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Per-file summaries (after drop):"), "{stdout}");
    assert!(
        stdout.contains("mode=plus_prune, backend=redis, rows_after_drop=2, statediff_median=20"),
        "{stdout}"
    );
    assert!(
        stdout.contains("mode=plus_prune, backend=redis, samples=2, median=20, p95=29, max=30"),
        "{stdout}"
    );
    assert!(!stdout.contains("mode=baseline, backend=redis, samples="), "{stdout}");

    let json: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(project.path().join("summary.json")).expect("json should exist"),
    )
    .expect("json should parse");
    assert_eq!(json["aggregated"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["files"].as_array().map(Vec::len), Some(2));
}

#[test]
fn summarize_without_run_logs_reports_and_succeeds() {
    let project = tempdir().expect("tempdir should be created");
    let output = run_statediff_proxy(["summarize", "--plot", "none"], project.path());
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No CSV files found under"), "{stdout}");
}

#[test]
fn invalid_project_config_fails_with_context() {
    let project = tempdir().expect("tempdir should be created");
    fs::write(
        project.path().join("statediff-proxy.toml"),
        "[summary]\nunknown_knob = true\n",
    )
    .expect("config should be written");

    let output = run_statediff_proxy(["summarize"], project.path());
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("statediff-proxy.toml"), "{stderr}");
}
