use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use load_logger_rs::session_log::{flush_to_dir, read_rows, HEADER};
use load_logger_rs::store::DEFAULT_CAPACITY;
use load_logger_rs::weights::SharedWeights;
use load_logger_rs::{FieldLayout, Metric, PortId, SampleRouter, WeightGrid};
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Saved session file (`YYYYMMDD_HHMMSS.txt`) or a `port<TAB>line` capture
    #[arg(long, conflicts_with = "session_dir")]
    log: Option<PathBuf>,

    /// Directory of session files to batch replay (processes *.txt)
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// Points kept per series
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Write the replayed log as a new session file into this directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

/// One line to feed through the router
struct ReplayLine {
    port: PortId,
    weight: Option<WeightGrid>,
    line: String,
}

fn load_lines(path: &Path) -> anyhow::Result<Vec<ReplayLine>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut first = String::new();
    reader.read_line(&mut first)?;

    if first.starts_with(HEADER[0]) {
        let rows = read_rows(reader)?;
        return rows
            .into_iter()
            .map(|row| -> anyhow::Result<ReplayLine> {
                Ok(ReplayLine {
                    port: row.port,
                    weight: Some(row.weight.parse::<WeightGrid>()?),
                    line: row.line,
                })
            })
            .collect();
    }

    // capture format: port<TAB>line, first line included
    let mut lines = Vec::new();
    for text in std::iter::once(Ok(first)).chain(reader.lines()) {
        let text = text?;
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            continue;
        }
        match text.split_once('\t') {
            Some((port, line)) => lines.push(ReplayLine {
                port: PortId::new(port),
                weight: None,
                line: line.to_string(),
            }),
            None => eprintln!("skipping line without a port column: {:?}", text),
        }
    }
    Ok(lines)
}

fn replay(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let lines = load_lines(path)?;
    if lines.is_empty() {
        bail!("{} contains no lines", path.display());
    }

    let mut ports: Vec<PortId> = Vec::new();
    for line in &lines {
        if !ports.contains(&line.port) {
            ports.push(line.port.clone());
        }
    }

    let weights = SharedWeights::new();
    let router = SampleRouter::new(
        &ports,
        args.capacity,
        FieldLayout::default(),
        weights.clone(),
        None,
    )?;

    for line in &lines {
        if let Some(grid) = line.weight {
            weights.replace(grid)?;
        }
        router.on_line(&line.port, &line.line)?;
    }

    let mut summary = Vec::new();
    for stats in router.port_stats()? {
        let laser = router.snapshot(Metric::Laser, &stats.port)?;
        let range = laser.first().map(|first| {
            laser.iter().fold((first.value, first.value), |(lo, hi), p| {
                (lo.min(p.value), hi.max(p.value))
            })
        });
        let deltas = router.snapshot(Metric::LaserDelta, &stats.port)?;
        let max_step = deltas.iter().map(|p| p.value.abs()).fold(0.0, f64::max);

        summary.push(json!({
            "port": stats.port,
            "samples": stats.samples,
            "rejected": stats.rejected,
            "last_laser": stats.latest.map(|s| s.laser),
            "last_delta": stats.laser_delta,
            "laser_min": range.map(|r| r.0),
            "laser_max": range.map(|r| r.1),
            "max_step": max_step,
        }));
    }

    let mut written = None;
    if let Some(dir) = &args.output_dir {
        fs::create_dir_all(dir)?;
        written = Some(flush_to_dir(dir, &router.log_records()?)?);
    }

    Ok(json!({
        "source": path.display().to_string(),
        "lines": lines.len(),
        "log_records": router.log_len()?,
        "ports": summary,
        "written": written.map(|p| p.display().to_string()),
    }))
}

fn print_summary(report: &serde_json::Value) {
    println!("=== {} ===", report["source"].as_str().unwrap_or("?"));
    println!(
        "lines: {}  accepted: {}",
        report["lines"], report["log_records"]
    );
    if let Some(ports) = report["ports"].as_array() {
        for port in ports {
            println!(
                "  {:<14} samples={:<6} rejected={:<4} last_laser={} last_delta={} range=[{}, {}] max_step={}",
                port["port"].as_str().unwrap_or("?"),
                port["samples"],
                port["rejected"],
                port["last_laser"],
                port["last_delta"],
                port["laser_min"],
                port["laser_max"],
                port["max_step"],
            );
        }
    }
    if let Some(written) = report["written"].as_str() {
        println!("written: {}", written);
    }
}

fn session_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|e| e == "txt").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let files = match (&args.log, &args.session_dir) {
        (Some(log), _) => vec![log.clone()],
        (None, Some(dir)) => session_files(dir)?,
        (None, None) => bail!("pass --log <file> or --session-dir <dir>"),
    };

    let mut reports = Vec::new();
    for path in &files {
        match replay(path, &args) {
            Ok(report) => {
                if !args.json {
                    print_summary(&report);
                }
                reports.push(report);
            }
            Err(e) => eprintln!("{}: {}", path.display(), e),
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}
