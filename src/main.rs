use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use crossbeam::channel::Receiver;
use env_logger::Env;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep_until, Duration, Instant};

use load_logger_rs::{
    Acquisition, AcquisitionConfig, CoreEvent, PortId, SerialOpener, WeightGrid, WEIGHT_STEP,
};

#[derive(Parser, Debug)]
#[command(name = "load_logger")]
#[command(about = "Multi-port laser + IMU serial logger with periodic session saves", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port to read (repeat for several)
    #[arg(long = "port", value_name = "PORT")]
    ports: Vec<String>,

    #[arg(long)]
    baud: Option<u32>,

    /// Points kept per series
    #[arg(long)]
    capacity: Option<usize>,

    /// Autosave interval in seconds (0 = off)
    #[arg(long)]
    autosave_secs: Option<u64>,

    /// Output directory for session files and live status
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Live status refresh interval in seconds
    #[arg(long, default_value = "2")]
    status_secs: u64,
}

/// Operator commands read from stdin
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Pause,
    Resume,
    Stop,
    Save,
    Reset,
    Adjust { cell: usize, delta: i64 },
    Set { cell: usize, value: i64 },
    ZeroWeights,
    Status,
    Help,
    Quit,
}

const HELP: &str = "commands: pause | resume | stop | save | reset | status | quit
  +<cell> / -<cell>   add or remove 20 on a weight cell
  set <cell> <value>  store a value in a cell
  zero                clear all weight cells
cells: q w e / a s d / z x c (or 0-8)";

/// Weight cells as laid out on the keyboard, row-major
const CELL_KEYS: [char; 9] = ['q', 'w', 'e', 'a', 's', 'd', 'z', 'x', 'c'];

fn parse_cell(token: &str) -> Result<usize> {
    let mut chars = token.chars();
    if let (Some(key), None) = (chars.next(), chars.next()) {
        if let Some(cell) = CELL_KEYS.iter().position(|k| *k == key.to_ascii_lowercase()) {
            return Ok(cell);
        }
    }
    let cell: usize = token
        .parse()
        .map_err(|_| anyhow!("unknown cell '{}'", token))?;
    if cell >= CELL_KEYS.len() {
        return Err(anyhow!("cell {} out of range", cell));
    }
    Ok(cell)
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    if let Some(cell) = line.strip_prefix('+') {
        return Ok(Command::Adjust {
            cell: parse_cell(cell.trim())?,
            delta: WEIGHT_STEP,
        });
    }
    if let Some(cell) = line.strip_prefix('-') {
        return Ok(Command::Adjust {
            cell: parse_cell(cell.trim())?,
            delta: -WEIGHT_STEP,
        });
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["pause"] => Ok(Command::Pause),
        ["resume"] => Ok(Command::Resume),
        ["stop"] => Ok(Command::Stop),
        ["save"] => Ok(Command::Save),
        ["reset"] => Ok(Command::Reset),
        ["zero"] => Ok(Command::ZeroWeights),
        ["status"] => Ok(Command::Status),
        ["help"] | ["?"] => Ok(Command::Help),
        ["quit"] | ["exit"] => Ok(Command::Quit),
        ["set", cell, value] => Ok(Command::Set {
            cell: parse_cell(cell)?,
            value: value
                .parse()
                .map_err(|_| anyhow!("weight must be a whole number, got '{}'", value))?,
        }),
        _ => Err(anyhow!("unknown command '{}' (try 'help')", line)),
    }
}

fn build_config(args: &Args) -> Result<AcquisitionConfig> {
    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AcquisitionConfig::default(),
    };
    if !args.ports.is_empty() {
        config.ports = args.ports.iter().map(|p| PortId::new(p.as_str())).collect();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(secs) = args.autosave_secs {
        config.autosave_secs = secs;
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Drain core events until every sender is gone
fn forward_events(events: Receiver<CoreEvent>) {
    for event in events.iter() {
        match event {
            CoreEvent::Sample(accepted) => debug!(
                "[{}] #{} laser={:.3} delta={:.3}",
                accepted.port, accepted.sample.sequence, accepted.sample.laser, accepted.laser_delta
            ),
            CoreEvent::ReaderFailed { port, reason } => {
                println!("[{}] Port {} stopped: {}", ts_now(), port, reason)
            }
            CoreEvent::Flush { file_name, result } => match result {
                Ok(path) => println!("[{}] Saved {}", ts_now(), path.display()),
                Err(e) => println!("[{}] Save of {} failed: {}", ts_now(), file_name, e),
            },
        }
    }
}

async fn blocking<T, F>(acquisition: &Arc<Acquisition>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Acquisition) -> T + Send + 'static,
{
    let acquisition = acquisition.clone();
    Ok(tokio::task::spawn_blocking(move || op(&*acquisition)).await?)
}

fn print_weights(grid: &WeightGrid) {
    let cells = grid.cells();
    for row in cells.chunks(3) {
        println!("  {:>6} {:>6} {:>6}", row[0], row[1], row[2]);
    }
}

/// Returns false when the operator asked to quit
async fn run_command(acquisition: &Arc<Acquisition>, command: Command) -> Result<bool> {
    match command {
        Command::Pause => println!("Paused {} reader(s)", acquisition.pause_all()),
        Command::Resume => println!("Resumed {} reader(s)", acquisition.resume_all()),
        Command::Stop => {
            let stopped = blocking(acquisition, |a| a.stop_all()).await?;
            println!("Stopped {} reader(s)", stopped);
        }
        Command::Reset => println!("Reset queued on {} reader(s)", acquisition.reset_devices()),
        Command::Save => {
            // the outcome is reported by the event forwarder
            let _ = blocking(acquisition, |a| a.save()).await?;
        }
        Command::Adjust { cell, delta } => {
            acquisition.adjust_weight(cell, delta)?;
            print_weights(&acquisition.weights()?);
        }
        Command::Set { cell, value } => {
            acquisition.set_weight(cell, value)?;
            print_weights(&acquisition.weights()?);
        }
        Command::ZeroWeights => {
            acquisition.reset_weights()?;
            print_weights(&acquisition.weights()?);
        }
        Command::Status => println!("{}", acquisition.live_status()?.format_status()),
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = build_config(&args)?;

    println!("[{}] Load Logger Starting", ts_now());
    println!(
        "  Ports: {}",
        config
            .ports
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Baud: {}", config.baud_rate);
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Output Dir: {}", config.output_dir.display());

    std::fs::create_dir_all(&config.output_dir)?;
    let output_dir = config.output_dir.clone();

    let opener = Arc::new(SerialOpener {
        baud_rate: config.baud_rate,
        read_timeout: config.read_timeout(),
    });
    let acquisition = Arc::new(Acquisition::start(config, opener)?);
    let forwarder = tokio::task::spawn_blocking({
        let events = acquisition.events();
        move || forward_events(events)
    });

    println!("{}", HELP);

    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let mut status_tick = interval(Duration::from_secs(args.status_secs.max(1)));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            _ = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                println!("[{}] Duration reached, stopping...", ts_now());
                break;
            }
            _ = status_tick.tick() => {
                match acquisition.live_status() {
                    Ok(status) => {
                        if let Err(e) = status.save(&output_dir.join("live_status.json")) {
                            warn!("Cannot write live status: {}", e);
                        }
                        info!("{}", status.format_status());
                    }
                    Err(e) => warn!("Cannot collect live status: {}", e),
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match parse_command(&line) {
                        Ok(command) => match run_command(&acquisition, command).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => println!("{}", e),
                        },
                        Err(e) => println!("{}", e),
                    },
                    Ok(None) => {
                        debug!("stdin closed, commands disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    // Final save
    if let Err(e) = blocking(&acquisition, |a| a.save()).await? {
        println!("[{}] Final save failed: {}", ts_now(), e);
    }
    blocking(&acquisition, |a| a.shutdown()).await?;

    let final_status = acquisition.live_status()?;
    let _ = final_status.save(&output_dir.join("live_status_final.json"));

    println!("\n=== Final Stats ===");
    for port in &final_status.ports {
        println!("{}: {} samples, {} rejected, {}", port.port, port.samples, port.rejected, port.state);
    }
    println!("Log records: {}", final_status.log_records);
    println!("Saved files: {}", final_status.saved_files.join(", "));

    // last handle; dropping it closes the event channel
    drop(acquisition);
    forwarder.await?;
    Ok(())
}

fn ts_now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
