use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use compost_sync::coordinator::Coordinator;
use compost_sync::models::Reading;
use compost_sync::sync::DrainOutcome;
use compost_sync::{systems, AppContext, Config};

#[derive(Parser, Debug)]
#[command(name = "compost_cli")]
#[command(about = "Record compost readings offline and sync them to the shared sheet")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Do not contact the remote gateway after local changes
    #[arg(long)]
    offline: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show queue state and last sync time
    Status,
    /// Deliver every pending reading and media item now
    Sync,
    /// Delete every queued sync task (cannot be undone)
    Discard {
        /// Confirm the discard
        #[arg(long)]
        yes: bool,
    },
    /// List stored readings for a system or a date
    List {
        #[arg(long)]
        system: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },
    /// Print a blank reading for today, pre-filled with weather
    Blank {
        #[arg(long)]
        system: String,
    },
    /// Record today's reading for a system
    Record {
        #[arg(long)]
        system: String,
        /// Comma separated probe values in walking order; leave a slot empty to skip it
        #[arg(long)]
        probes: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Attach a photo or video file to a stored reading
    Attach {
        #[arg(long)]
        reading: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Show today's forecast for the site
    Weather,
    /// Show kill-cycle streaks for a system
    Streaks {
        #[arg(long)]
        system: String,
    },
}

// example usage:
// COMPOST_API_BASE_URL=https://example.org/.netlify/functions ./target/release/compost_cli record --system pivot-1 --probes 98,,101,130
// COMPOST_API_BASE_URL=https://example.org/.netlify/functions ./target/release/compost_cli --offline attach --reading <id> --file pile.jpg
// COMPOST_API_BASE_URL=https://example.org/.netlify/functions ./target/release/compost_cli sync

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("compost_sync={}", args.log_level))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let context = AppContext::open(&config).context("opening local store")?;
    let coordinator = Coordinator::new(context, !args.offline)?;
    let mut notices = coordinator.subscribe_notices();

    let result = run(&coordinator, args.command).await;

    while let Ok(notice) = notices.try_recv() {
        println!("[{:?}] {}", notice.kind, notice.message);
    }

    coordinator.shutdown()?;
    result
}

async fn run(coordinator: &Coordinator, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let settings = coordinator.settings();
            println!("Pending tasks: {}", coordinator.pending_count());
            match settings.last_sync_time {
                Some(at) => println!("Last sync: {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
                None => println!("Last sync: never"),
            }
            for task in coordinator.tasks()? {
                println!(
                    "  {:<8} {:<18} {} retries={} {}",
                    format!("{:?}", task.kind()).to_lowercase(),
                    task.status.as_str(),
                    task.target.record_id(),
                    task.retry_count,
                    task.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Sync => match coordinator.sync_now().await {
            DrainOutcome::Completed(report) => {
                println!("Synced {}, failed {}", report.synced, report.failed);
                for failure in &report.failures {
                    println!("  {} {}: {}", failure.task_id, failure.target.record_id(), failure.reason);
                }
            }
            DrainOutcome::Skipped => println!("A sync is already running"),
        },
        Command::Discard { yes } => {
            if !yes {
                bail!("discarding pending sync tasks cannot be undone; pass --yes to confirm");
            }
            let removed = coordinator.discard_pending()?;
            println!("Discarded {} tasks", removed);
        }
        Command::List { system, date } => {
            let readings = match (system, date) {
                (Some(system), _) => coordinator.get_all_for_system(&system)?,
                (None, Some(date)) => coordinator.get_all_for_date(&date)?,
                (None, None) => coordinator.entries(),
            };
            for reading in readings {
                print_reading(&reading);
            }
        }
        Command::Blank { system } => {
            let mut reading = coordinator.create_blank(&system);
            coordinator.suggest_weather(&mut reading).await;
            println!("{}", serde_json::to_string_pretty(&reading)?);
        }
        Command::Record {
            system,
            probes,
            notes,
        } => {
            if systems::system_by_id(&system).is_none() {
                bail!("unknown system {}", system);
            }
            let mut reading = coordinator.create_blank(&system);
            if let Some(existing) = coordinator.get_for(&system, &reading.date)? {
                reading = existing;
            }
            for (index, raw) in probes.split(',').enumerate() {
                let raw = raw.trim();
                let value = if raw.is_empty() {
                    None
                } else {
                    Some(raw.parse::<f64>().with_context(|| format!("probe {} value {:?}", index + 1, raw))?)
                };
                if !reading.set_probe(index, value) {
                    bail!("{} has no probe {}", system, index + 1);
                }
            }
            if let Some(notes) = notes {
                reading.general_notes = notes;
            }
            coordinator.suggest_weather(&mut reading).await;
            let saved = coordinator.save(reading).await?;
            print_reading(&saved);
        }
        Command::Attach { reading, file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let extension = file
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            let item = match extension.as_str() {
                "jpg" | "jpeg" => coordinator.attach_photo(&reading, &bytes, "image/jpeg").await?,
                "png" => coordinator.attach_photo(&reading, &bytes, "image/png").await?,
                "mp4" => coordinator.attach_video(&reading, &bytes, "video/mp4").await?,
                "mov" => coordinator.attach_video(&reading, &bytes, "video/quicktime").await?,
                other => return Err(anyhow!("unsupported media type {:?}", other)),
            };
            println!("Attached {} as {}", item.filename, item.id);
        }
        Command::Weather => {
            let today = Local::now().format("%Y-%m-%d").to_string();
            match coordinator.weather_for(&today).await {
                Some(data) => println!(
                    "{}: {} now {}°, range {}° to {}°",
                    today,
                    data.condition.as_str(),
                    data.current_temp,
                    data.min_temp,
                    data.max_temp
                ),
                None => println!("No weather available"),
            }
        }
        Command::Streaks { system } => {
            let streaks = coordinator.kill_streaks_for(&system)?;
            println!(
                "{}: current {} days, longest {} days{}",
                system,
                streaks.current,
                streaks.longest,
                if streaks.is_complete() { " (kill cycle complete)" } else { "" }
            );
        }
    }
    Ok(())
}

fn print_reading(reading: &Reading) {
    let probes: Vec<String> = reading
        .probes
        .iter()
        .map(|p| p.value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()))
        .collect();
    println!(
        "{} {} {} {} avg={} peak={} [{}] media={} {}",
        reading.id,
        reading.system_id,
        reading.date,
        reading.time,
        reading.average_temp.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        reading.peak_temp.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        probes.join(", "),
        reading.media_ids.len(),
        if reading.synced { "synced" } else { "pending" }
    );
}
