//! Cribwatch - crib camera sleep and cry monitor
//!
//! Run with `cribwatch` or `cribwatch daemon` to start the daemon.
//! Use `cribwatch diaper <kind>` / `cribwatch feeding <kind>` to log care,
//! `cribwatch stats` for a daily summary.

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use clap::Parser;
use cribwatch::analytics;
use cribwatch::cli::{
    Cli, Commands, DiaperArg, EventLog, FeedingArg, OutputFormat, SampleArg, Toggle,
};
use cribwatch::config::{self, Config};
use cribwatch::control::{self, ControlRequest};
use cribwatch::daemon::{self, Daemon};
use cribwatch::store::{
    DiaperEvent, DiaperKind, EventRecord, EventStore, FeedingEvent, FeedingKind, RecordKind,
    SleepEvent, SqliteEventStore,
};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Enough history for a week of stats
const STATS_HISTORY: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("cribwatch={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(url) = cli.camera {
        config.camera.url = Some(url);
    }
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir.display().to_string();
    }

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            let mut daemon = Daemon::new(config);
            daemon.run().await?;
        }

        Commands::Config { default } => {
            if default {
                print!("{}", config::DEFAULT_CONFIG);
            } else {
                show_config(&config)?;
            }
        }

        Commands::Status { follow, format } => {
            run_status(&config, follow, format)?;
        }

        Commands::Events {
            kind,
            limit,
            since,
            format,
        } => {
            let since = since.as_deref().map(parse_since).transpose()?;
            show_events(&config, kind, limit, since, format)?;
        }

        Commands::Diaper { kind, notes } => {
            let store = open_store(&config)?;
            let kind = match kind {
                DiaperArg::Wet => DiaperKind::Wet,
                DiaperArg::Dirty => DiaperKind::Dirty,
                DiaperArg::Both => DiaperKind::Both,
                DiaperArg::Dry => DiaperKind::Dry,
            };
            store.append_diaper_event(kind, notes.as_deref(), Utc::now())?;
            println!("Logged {} diaper", kind.as_str());
        }

        Commands::Feeding {
            kind,
            duration,
            amount,
            notes,
        } => {
            let store = open_store(&config)?;
            let kind = match kind {
                FeedingArg::Breast => FeedingKind::Breast,
                FeedingArg::Bottle => FeedingKind::Bottle,
                FeedingArg::Solid => FeedingKind::Solid,
            };
            store.append_feeding_event(&FeedingEvent {
                at: Utc::now(),
                kind,
                duration_minutes: duration,
                amount_oz: amount,
                notes,
            })?;
            println!("Logged {} feeding", kind.as_str());
        }

        Commands::Stats { date, format } => {
            let today = Local::now().date_naive();
            let date = match date {
                Some(d) => NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                    .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", d))?,
                None => today,
            };
            show_stats(&config, date, today, format)?;
        }

        Commands::Focus { region, reset } => {
            let request = match (region, reset) {
                (_, true) => ControlRequest::ResetFocus,
                (Some(region), false) => {
                    // Validate before queueing
                    region
                        .parse::<cribwatch::frame::Region>()
                        .map_err(|r| anyhow::anyhow!("Invalid region '{}', expected x,y,w,h", r))?;
                    ControlRequest::SetFocus { region }
                }
                (None, false) => anyhow::bail!("Give a region (x,y,w,h) or --reset"),
            };
            queue_control(request)?;
        }

        Commands::Sample { label } => {
            let label = match label {
                SampleArg::Present => "present",
                SampleArg::Absent => "absent",
            };
            queue_control(ControlRequest::Sample {
                label: label.to_string(),
            })?;
        }

        Commands::Notifications { category, toggle } => {
            if cribwatch::notify::EventKind::parse(&category).is_none() {
                anyhow::bail!(
                    "Unknown category '{}'. Known: baby_woke_up, baby_fell_asleep, \
                     baby_crying, diaper_reminder, feeding_reminder",
                    category
                );
            }
            queue_control(ControlRequest::Notifications {
                category,
                enabled: toggle == Toggle::On,
            })?;
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<SqliteEventStore> {
    let path = config.database_path();
    SqliteEventStore::open(&path).with_context(|| format!("Failed to open event log {:?}", path))
}

fn queue_control(request: ControlRequest) -> anyhow::Result<()> {
    if !Config::runtime_dir().join("pid").exists() {
        eprintln!("Warning: daemon does not appear to be running; request will wait for it.");
    }
    let path = control::queue_request(&daemon::control_dir(), &request)?;
    tracing::debug!("Queued control request {:?}", path);
    println!("Request sent to daemon");
    Ok(())
}

/// RFC3339, or a local date meaning its midnight
fn parse_since(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(s) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid time '{}', expected RFC3339 or YYYY-MM-DD", s))?;
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("No local midnight on {}", date))
}

fn show_events(
    config: &Config,
    kind: EventLog,
    limit: usize,
    since: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let kind = match kind {
        EventLog::Sleep => RecordKind::Sleep,
        EventLog::Cry => RecordKind::Cry,
        EventLog::Diaper => RecordKind::Diaper,
        EventLog::Feeding => RecordKind::Feeding,
        EventLog::Notifications => RecordKind::Notification,
    };
    let events = store.read_recent(kind, limit, since)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
        OutputFormat::Text => {
            if events.is_empty() {
                println!("No events");
            }
            for event in &events {
                println!("{}", event);
            }
        }
    }
    Ok(())
}

fn show_stats(
    config: &Config,
    date: NaiveDate,
    today: NaiveDate,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let since = parse_since(&(date.min(today) - chrono::Duration::days(8)).to_string())?;

    let sleep: Vec<SleepEvent> = store
        .read_recent(RecordKind::Sleep, STATS_HISTORY, Some(since))?
        .into_iter()
        .filter_map(|r| match r {
            EventRecord::Sleep(e) => Some(e),
            _ => None,
        })
        .collect();
    let diapers: Vec<DiaperEvent> = store
        .read_recent(RecordKind::Diaper, STATS_HISTORY, Some(since))?
        .into_iter()
        .filter_map(|r| match r {
            EventRecord::Diaper(e) => Some(e),
            _ => None,
        })
        .collect();

    let naps = analytics::daily_sleep_stats(&sleep, date, &Local);
    let night = analytics::night_sleep_stats(&sleep, date, &Local);
    let wake = analytics::wake_window_status(
        config.baby_age_months,
        analytics::awake_since(&sleep),
        Utc::now(),
    );
    let diaper = analytics::diaper_stats(&diapers, date, today, &Local);

    if format == OutputFormat::Json {
        let value = serde_json::json!({
            "naps": naps,
            "night": night,
            "wake_window": wake,
            "diapers": diaper,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Summary for {}\n", date);
    println!("[naps]");
    println!("  count = {}", naps.nap_count);
    println!("  total = {:.0} min", naps.total_nap_minutes);
    println!("  longest = {:.0} min", naps.longest_nap_minutes);

    println!("\n[night]");
    println!("  total = {:.0} min", night.total_minutes);
    println!("  wakings = {}", night.wake_count);
    println!("  longest stretch = {:.0} min", night.longest_stretch_minutes);

    println!("\n[wake window]");
    println!(
        "  awake {:.0} min of {:.0}-{:.0} ({:?})",
        wake.awake_minutes, wake.window_min_minutes, wake.window_max_minutes, wake.urgency
    );

    println!("\n[diapers]");
    println!(
        "  total = {} (wet {}, dirty {})",
        diaper.total, diaper.wet, diaper.dirty
    );
    println!("  7-day average = {:.1}/day", diaper.daily_average_7d);
    if let Some(ref last) = diaper.last_change {
        println!(
            "  last change = {} ({})",
            last.at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            last.kind.as_str()
        );
    }
    Ok(())
}

/// Run the status command - show current monitor state
fn run_status(config: &Config, follow: bool, format: OutputFormat) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        eprintln!("Error: state_file is not configured.");
        eprintln!();
        eprintln!("To enable status monitoring, add to your config.toml:");
        eprintln!();
        eprintln!("  state_file = \"auto\"");
        std::process::exit(1);
    };

    let print_state = |state: &str| match format {
        OutputFormat::Json => println!("{}", format_state_json(state, &daemon::assessment_path())),
        OutputFormat::Text => println!("{}", state),
    };

    let state = read_state(&state_path);
    print_state(&state);
    if !follow {
        return Ok(());
    }

    // Follow mode: watch the state file's directory for changes
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // The file may not exist yet
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    let mut last_state = state;
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {
                let new_state = read_state(&state_path);
                if new_state != last_state {
                    print_state(&new_state);
                    last_state = new_state;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {:?}", e);
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if !state_path.exists() && last_state != "stopped" {
                    print_state("stopped");
                    last_state = "stopped".to_string();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

fn read_state(path: &Path) -> String {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "stopped".to_string())
}

/// Format state as JSON for status bars, with the latest assessment if any
fn format_state_json(state: &str, assessment: &Path) -> String {
    let (text, tooltip) = match state {
        "asleep" => ("😴", "Asleep"),
        "awake" => ("👀", "Awake"),
        "crying" => ("😭", "Crying"),
        "unknown" => ("…", "Waiting for enough observations"),
        "stopped" => ("", "Cribwatch not running"),
        _ => ("?", "Unknown state"),
    };
    let detail: serde_json::Value = std::fs::read(assessment)
        .ok()
        .and_then(|body| serde_json::from_slice(&body).ok())
        .unwrap_or(serde_json::Value::Null);

    serde_json::json!({
        "text": text,
        "class": state,
        "tooltip": tooltip,
        "assessment": detail,
    })
    .to_string()
}

/// Show current configuration
fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");
    print!("{}", toml::to_string_pretty(config)?);

    println!("\n[paths]");
    match Config::default_path() {
        Some(path) => println!("  config = {:?}", path),
        None => println!("  config = (none)"),
    }
    println!("  data_dir = {:?}", config.data_dir());
    println!("  database = {:?}", config.database_path());
    println!("  snapshots = {:?}", config.snapshots_dir());
    match config.resolve_state_file() {
        Some(path) => println!("  state_file = {:?}", path),
        None => println!("  state_file = (disabled)"),
    }
    Ok(())
}
