// Command-line interface definitions for cribwatch
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cribwatch")]
#[command(author, version, about = "Sleep, cry and care monitor for a crib camera")]
#[command(long_about = "
Cribwatch watches a crib camera and turns noisy perception signals into
debounced asleep/awake and crying transitions, logs them with diaper and
feeding entries, and sends throttled alerts.

SETUP:
  1. Install ffmpeg
  2. Run: cribwatch config --default > ~/.config/cribwatch/config.toml
  3. Set [camera] url and [perception] endpoint
  4. Run: cribwatch (to start the daemon)
  5. Run: cribwatch focus x,y,w,h (to point detection at the mattress)

USAGE:
  cribwatch status --follow       Stream state changes
  cribwatch diaper wet            Log a diaper change
  cribwatch stats                 Today's sleep and diaper summary
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the camera URL (RTSP or anything ffmpeg can open)
    #[arg(long, value_name = "URL")]
    pub camera: Option<String>,

    /// Override the data directory (event log, snapshots, samples)
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Show current configuration
    Config {
        /// Print the commented default configuration instead
        #[arg(long)]
        default: bool,
    },

    /// Show monitor status (for status bar integration)
    Status {
        /// Keep running and print every change
        #[arg(long)]
        follow: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List recent events, newest first
    Events {
        /// Which log to read
        #[arg(value_enum)]
        kind: EventLog,

        /// Maximum number of events
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only events at or after this time (RFC3339 or YYYY-MM-DD)
        #[arg(long, value_name = "TIME")]
        since: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Log a diaper change
    Diaper {
        #[arg(value_enum)]
        kind: DiaperArg,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Log a feeding
    Feeding {
        #[arg(value_enum)]
        kind: FeedingArg,

        /// Duration in minutes
        #[arg(long, value_name = "MINUTES")]
        duration: Option<u32>,

        /// Amount in ounces
        #[arg(long, value_name = "OZ")]
        amount: Option<f32>,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Sleep, wake window and diaper summary for a day
    Stats {
        /// Day to summarise (YYYY-MM-DD, local time; default today)
        #[arg(long, value_name = "DATE")]
        date: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Set the focus region of the running daemon (x,y,w,h)
    ///
    /// Coordinates are relative to the current focus region when one is set.
    Focus {
        /// Region as x,y,w,h
        #[arg(required_unless_present = "reset", conflicts_with = "reset")]
        region: Option<String>,

        /// Go back to the full frame
        #[arg(long)]
        reset: bool,
    },

    /// Label the current frame as a retraining sample
    Sample {
        #[arg(value_enum)]
        label: SampleArg,
    },

    /// Enable or disable a notification category on the running daemon
    Notifications {
        /// baby_woke_up, baby_fell_asleep, baby_crying, diaper_reminder or feeding_reminder
        category: String,

        #[arg(value_enum)]
        toggle: Toggle,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventLog {
    Sleep,
    Cry,
    Diaper,
    Feeding,
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiaperArg {
    Wet,
    Dirty,
    Both,
    Dry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FeedingArg {
    Breast,
    Bottle,
    Solid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SampleArg {
    Present,
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}
