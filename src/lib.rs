//! Cribwatch: sleep, cry and care monitoring for a crib camera
//!
//! This library provides the core functionality for:
//! - Capturing frames and audio from an RTSP camera via ffmpeg, or audio
//!   from a local microphone via cpal
//! - Fusing face, pose and occlusion observations into a debounced
//!   awake confidence and asleep/awake transitions
//! - Tracking cry episodes with asymmetric onset/offset thresholds
//! - Fanning alerts out to Pushover, Telegram, webhooks and the desktop
//!   under a per-category cooldown
//! - Logging sleep, cry, diaper, feeding and notification events to SQLite
//!
//! Perception itself (landmarks, pose, occlusion, cry classification) is
//! delegated to external services behind the traits in [`perception`].
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────┐                              ┌──────────────┐
//!   │ Video Capture│ frames                chunks │ Audio Capture│
//!   │   (ffmpeg)   │──────┐                ┌──────│ (ffmpeg/cpal)│
//!   └──────────────┘      ▼                ▼      └──────────────┘
//!                  ┌─────────────┐  ┌─────────────┐
//!                  │  Bounded    │  │  Bounded    │  drop-oldest,
//!                  │  Channel    │  │  Channel    │  take-newest
//!                  └─────────────┘  └─────────────┘
//!                         │                │
//!                         ▼                ▼
//!                  ┌─────────────┐  ┌─────────────┐
//!                  │  Detection  │  │    Audio    │
//!                  │   Worker    │  │   Worker    │
//!                  │ crop → vote │  │ classify →  │
//!                  │ → sleep FSM │  │ cry tracker │
//!                  └─────────────┘  └─────────────┘
//!                         │   transitions  │
//!           ┌─────────────┼────────────────┼─────────────┐
//!           ▼             ▼                ▼             ▼
//!    ┌────────────┐ ┌───────────┐   ┌────────────┐ ┌───────────┐
//!    │ Event Store│ │State File │   │Alert Queue │ │Assessment │
//!    │  (SQLite)  │ │           │   │            │ │  (watch)  │
//!    └────────────┘ └───────────┘   └────────────┘ └───────────┘
//!           ▲                              │             │
//!    ┌────────────┐                        ▼             ▼
//!    │ Reminders  │───────────────▶ ┌────────────┐ ┌───────────┐
//!    └────────────┘                 │ Dispatcher │ │  Control  │
//!                                   │ (cooldown) │ │  Handle   │
//!                                   └────────────┘ └───────────┘
//!                                          │
//!                        pushover / telegram / webhook / desktop
//! ```

pub mod analytics;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod config;
pub mod control;
pub mod cry;
pub mod daemon;
pub mod debounce;
pub mod error;
pub mod frame;
pub mod notify;
pub mod perception;
pub mod pipeline;
pub mod reminder;
pub mod sleep;
pub mod store;
pub mod voting;
pub mod worker;

pub use cli::{Cli, Commands, OutputFormat};
pub use config::Config;
pub use daemon::Daemon;
pub use error::{CribError, Result};
