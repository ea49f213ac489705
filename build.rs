//! Build script for cribwatch
//!
//! Renders `cribwatch.1` plus one page per subcommand with clap_mangen.
//! Runs for release builds or when CRIBWATCH_GEN_MANPAGES is set.

use clap::CommandFactory;
use clap_mangen::Man;
use std::env;
use std::fs::{self, File};
use std::io::Error;
use std::path::{Path, PathBuf};

include!("src/cli.rs");

fn render(cmd: clap::Command, path: &Path) -> Result<(), Error> {
    let mut file = File::create(path)?;
    Man::new(cmd).render(&mut file)
}

fn main() -> Result<(), Error> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=CRIBWATCH_GEN_MANPAGES");

    let release = env::var("PROFILE").is_ok_and(|p| p == "release");
    if !release && env::var_os("CRIBWATCH_GEN_MANPAGES").is_none() {
        return Ok(());
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap_or_else(|_| "target".to_string()));
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let cmd = Cli::command();
    render(cmd.clone(), &man_dir.join("cribwatch.1"))?;

    // The command tree is flat: daemon, status, events, diaper, ...
    for sub in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        let page = man_dir.join(format!("cribwatch-{}.1", sub.get_name()));
        render(sub.clone(), &page)?;
    }

    println!("cargo:warning=Man pages generated in: {}", man_dir.display());
    Ok(())
}
