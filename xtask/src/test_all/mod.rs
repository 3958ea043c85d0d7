//! Run the workspace tests and manage pending insta snapshots.
//!
//! The crate uses inline snapshots, so a failing snapshot assertion leaves a
//! `.pending-snap` file next to the source file. `run` removes stale ones
//! first so that `cargo insta review` only shows the current run.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Subcommand;

/// Directories that may contain pending snapshot files.
const SOURCE_DIRS: &[&str] = &["src", "hwc-vrr-config/src"];

const PENDING_EXTENSIONS: &[&str] = &[".pending-snap", ".snap.new"];

#[derive(Subcommand)]
pub enum Action {
    /// Run all tests with cleanup
    Run {
        /// Only run tests matching this filter
        #[arg(long, short)]
        filter: Option<String>,

        /// Don't clean up pending snapshots before running
        #[arg(long)]
        no_pre_clean: bool,

        /// Run tests in release mode
        #[arg(long)]
        release: bool,
    },
    /// Remove pending snapshot files
    Clean {
        /// Show what would be cleaned without actually cleaning
        #[arg(long)]
        dry_run: bool,
    },
    /// Show pending snapshot files
    Status,
}

pub fn run(action: Action) -> Result<()> {
    match action {
        Action::Run {
            filter,
            no_pre_clean,
            release,
        } => run_tests(filter, no_pre_clean, release),
        Action::Clean { dry_run } => clean(dry_run),
        Action::Status => status(),
    }
}

fn run_tests(filter: Option<String>, no_pre_clean: bool, release: bool) -> Result<()> {
    if !no_pre_clean {
        let removed = clean_pending()?;
        if removed > 0 {
            println!("Removed {removed} stale pending snapshots\n");
        }
    }

    let mut cmd = Command::new("cargo");
    cmd.args(["test", "--workspace"]);
    if release {
        cmd.arg("--release");
    }
    if let Some(filter) = &filter {
        cmd.args(["--", filter]);
    }

    let start = Instant::now();
    let status = cmd.status().context("failed to run cargo test")?;
    let secs = start.elapsed().as_secs_f64();
    println!();

    if status.success() {
        println!("All tests passed in {secs:.2}s");
        return Ok(());
    }

    println!("Some tests failed (took {secs:.2}s)");
    let pending = find_pending();
    if !pending.is_empty() {
        println!("\n{} pending snapshots, review with: cargo insta review", pending.len());
    }
    std::process::exit(1);
}

fn clean(dry_run: bool) -> Result<()> {
    let pending = find_pending();
    if pending.is_empty() {
        println!("No pending snapshots");
        return Ok(());
    }

    for path in &pending {
        if dry_run {
            println!("[dry-run] would remove {}", path.display());
        } else {
            println!("removing {}", path.display());
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }

    Ok(())
}

fn status() -> Result<()> {
    let pending = find_pending();
    println!("Pending snapshots: {}", pending.len());
    for path in pending {
        println!("  {}", path.display());
    }
    Ok(())
}

fn clean_pending() -> Result<usize> {
    let pending = find_pending();
    for path in &pending {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(pending.len())
}

fn find_pending() -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in SOURCE_DIRS {
        walk(Path::new(dir), &mut files);
    }
    files.sort();
    files
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if PENDING_EXTENSIONS
            .iter()
            .any(|ext| path.to_string_lossy().ends_with(ext))
        {
            out.push(path);
        }
    }
}
