//! Output formatting and display utilities
//!
//! Provides colored, formatted output for the CLI

use colored::Colorize;

use ordem::{HealthStatus, PoolStatus, Status};

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a warning message
pub fn warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

/// Print a header
pub fn header(msg: &str) {
    println!("\n{}", msg.bold().underline());
}

/// Print a health check result with pool details
pub fn print_health(target: &str, health: &HealthStatus, pool: &PoolStatus) {
    header(&format!("Database: {}", target));

    let message = health.message.as_deref().unwrap_or("responding");
    match health.status {
        Status::Healthy => success(&format!("healthy ({} ms)", health.duration.as_millis())),
        Status::Degraded => warning(&format!("degraded: {}", message)),
        Status::Unhealthy => error(&format!("unhealthy: {}", message)),
    }

    println!();
    println!("  {} {:?}", "pool:".dimmed(), pool.status);
    println!(
        "  {} {} open, {} idle, {} in use",
        "connections:".dimmed(),
        pool.open_connections,
        pool.idle_connections,
        pool.in_use
    );
    println!(
        "  {} min {}, max {}",
        "limits:".dimmed(),
        pool.min_size,
        pool.max_size
    );
}

/// Print a progress spinner for long operations
pub struct Spinner {
    pb: indicatif::ProgressBar,
}

impl Spinner {
    pub fn new(msg: &str) -> Self {
        let pb = indicatif::ProgressBar::new_spinner();
        if let Ok(style) = indicatif::ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Self { pb }
    }

    pub fn finish_success(self, msg: &str) {
        self.pb.finish_and_clear();
        success(msg);
    }

    pub fn finish_error(self, msg: &str) {
        self.pb.finish_and_clear();
        error(msg);
    }
}

/// Print a JSON report
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}
