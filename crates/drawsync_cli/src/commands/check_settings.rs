//! Check-settings command implementation.

use drawsync_engine::SyncSettings;
use serde::Serialize;
use std::path::Path;

/// Result of a settings check.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Checked file.
    pub path: String,
    /// Parsed settings, with defaults filled in.
    pub settings: SyncSettings,
    /// Seconds between periodic syncs.
    pub interval_secs: u64,
}

/// Loads and validates a settings file.
pub fn check(path: &Path) -> Result<CheckResult, Box<dyn std::error::Error>> {
    let settings = SyncSettings::load(path)?;
    Ok(CheckResult {
        path: path.display().to_string(),
        interval_secs: settings.interval().as_secs(),
        settings,
    })
}

/// Runs the check-settings command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = check(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &CheckResult) {
    let settings = &result.settings;
    println!("Settings OK: {}", result.path);
    println!("  Auto sync:         {}", settings.auto_sync);
    println!(
        "  Interval:          {} min ({}s)",
        settings.sync_interval_minutes, result.interval_secs
    );
    println!(
        "  Conflict policy:   {}",
        settings.conflict_resolution_policy
    );
    println!("  Wi-Fi only:        {}", settings.sync_only_on_wifi);
    println!("  Background sync:   {}", settings.background_sync);
}
