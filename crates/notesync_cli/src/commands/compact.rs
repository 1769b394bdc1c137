//! Compact command implementation.

use std::path::Path;
use std::time::Duration;

/// Runs the compact command.
pub fn run(
    database: &Path,
    retention: Duration,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = super::open_offline(database, None)?;
    let engine = server.engine();

    println!("Compacting sync log at {:?}", database);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
    let boundary = engine.clock().now_millis().saturating_sub(retention_ms);

    if dry_run {
        let entries = engine.store().log_entries(None, 0, usize::MAX)?;
        let expired = entries.iter().filter(|e| e.timestamp < boundary).count();
        println!("Compaction Analysis:");
        println!("  Log entries:       {}", entries.len());
        println!("  Older than cutoff: {}", expired);
        println!("  Current floor:     {}", engine.store().log_floor()?);
        println!("  New floor:         {}", boundary);
        return Ok(());
    }

    let removed = engine.compact_log(retention)?;
    println!("✓ Removed {} log entries", removed);
    println!("  Devices with a watermark before {} will resync", boundary);
    Ok(())
}
