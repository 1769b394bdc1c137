//! Verify command implementation.

use notesync_server::VerifyReport;
use std::path::{Path, PathBuf};

/// Runs the verify command.
pub fn run(
    database: &Path,
    content_dir: Option<&PathBuf>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = super::open_offline(database, content_dir)?;
    let report = server.engine().verify()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Verifying database at {:?}", database);
        if content_dir.is_none() {
            println!("(no content directory given - attachment bytes will show as missing)");
        }
        println!();
        print_report(&report);
        println!();
    }

    if report.is_clean() {
        if format != "json" {
            println!("✓ Verification passed");
        }
        Ok(())
    } else {
        if format != "json" {
            println!("✗ Verification failed");
        }
        Err("Verification failed".into())
    }
}

fn print_report(report: &VerifyReport) {
    println!("  Entities checked: {}", report.entities);
    print_section("Note hash mismatches", &report.hash_mismatches);
    print_section("Attachments missing content", &report.missing_content);
    print_section("Orphaned content objects", &report.orphaned_objects);
}

fn print_section(name: &str, items: &[String]) {
    println!("  {}: {}", name, items.len());
    for item in items {
        println!("    ERROR: {}", item);
    }
}
