//! Run summary — the final report after a clone or phase command.
//!
//! Every failure during the run was already logged with task identity and
//! attempt count; the summary aggregates what happened and lists the
//! failed tasks one last time so the exit status is explainable from the
//! last screen of output.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;
use crate::config::format_size;
use crate::error::Result;

/// Outcome of a whole run, for the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
}

/// Print the final summary; returns `Failed` when any task failed.
pub fn print(catalog: &Arc<Catalog>, elapsed: Duration) -> Result<RunStatus> {
    let (bytes, rows) = catalog.copy_totals()?;
    let (blob_copied, blob_total) = catalog.blob_counts()?;

    println!();
    println!(
        "copied {} in {} rows in {}",
        format_size(bytes),
        rows,
        human_duration(elapsed)
    );
    if blob_total > 0 || blob_copied > 0 {
        println!("large objects: {blob_copied} copied");
    }

    let failed = catalog.failed_tasks()?;
    if failed.is_empty() {
        return Ok(RunStatus::Success);
    }

    println!("\n{} task(s) failed:", failed.len());
    for (kind, name, attempts, error) in &failed {
        println!("  {kind} {name} (attempts: {attempts}): {error}");
    }
    Ok(RunStatus::Failed)
}

/// `1h 02m 03s`-style rendering.
pub fn human_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        let millis = d.subsec_millis();
        if total == 0 && millis > 0 {
            format!("0.{millis:03}s")
        } else {
            format!("{seconds}s")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(Duration::from_secs(3723)), "1h 02m 03s");
        assert_eq!(human_duration(Duration::from_secs(83)), "1m 23s");
        assert_eq!(human_duration(Duration::from_secs(9)), "9s");
        assert_eq!(human_duration(Duration::from_millis(42)), "0.042s");
    }
}
