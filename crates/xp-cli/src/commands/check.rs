use std::io::{BufRead, Write};
use std::sync::Arc;

use xp_config::XpConfig;
use xp_core::ExperimentStore;
use xp_worker::{AlwaysConfirm, CheckReport, Checker, Confirm};

use super::join_ids;

/// Asks on the terminal before resetting anything.
struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, report: &CheckReport) -> bool {
        print!("Reset {} bad experiments to fresh? [y/N] ", report.bad.len());
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Never confirms.
struct Decline;

impl Confirm for Decline {
    fn confirm(&self, _report: &CheckReport) -> bool {
        false
    }
}

pub async fn run(
    store: Arc<dyn ExperimentStore>,
    config: &XpConfig,
    yes: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let checker = Checker::new(store, config.checker.clone());
    let report = checker.scan().await?;

    println!("Consistency check");
    println!("=================");
    println!("Good:       {}", report.good.len());
    println!("Unique:     {}", report.unique);
    println!("Bad:        {}", report.bad.len());
    for bad in &report.bad {
        println!("  {}: {}", bad.trace_id, bad.reason);
    }
    println!("Suspicious: {}", report.suspicious.len());
    for pair in &report.suspicious {
        println!(
            "  {} and {} ({} jobs)",
            pair.first, pair.second, pair.job_count
        );
    }

    if report.bad.is_empty() {
        return Ok(());
    }

    let confirm: &dyn Confirm = if dry_run {
        &Decline
    } else if yes {
        &AlwaysConfirm
    } else {
        &Prompt
    };
    let repaired = checker.repair(&report, confirm).await?;
    if repaired.is_empty() {
        println!("No experiments reset");
    } else {
        println!("Reset to fresh: {}", join_ids(&repaired));
    }
    Ok(())
}
