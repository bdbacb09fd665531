//! Create and balance commands.

use std::path::Path;
use strata_core::{BalanceReport, Options, Strata};

/// Runs the create command.
pub fn create(path: &Path, options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::create(path, options)?;
    println!("Created tree at {}", path.display());
    tree.close()?;
    Ok(())
}

/// Runs the balance command.
pub fn balance(path: &Path, options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let tree = Strata::open(path, options)?;
    let report = tree.balance()?;
    print_report(&report);
    tree.close()?;
    Ok(())
}

pub(crate) fn print_report(report: &BalanceReport) {
    if report.is_empty() && report.unsplittable == 0 {
        println!("Tree already balanced");
        return;
    }
    println!("Balance:");
    println!("  Leaf splits:     {}", report.splits);
    println!("  Leaf merges:     {}", report.merges);
    println!("  Exorcisms:       {}", report.exorcisms);
    println!("  Branch splits:   {}", report.branch_splits);
    println!("  Branch merges:   {}", report.branch_merges);
    println!("  Root drains:     {}", report.root_drains);
    println!("  Root fills:      {}", report.root_fills);
    if report.unsplittable > 0 {
        println!("  Unsplittable:    {}", report.unsplittable);
    }
}
