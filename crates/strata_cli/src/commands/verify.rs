//! Verify command implementation.

use std::path::Path;
use strata_core::page::Page;
use strata_core::{log, Address, CoreError, Options, TreeDir};
use strata_storage::PageStore;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of pages checked.
    pub pages_checked: usize,
    /// Number of pages that read and replayed cleanly.
    pub valid_pages: usize,
    /// Number of pages that failed.
    pub corrupt_pages: usize,
    /// Live records across valid leaves.
    pub records: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.corrupt_pages == 0 && self.errors.is_empty()
    }
}

/// Reads and replays every page in the store.
pub fn verify_store(store: &PageStore, options: &Options) -> VerifyResult {
    let mut result = VerifyResult::default();
    let extract = |record: &[u8]| options.extract(record);

    for address in [Address::ROOT, Address::LEFTMOST] {
        if store.version(address.as_u64()).is_none() {
            result.errors.push(format!("page {address} is missing"));
        }
    }

    for address in store.addresses().into_iter().map(Address) {
        result.pages_checked += 1;
        let page = store
            .read_page(address.as_u64())
            .map_err(CoreError::from)
            .and_then(|page_log| log::replay(address, &page_log.lines, &extract));
        match page {
            Ok(Page::Leaf(leaf)) => {
                result.valid_pages += 1;
                result.records += leaf.live_len();
            }
            Ok(Page::Branch(_)) => result.valid_pages += 1,
            Err(e) => {
                result.corrupt_pages += 1;
                result.errors.push(format!("page {address}: {e}"));
            }
        }
    }
    result
}

/// Runs the verify command.
pub fn run(path: &Path, options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying tree at {}", path.display());
    println!();

    let _dir = TreeDir::lock(path, false)?;
    let store = PageStore::open(path, options.store_config())?;
    let result = verify_store(&store, options);

    println!("  Pages checked:   {}", result.pages_checked);
    println!("  Valid pages:     {}", result.valid_pages);
    println!("  Corrupt pages:   {}", result.corrupt_pages);
    println!("  Live records:    {}", result.records);
    for error in &result.errors {
        println!("    - {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Tree verification passed");
        Ok(())
    } else {
        println!("✗ Tree verification failed");
        Err("Verification failed".into())
    }
}
