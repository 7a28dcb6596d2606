//! Offline ledger file verifier
//!
//! Streams one or more ledger files and re-derives every hash and link:
//! transaction hashes and prevHash chains (including the v1→v2 bridge),
//! Merkle roots, header hashes, height monotonicity, prevHeaderHash
//! links, and recorded block sizes against actual line lengths.
//!
//! Usage:
//!   ledger_verify <file> [<file>...]
//!
//! Exits 0 when every file verifies, 1 on the first mismatch (the error
//! names the offending line).

#![forbid(unsafe_code)]

use std::path::Path;

use nrgchamp::blockstore::verify_file;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!("usage: ledger_verify <ledger-file> [<ledger-file>...]");
        std::process::exit(2);
    }

    let mut failed = false;
    for arg in &args {
        let path = Path::new(arg);
        match verify_file(path) {
            Ok(summary) => {
                eprintln!(
                    "✓ {}: {} line(s), {} v1 event(s), {} block(s), {} transaction(s)",
                    path.display(),
                    summary.lines,
                    summary.v1_events,
                    summary.blocks,
                    summary.transactions,
                );
                if !summary.last_tx_hash.is_empty() {
                    eprintln!("  tail tx hash    {}", summary.last_tx_hash);
                }
                if !summary.prev_header_hash.is_empty() {
                    eprintln!("  tail header     {}", summary.prev_header_hash);
                }
                eprintln!("  next height     {}", summary.next_height);
            }
            Err(e) => {
                eprintln!("✗ {}: {e}", path.display());
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
