//! One-shot chain verification. Prints the report as JSON and exits nonzero
//! on any invariant breach, for cron or operator use.

use anyhow::Result;

use agon::audit::Auditor;
use agon::config::Config;
use agon::ledger::LedgerStore;

fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = LedgerStore::open(&cfg.sqlite_path)?;
    store.init()?;

    let report = Auditor::verify(&store)?;
    println!("{}", report.to_json());

    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
