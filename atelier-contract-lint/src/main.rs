use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use atelier_contract_lint::Allowlist;
use atelier_contract_lint::ContractLinter;

/// Scans the workspace source for tenant-safety, bracketed-disjunction
/// and authorization-contract violations. Non-empty findings fail CI.
#[derive(Parser)]
#[command(name = "atelier-contract-lint", version)]
struct Args {
    /// Workspace root to scan.
    #[arg(default_value = ".")]
    root: PathBuf,

    /// TOML allowlist keyed by file path and scope.
    #[arg(long)]
    allowlist: Option<PathBuf>,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let allowlist = match &args.allowlist {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Allowlist::from_toml(&raw).context("failed to parse allowlist")?
        }
        None => Allowlist::default(),
    };

    let report = ContractLinter::new(&args.root)
        .with_allowlist(allowlist)
        .scan()
        .context("scan failed")?;

    print!("{}", report.render());
    if report.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
