use std::process::ExitCode;

use anyhow::{Context, Result};
use ariane_core::config::ArianeConfig;

/// Validates one or more ariane config documents, then their
/// left-to-right merge. Diagnostics go to stderr; exit 1 on any error.
fn main() -> ExitCode {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("Usage: ariane-lint <ariane-config.yaml> [ariane-config-enterprise.yaml ...]");
        return ExitCode::FAILURE;
    }

    let mut has_errors = false;
    let mut configs = Vec::new();

    for path in &paths {
        match parse_and_validate(path) {
            Ok(config) => {
                configs.push(config);
                println!("OK [{path}]: valid ariane config");
            }
            Err(err) => {
                eprintln!("ERROR [{path}]: {err:#}");
                has_errors = true;
            }
        }
    }

    // a multi-document invocation also validates the merged result
    if configs.len() > 1 {
        let mut merged = configs[0].clone();
        for config in &configs[1..] {
            merged = merged.merge(config);
        }
        let errs = merged.validate();
        if errs.is_empty() {
            println!("OK [merged config]: valid after merge");
        } else {
            eprintln!("ERROR [merged config]:");
            for err in errs {
                eprintln!("  - {err}");
            }
            has_errors = true;
        }
    }

    if has_errors {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn parse_and_validate(path: &str) -> Result<ArianeConfig> {
    let doc = std::fs::read_to_string(path).context("failed to read file")?;
    let config = ArianeConfig::parse(&doc)?;

    let errs = config.validate();
    if !errs.is_empty() {
        for err in &errs {
            eprintln!("- {err}");
        }
        anyhow::bail!("validation failed with {} error(s)", errs.len());
    }
    Ok(config)
}
