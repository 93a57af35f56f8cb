//! `fleet ap-test`: run the access point check and print the report.

use std::path::Path;

use anyhow::{Context, Result};
use fleet_core::Settings;
use fleet_health::{AccessPoint, AccessPointChecker};

pub fn check(settings: &Settings, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("read {}", file.display()))?;
    let ap: AccessPoint = serde_json::from_str(&content)
        .with_context(|| format!("parse access point {}", file.display()))?;

    let checker = AccessPointChecker::new(settings.probe.clone());
    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(checker.check(&ap))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.ok {
        std::process::exit(1);
    }
    Ok(())
}
