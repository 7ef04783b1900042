//! Host integrations behind the core's capability traits.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use fleetdiag_core::collector::{ChildOutputReader, JournalReader};
use fleetdiag_core::node::DiskUsage;
use tracing::warn;

/// Unit journal reader shelling out to `journalctl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JournalctlReader;

impl JournalReader for JournalctlReader {
    fn read_since(
        &self,
        unit: &str,
        since: Duration,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        let since_arg = format!("-{}s", since.as_secs());
        let child = Command::new("journalctl")
            .arg("--no-pager")
            .arg("-u")
            .arg(unit)
            .arg("--since")
            .arg(since_arg)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(Box::new(ChildOutputReader::new(child)))
    }
}

/// Disk-usage probe parsing `df --output=pcent`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DfDiskUsage;

impl DiskUsage for DfDiskUsage {
    fn used_percent(&self, path: &Path) -> Option<f64> {
        let output = Command::new("df")
            .arg("--output=pcent")
            .arg(path)
            .output()
            .ok()?;
        if !output.status.success() {
            warn!(path = %path.display(), "df probe failed");
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        // Second line is the value, e.g. " 42%".
        text.lines()
            .nth(1)
            .and_then(|line| line.trim().strip_suffix('%'))
            .and_then(|value| value.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_df_probe_reports_a_percentage_or_nothing() {
        // The probe must never panic, whatever the platform provides.
        let usage = DfDiskUsage.used_percent(Path::new("/"));
        if let Some(percent) = usage {
            assert!((0.0..=100.0).contains(&percent));
        }
    }
}
