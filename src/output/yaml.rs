//! YAML report output

use super::RunReport;
use crate::Result;
use anyhow::Context;

/// Render a report as YAML
pub fn render(report: &RunReport) -> Result<String> {
    serde_yaml::to_string(report).context("Failed to serialize report to YAML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::sample_storage;
    use crate::output::build_report;

    #[test]
    fn test_yaml_parses_back() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = sample_storage(tmp.path());
        let report = build_report(&storage, None).unwrap();

        let yaml = render(&report).unwrap();
        assert!(yaml.contains("experiment: bench"));

        let parsed: RunReport = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, report);
    }
}
