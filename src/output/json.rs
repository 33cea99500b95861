//! JSON report output

use super::RunReport;
use crate::Result;
use anyhow::Context;

/// Render a report as pretty-printed JSON
pub fn render(report: &RunReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("Failed to serialize report to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::sample_storage;
    use crate::output::build_report;

    #[test]
    fn test_json_contains_run_data() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = sample_storage(tmp.path());
        let report = build_report(&storage, None).unwrap();

        let value: serde_json::Value = serde_json::from_str(&render(&report).unwrap()).unwrap();
        assert_eq!(value["experiment"], "bench");
        assert_eq!(value["run_id"], 0);
        assert_eq!(value["ranks"][0]["hostname"], "node-a");
        assert_eq!(value["ranks"][0]["data"]["devices"][0]["device"]["device"], "dev0");
        assert_eq!(value["totals"]["energy_j"], 25.0);
    }
}
