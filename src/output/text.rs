//! Human-readable text output

use super::RunReport;
use crate::postprocess::DeviceSummary;
use crate::util::time::{format_energy, format_power, format_seconds, format_value};
use std::fmt::Write;

const RULE: &str = "═══════════════════════════════════════════════════════════";

/// Render a report as text
///
/// Layout: banner, run header, one block per rank, totals.
pub fn render(report: &RunReport) -> String {
    let mut out = String::new();

    // Writing into a String cannot fail
    let _ = write_report(&mut out, report);
    out
}

fn write_report(out: &mut String, report: &RunReport) -> std::fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "                    ENERGY REPORT")?;
    writeln!(out, "{}", RULE)?;
    writeln!(out)?;
    writeln!(out, "Experiment: {}", report.experiment)?;
    writeln!(out, "Run:        {}", report.run_id)?;
    writeln!(out, "Created:    {}", report.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
    writeln!(out, "Ranks:      {}", report.world_size)?;
    writeln!(out)?;

    for rank in &report.ranks {
        writeln!(out, "Rank {} ({}):", rank.rank, rank.hostname)?;

        let Some(summary) = &rank.data else {
            writeln!(out, "  no devices")?;
            writeln!(out)?;
            continue;
        };

        writeln!(out, "  Sampled for {}", format_seconds(summary.duration_s))?;
        for device in &summary.devices {
            write_device(out, device)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "Totals:")?;
    writeln!(out, "  Devices:  {}", report.totals.devices)?;
    writeln!(out, "  Energy:   {}", format_energy(report.totals.energy_j))?;
    writeln!(out, "  Duration: {}", format_seconds(report.totals.duration_s))?;
    writeln!(out, "{}", RULE)?;
    Ok(())
}

fn write_device(out: &mut String, device: &DeviceSummary) -> std::fmt::Result {
    writeln!(out, "  {} [{}]", device.device, device.description)?;
    write!(out, "    samples: {}", device.samples)?;
    if device.errors > 0 {
        write!(out, " ({} errors)", device.errors)?;
    }
    writeln!(out)?;

    if let Some(energy) = device.energy_j {
        write!(out, "    energy:  {}", format_energy(energy))?;
        if let Some(power) = device.avg_power_w {
            write!(out, " (avg {})", format_power(power))?;
        }
        writeln!(out)?;
    } else if let (Some(min), Some(mean), Some(max)) = (device.min, device.mean, device.max) {
        writeln!(
            out,
            "    min/mean/max: {} / {} / {}",
            format_value(device.kind, min),
            format_value(device.kind, mean),
            format_value(device.kind, max)
        )?;
    } else {
        writeln!(out, "    no readings")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::sample_storage;
    use crate::output::{build_report, RankReport};

    #[test]
    fn test_text_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = sample_storage(tmp.path());
        let mut report = build_report(&storage, None).unwrap();
        report.ranks.push(RankReport {
            rank: 1,
            hostname: "node-a".to_string(),
            data: None,
        });

        let text = render(&report);
        assert!(text.starts_with(RULE));
        assert!(text.contains("Experiment: bench"));
        assert!(text.contains("mock:dev0 [package]"));
        assert!(text.contains("energy:  25.00 J (avg 25.00 W)"));
        assert!(text.contains("Rank 1 (node-a):\n  no devices"));
    }
}
