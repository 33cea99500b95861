//! Human-readable formatting of durations and measured quantities
//!
//! Used by the text report and the `sensors` listing.

use crate::backend::MetricKind;
use std::time::Duration;

/// Format a duration in human-readable form
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use powerpulse::util::time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(5)), "5.00s");
/// assert_eq!(format_duration(Duration::from_secs(150)), "2m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();

    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}us", nanos as f64 / 1_000.0)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1_000_000.0)
    } else if duration.as_secs() < 60 {
        format!("{:.2}s", nanos as f64 / 1_000_000_000.0)
    } else {
        let secs = duration.as_secs();
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Format seconds (as stored in result buffers) like `format_duration`
pub fn format_seconds(seconds: f64) -> String {
    match Duration::try_from_secs_f64(seconds) {
        Ok(d) => format_duration(d),
        Err(_) => format!("{}s", seconds),
    }
}

/// Format an energy in joules (J, kJ, MJ)
///
/// ```
/// use powerpulse::util::time::format_energy;
///
/// assert_eq!(format_energy(12.5), "12.50 J");
/// assert_eq!(format_energy(2_500.0), "2.50 kJ");
/// ```
pub fn format_energy(joules: f64) -> String {
    let abs = joules.abs();
    if abs >= 1_000_000.0 {
        format!("{:.2} MJ", joules / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.2} kJ", joules / 1_000.0)
    } else {
        format!("{:.2} J", joules)
    }
}

/// Format a power in watts (mW, W, kW)
pub fn format_power(watts: f64) -> String {
    let abs = watts.abs();
    if abs >= 1_000.0 {
        format!("{:.2} kW", watts / 1_000.0)
    } else if abs > 0.0 && abs < 1.0 {
        format!("{:.1} mW", watts * 1_000.0)
    } else {
        format!("{:.2} W", watts)
    }
}

/// Format a byte count (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    if bytes >= TB {
        format!("{:.2} TB", bytes / TB)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes / GB)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes / MB)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes / KB)
    } else {
        format!("{:.0} B", bytes)
    }
}

/// Format a reading in the unit of its metric kind
pub fn format_value(kind: MetricKind, value: f64) -> String {
    match kind {
        MetricKind::Energy => format_energy(value),
        MetricKind::Power => format_power(value),
        MetricKind::Memory => format_bytes(value),
        MetricKind::Utilization => format!("{:.1}%", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50us");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(61)), "1m 1s");
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(1.5), "1.50s");
        assert_eq!(format_seconds(-1.0), "-1s");
    }

    #[test]
    fn test_format_energy() {
        assert_eq!(format_energy(0.5), "0.50 J");
        assert_eq!(format_energy(1_500.0), "1.50 kJ");
        assert_eq!(format_energy(3_000_000.0), "3.00 MJ");
    }

    #[test]
    fn test_format_power() {
        assert_eq!(format_power(0.25), "250.0 mW");
        assert_eq!(format_power(42.0), "42.00 W");
        assert_eq!(format_power(1_200.0), "1.20 kW");
        assert_eq!(format_power(0.0), "0.00 W");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500.0), "500 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_bytes(1536.0 * 1024.0 * 1024.0), "1.50 GB");
    }

    #[test]
    fn test_format_value_by_kind() {
        assert_eq!(format_value(MetricKind::Utilization, 12.34), "12.3%");
        assert_eq!(format_value(MetricKind::Energy, 10.0), "10.00 J");
    }
}
