//! Human-readable formatting for byte counts in status logs

/// Formats a byte count to a human-readable string with binary units.
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0.0 {
        return "0B".to_string();
    }

    let mut size = bytes.abs();
    let mut unit_index = 0;

    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    let sign = if bytes < 0.0 { "-" } else { "" };

    if unit_index == 0 {
        format!("{}{:.0}{}", sign, size, UNITS[unit_index])
    } else if size >= 10.0 {
        format!("{}{:.1}{}", sign, size, UNITS[unit_index])
    } else {
        format!("{}{:.2}{}", sign, size, UNITS[unit_index])
    }
}

/// Formats a bitrate in bits per second.
pub fn format_bitrate(bits_per_sec: f64) -> String {
    const UNITS: &[&str] = &["bps", "kbps", "Mbps", "Gbps"];
    const THRESHOLD: f64 = 1000.0;

    let mut rate = bits_per_sec.max(0.0);
    let mut unit_index = 0;

    while rate >= THRESHOLD && unit_index < UNITS.len() - 1 {
        rate /= THRESHOLD;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{:.0}{}", rate, UNITS[unit_index])
    } else {
        format!("{:.1}{}", rate, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_picks_units() {
        assert_eq!(format_bytes(0.0), "0B");
        assert_eq!(format_bytes(512.0), "512B");
        assert_eq!(format_bytes(2048.0), "2.00KB");
        assert_eq!(format_bytes(5.0 * 1024.0 * 1024.0), "5.00MB");
        assert_eq!(format_bytes(50.0 * 1024.0 * 1024.0), "50.0MB");
    }

    #[test]
    fn format_bitrate_picks_units() {
        assert_eq!(format_bitrate(800.0), "800bps");
        assert_eq!(format_bitrate(3_000_000.0), "3.0Mbps");
    }
}
