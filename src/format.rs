const UNITS: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Format a byte length with 1024-based units, e.g. `1.50MB`.
pub fn file_length(length: u64, digits: usize) -> String {
    let mut value = length as f64;
    let mut unit = 0;
    while unit + 1 < UNITS.len() && value > 1024.0 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.*}{}", digits, value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::file_length;

    #[test]
    fn picks_largest_unit_above_one_kibibyte() {
        assert_eq!(file_length(512, 2), "512.00B");
        assert_eq!(file_length(1024, 0), "1024B");
        assert_eq!(file_length(1536, 2), "1.50KB");
        assert_eq!(file_length(3 * 1024 * 1024 * 1024, 1), "3.0GB");
    }
}
