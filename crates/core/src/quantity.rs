//! Minimal storage quantity parsing ("10Gi", "500M", "1.5Ti") for expansion checks.

pub fn parse_bytes(q: &str) -> Option<f64> {
    let q = q.trim();
    let split = q.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(q.len());
    let (num, suffix) = q.split_at(split);
    let n: f64 = num.parse().ok()?;
    let mult = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => return None,
    };
    Some(n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_and_decimal_suffixes() {
        assert_eq!(parse_bytes("1Ki"), Some(1024.0));
        assert_eq!(parse_bytes("2G"), Some(2e9));
        assert!(parse_bytes("10Gi").unwrap() > parse_bytes("10G").unwrap());
        assert_eq!(parse_bytes("1.5Ki"), Some(1536.0));
        assert_eq!(parse_bytes("12Xi"), None);
        assert_eq!(parse_bytes(""), None);
    }
}
