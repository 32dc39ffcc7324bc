//! Misc. helper functions

/// Number of CPU cores usable by this process, at least 1.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Formats a byte count with a binary unit suffix, e.g. `600.0 MiB`.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Decodes (lossily) at most the last `limit` bytes of `buf`, trimmed.
pub fn tail_utf8_lossy(buf: &[u8], limit: usize) -> String {
    let start = buf.len().saturating_sub(limit);
    let text = String::from_utf8_lossy(&buf[start..]);
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(600 * 1024 * 1024), "600.0 MiB");
    }

    #[test]
    fn test_tail_utf8_lossy() {
        assert_eq!(tail_utf8_lossy(b"  hello world\n", 100), "hello world");
        assert_eq!(tail_utf8_lossy(b"abcdef", 3), "def");
        assert!(available_cores() >= 1);
    }
}
