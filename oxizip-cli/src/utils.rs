//! Utility functions for the CLI.

use glob::Pattern;
use indicatif::{ProgressBar, ProgressStyle};
use oxizip_archive::{AlternateEncodingUsage, ReadOptions, TextEncoding, ZipEntry};

/// Create a progress bar with standard styling.
pub fn create_progress_bar(len: u64, enable: bool) -> ProgressBar {
    if !enable {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(len);
    match ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        Ok(style) => pb.set_style(style.progress_chars("█▓▒░ ")),
        Err(_) => pb.set_style(ProgressStyle::default_bar()),
    }
    pb
}

/// Check if a name matches the filter patterns.
/// - If include patterns are specified, the name must match at least one
/// - If exclude patterns are specified, the name must not match any
pub fn matches_filters(name: &str, include: &[String], exclude: &[String]) -> bool {
    let matches = |pattern: &String| Pattern::new(pattern).is_ok_and(|p| p.matches(name));

    if exclude.iter().any(matches) {
        return false;
    }
    include.is_empty() || include.iter().any(matches)
}

/// Entries whose names pass the include/exclude patterns.
pub fn filter_entries<'a>(
    entries: &'a [ZipEntry],
    include: &[String],
    exclude: &[String],
) -> Vec<&'a ZipEntry> {
    entries
        .iter()
        .filter(|e| matches_filters(e.name(), include, exclude))
        .collect()
}

/// Read options with an optional code page for legacy names.
pub fn read_options(
    password: Option<String>,
    encoding: Option<&str>,
) -> Result<ReadOptions, Box<dyn std::error::Error>> {
    let mut options = ReadOptions {
        password,
        ..ReadOptions::default()
    };
    if let Some(label) = encoding {
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or_else(|| format!("unknown encoding: {label}"))?;
        options = options.with_encoding(TextEncoding::new(encoding, AlternateEncodingUsage::Always));
    }
    Ok(options)
}

/// Parse a size such as `65536`, `64k`, `100m` or `2g`.
pub fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, 'k' | 'K')) => (&text[..i], 1024),
        Some((i, 'm' | 'M')) => (&text[..i], 1024 * 1024),
        Some((i, 'g' | 'G')) => (&text[..i], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid size: {text}"))
}

/// Space saved by compression, in percent.
pub fn savings(size: u64, compressed: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        (1.0 - compressed as f64 / size as f64) * 100.0
    }
}

/// Print entries in a formatted table.
pub fn print_entries(entries: &[&ZipEntry], verbose: bool) {
    if verbose {
        println!(
            "{:>10} {:>10} {:>6} {:>8} {:>16}  Name",
            "Size", "Compressed", "Ratio", "Method", "Modified",
        );
        println!("{}", "-".repeat(78));

        let mut total_size = 0u64;
        let mut total_compressed = 0u64;

        for entry in entries {
            let ratio = if entry.uncompressed_size() > 0 {
                format!(
                    "{:.1}%",
                    savings(entry.uncompressed_size(), entry.compressed_size())
                )
            } else {
                "-".to_string()
            };

            let type_prefix = if entry.is_directory() {
                "d "
            } else if entry.is_encrypted() {
                "* "
            } else {
                "  "
            };

            println!(
                "{:>10} {:>10} {:>6} {:>8} {:>16}  {}{}",
                entry.uncompressed_size(),
                entry.compressed_size(),
                ratio,
                entry.compression_method().name(),
                entry.modified().format("%Y-%m-%d %H:%M"),
                type_prefix,
                entry.name()
            );

            total_size += entry.uncompressed_size();
            total_compressed += entry.compressed_size();
        }

        println!("{}", "-".repeat(78));
        println!(
            "{:>10} {:>10} {:>5.1}%                            {} entries",
            total_size,
            total_compressed,
            savings(total_size, total_compressed),
            entries.len()
        );
    } else {
        for entry in entries {
            println!("{}", entry.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_filters() {
        let include = vec!["*.txt".to_string()];
        let exclude = vec!["secret*".to_string()];
        assert!(matches_filters("notes.txt", &include, &exclude));
        assert!(!matches_filters("secret.txt", &include, &exclude));
        assert!(!matches_filters("image.png", &include, &exclude));
        assert!(matches_filters("image.png", &[], &[]));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("65536"), Ok(65536));
        assert_eq!(parse_size("64k"), Ok(64 * 1024));
        assert_eq!(parse_size("100M"), Ok(100 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Ok(2 * 1024 * 1024 * 1024));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_savings() {
        assert_eq!(savings(0, 0), 0.0);
        assert!((savings(200, 50) - 75.0).abs() < f64::EPSILON);
    }
}
