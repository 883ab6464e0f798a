use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

const DEFAULT_FILENAME: &str = "download.bin";
const MAX_FILENAME_LENGTH: usize = 200;
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Replaces characters that are illegal on common filesystems and caps the
/// length so the name can be used as-is under any destination directory.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if ILLEGAL_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim().trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return DEFAULT_FILENAME.to_string();
    }
    if trimmed.chars().count() <= MAX_FILENAME_LENGTH {
        return trimmed.to_string();
    }

    // keep the extension when truncating
    let (stem, ext) = split_extension(trimmed);
    let ext_len = ext.map(|e| e.chars().count() + 1).unwrap_or(0);
    let stem: String = stem
        .chars()
        .take(MAX_FILENAME_LENGTH.saturating_sub(ext_len))
        .collect();
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

/// Picks `dir/name`, or `dir/name (n).ext` when that path already exists on
/// disk or has been handed out to another task in `taken`.
pub fn unique_destination(dir: &Path, name: &str, taken: &HashSet<PathBuf>) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() && !taken.contains(&candidate) {
        return candidate;
    }
    let (stem, ext) = split_extension(name);
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|path| !path.exists() && !taken.contains(path))
        .unwrap_or(candidate)
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("failed to read current directory")?;
    Ok(cwd.join(path))
}

pub fn parse_bandwidth_limit(input: &str) -> Result<u64> {
    let normalized = input
        .trim()
        .trim_end_matches("/s")
        .trim_end_matches("ps")
        .trim();
    if normalized.is_empty() {
        return Err(anyhow!("bandwidth limit cannot be empty"));
    }

    let split = normalized
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(normalized.len());
    let (number_part, suffix_part) = normalized.split_at(split);

    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid numeric value in bandwidth limit: {normalized}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" => 1.0,
        "k" | "kb" => 1_000.0,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1_000_000.0,
        "mi" | "mib" => 1_048_576.0,
        "g" | "gb" => 1_000_000_000.0,
        "gi" | "gib" => 1_073_741_824.0,
        other => return Err(anyhow!("unsupported bandwidth suffix: {other}")),
    };

    let bytes_per_sec = (value * multiplier).round();
    if bytes_per_sec <= 0.0 {
        return Err(anyhow!("bandwidth limit must be positive"));
    }
    Ok(bytes_per_sec as u64)
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value as f64;
    let mut unit = 0usize;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, UNITS[unit])
    } else {
        format!("{val:.2} {}", UNITS[unit])
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    if !bytes_per_sec.is_finite() || bytes_per_sec <= 0.0 {
        return "0 B/s".to_string();
    }
    format!("{}/s", format_bytes(bytes_per_sec.round() as u64))
}

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_filename("a/b:c*?.mp4"), "a_b_c__.mp4");
        assert_eq!(sanitize_filename("  trailing dots... "), "trailing dots");
        assert_eq!(sanitize_filename("???"), "___");
        assert_eq!(sanitize_filename("   "), DEFAULT_FILENAME);
    }

    #[test]
    fn sanitize_truncates_but_keeps_extension() {
        let long = format!("{}.mkv", "x".repeat(400));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.chars().count(), MAX_FILENAME_LENGTH);
        assert!(sanitized.ends_with(".mkv"));
    }

    #[test]
    fn unique_destination_skips_taken_and_existing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("clip.mp4"), b"x").unwrap();
        let mut taken = HashSet::new();
        taken.insert(dir.path().join("clip (1).mp4"));

        let picked = unique_destination(dir.path(), "clip.mp4", &taken);
        assert_eq!(picked, dir.path().join("clip (2).mp4"));

        let fresh = unique_destination(dir.path(), "other", &taken);
        assert_eq!(fresh, dir.path().join("other"));
    }

    #[test]
    fn parses_bandwidth_suffixes() {
        assert_eq!(parse_bandwidth_limit("50M/s").unwrap(), 50_000_000);
        assert_eq!(parse_bandwidth_limit("1.5MiB").unwrap(), 1_572_864);
        assert_eq!(parse_bandwidth_limit("512").unwrap(), 512);
        assert!(parse_bandwidth_limit("12 parsecs").is_err());
        assert!(parse_bandwidth_limit("0").is_err());
    }

    #[test]
    fn formats_speed_labels() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1536.0), "1.50 KiB/s");
    }
}
