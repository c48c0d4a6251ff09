//! Container log settings and the json-file entry format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How container output is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogDriver {
    /// `{id}-json.log` lines, one JSON object per output line.
    #[default]
    JsonFile,
    /// Output is discarded.
    None,
}

impl std::str::FromStr for LogDriver {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json-file" => Ok(Self::JsonFile),
            "none" => Ok(Self::None),
            _ => Err(format!("unknown log driver: '{}' (supported: json-file, none)", s)),
        }
    }
}

/// Log configuration shared by all containers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub driver: LogDriver,
    /// `max-size` (e.g. "10m") and `max-file` (e.g. "3").
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl LogConfig {
    /// Bytes written before the log file rotates. Defaults to 10 MiB.
    pub fn max_size(&self) -> u64 {
        self.options
            .get("max-size")
            .and_then(|s| parse_size(s).ok())
            .unwrap_or(10 * 1024 * 1024)
    }

    /// Rotated files kept besides the active one. Defaults to 3.
    pub fn max_file(&self) -> u32 {
        self.options
            .get("max-file")
            .and_then(|s| s.parse().ok())
            .unwrap_or(3)
    }
}

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The line, including its trailing newline.
    pub log: String,
    pub stream: LogStream,
    /// RFC 3339 with nanoseconds.
    pub time: String,
}

impl LogEntry {
    pub fn now(stream: LogStream, line: &str) -> Self {
        let mut log = line.to_string();
        if !log.ends_with('\n') {
            log.push('\n');
        }
        Self {
            log,
            stream,
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }
}

/// Parse "10m", "1g", "512k" or a plain byte count.
fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num, mult) = match s.chars().last() {
        Some('g') => (&s[..s.len() - 1], 1024u64 * 1024 * 1024),
        Some('m') => (&s[..s.len() - 1], 1024u64 * 1024),
        Some('k') => (&s[..s.len() - 1], 1024u64),
        _ => return Err(format!("unrecognized size format: {s}")),
    };
    let n: u64 = num.parse().map_err(|_| format!("invalid number: {num}"))?;
    Ok(n * mult)
}
