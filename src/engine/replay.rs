use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::info;

use super::controller::SessionStats;
use super::error::PipelineError;
use super::pipeline::Session;
use crate::config::EngineConfig;

/// Feed request lines through a fresh session, writing one response line per
/// non-blank input line. Lines that are not UTF-8 get an error response.
pub fn replay<R: BufRead, W: Write>(config: &EngineConfig, mut reader: R, mut writer: W) -> Result<SessionStats> {
    let mut session = Session::new(config);
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        line_no += 1;
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("failed to read line {}", line_no))?;
        if n == 0 {
            break;
        }

        let response = match std::str::from_utf8(&buf) {
            Ok(line) => session.process_line(line),
            Err(e) => Some(session.reject(&PipelineError::MalformedInput(e.to_string()))),
        };
        if let Some(response) = response {
            writer.write_all(response.to_line()?.as_bytes())?;
        }
    }
    writer.flush()?;

    let stats = session.stats().clone();
    stats.log_summary();
    Ok(stats)
}

pub fn replay_file(config: &EngineConfig, path: impl AsRef<Path>, writer: impl Write) -> Result<SessionStats> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open replay file {}", path.display()))?;
    info!("Replaying bars from {}", path.display());
    replay(config, BufReader::new(file), writer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_writes_one_line_per_request() {
        let input = concat!(
            r#"{"bar": {"open": 1, "high": 2, "low": 0.5, "close": 1.5}}"#,
            "\n\n",
            r#"{"bar": {"open": 1.5, "high": 2, "low": 1, "close": 1.8}}"#,
            "\n",
            "not json\n",
        );
        let mut out = Vec::new();
        let stats = replay(&EngineConfig::default(), input.as_bytes(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("warmup|reject_low_prob"));
        assert!(lines[2].contains("\"reason\":\"error:"));
        assert_eq!(stats.bars, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_invalid_utf8_line_gets_error_and_replay_continues() {
        let mut input = Vec::new();
        input.extend_from_slice(br#"{"bar": {"open": 1, "high": 2, "low": 0.5, "close": 1.5}}"#);
        input.push(b'\n');
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        input.extend_from_slice(br#"{"bar": {"open": 1.5, "high": 2, "low": 1, "close": 1.8}}"#);

        let mut out = Vec::new();
        let stats = replay(&EngineConfig::default(), input.as_slice(), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("\"reason\":\"error:malformed input"));
        assert!(!lines[2].contains("error:"));
        assert_eq!(stats.bars, 2);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let input: String = (0..400)
            .map(|t| {
                let c = 100.0 + ((t * 37) % 17) as f64 * 0.1;
                format!("{{\"bar\": {{\"open\": {c}, \"high\": {}, \"low\": {}, \"close\": {c}}}}}\n", c + 0.2, c - 0.2)
            })
            .collect();

        let mut first = Vec::new();
        let mut second = Vec::new();
        replay(&EngineConfig::default(), input.as_bytes(), &mut first).unwrap();
        replay(&EngineConfig::default(), input.as_bytes(), &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = replay_file(&EngineConfig::default(), "/nonexistent/bars.jsonl", Vec::new());
        assert!(result.is_err());
    }
}
