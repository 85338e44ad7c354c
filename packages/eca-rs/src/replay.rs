//! Replay of recorded JSON-lines files as event streams.
//!
//! Each line of the source is one JSON record. When a timestamp field is
//! configured, the gaps between consecutive records are reproduced, divided by
//! `time_factor`, so a day of recorded traffic can be replayed in minutes.
//! Lines that are not valid JSON, or whose timestamp cannot be parsed, are
//! logged and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{EcaError, Result};
use crate::generator::{start_generator, EventGenerator, StopSignal};

/// How a recording is replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOptions {
    /// Speed-up applied to recorded gaps. `None` replays as fast as possible.
    pub time_factor: Option<f64>,
    /// Field holding each record's timestamp. Without it nothing is delayed.
    pub timestamp_field: Option<String>,
    /// `chrono` format of the timestamp. `None` means RFC 3339. Numeric
    /// fields are always read as Unix seconds.
    pub timestamp_format: Option<String>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            time_factor: Some(1000.0),
            timestamp_field: None,
            timestamp_format: None,
        }
    }
}

impl ReplayOptions {
    /// Replay without delays.
    pub fn immediate() -> Self {
        Self {
            time_factor: None,
            ..Self::default()
        }
    }

    /// Read timestamps from `field`.
    pub fn with_timestamp(mut self, field: impl Into<String>, format: Option<&str>) -> Self {
        self.timestamp_field = Some(field.into());
        self.timestamp_format = format.map(str::to_string);
        self
    }

    /// Set the speed-up factor.
    pub fn with_time_factor(mut self, factor: f64) -> Self {
        self.time_factor = Some(factor);
        self
    }
}

/// An opened recording, ready to be replayed.
#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl ReplaySource {
    /// Open a JSON-lines file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| EcaError::ReplayOpen {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
        })
    }

    /// Turn the source into a payload iterator honoring `stop`.
    pub fn replay(self, stop: StopSignal, options: ReplayOptions) -> JsonLines {
        JsonLines {
            source: self,
            stop,
            options,
            line: 0,
            last_time: None,
        }
    }
}

/// Open `path` and replay it. See [`ReplaySource::replay`].
pub fn json_lines(stop: StopSignal, path: impl AsRef<Path>, options: ReplayOptions) -> Result<JsonLines> {
    Ok(ReplaySource::open(path)?.replay(stop, options))
}

/// Iterator over the records of a recording.
#[derive(Debug)]
pub struct JsonLines {
    source: ReplaySource,
    stop: StopSignal,
    options: ReplayOptions,
    line: usize,
    last_time: Option<DateTime<FixedOffset>>,
}

impl JsonLines {
    fn timestamp(&self, record: &Value, field: &str) -> std::result::Result<DateTime<FixedOffset>, String> {
        match record.get(field) {
            Some(Value::String(text)) => {
                let parsed = match &self.options.timestamp_format {
                    Some(format) => DateTime::parse_from_str(text, format),
                    None => DateTime::parse_from_rfc3339(text),
                };
                parsed.map_err(|e| e.to_string())
            }
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(|t| t.fixed_offset())
                .ok_or_else(|| format!("{n} is not a valid Unix timestamp")),
            Some(other) => Err(format!("unsupported timestamp {other}")),
            None => Err(format!("missing field '{field}'")),
        }
    }

    /// Sleep for the scaled gap.
    fn pace(&self, gap: Duration) -> Pace {
        let delay = match self.options.time_factor {
            Some(factor) if factor > 0.0 => {
                match Duration::try_from_secs_f64(gap.as_secs_f64() / factor) {
                    Ok(delay) => delay,
                    Err(e) => {
                        error!(
                            path = %self.source.path.display(),
                            line = self.line,
                            recorded_secs = gap.as_secs_f64(),
                            time_factor = factor,
                            error = %e,
                            "scaled delay out of range, skipping record"
                        );
                        return Pace::Skip;
                    }
                }
            }
            _ => Duration::ZERO,
        };

        let stopped = if delay.is_zero() {
            self.stop.is_set()
        } else {
            debug!(
                recorded_ms = gap.as_millis() as u64,
                delay_ms = delay.as_millis() as u64,
                "delaying next record"
            );
            self.stop.wait(delay)
        };
        if stopped {
            Pace::Stop
        } else {
            Pace::Deliver
        }
    }
}

/// Outcome of waiting out a recorded gap.
enum Pace {
    Deliver,
    Skip,
    Stop,
}

impl Iterator for JsonLines {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let line = match self.source.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    error!(path = %self.source.path.display(), error = %e, "failed to read replay source");
                    return None;
                }
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }

            let record: Value = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        path = %self.source.path.display(),
                        line = self.line,
                        error = %e,
                        "could not read record"
                    );
                    continue;
                }
            };

            let Some(field) = self.options.timestamp_field.clone() else {
                return (!self.stop.is_set()).then_some(record);
            };

            let time = match self.timestamp(&record, &field) {
                Ok(time) => time,
                Err(reason) => {
                    error!(
                        path = %self.source.path.display(),
                        line = self.line,
                        reason = %reason,
                        "could not read record timestamp"
                    );
                    continue;
                }
            };

            let gap = self
                .last_time
                .and_then(|last| (time - last).to_std().ok())
                .unwrap_or(Duration::ZERO);
            let pace = self.pace(gap);
            self.last_time = Some(time);
            match pace {
                Pace::Deliver => return Some(record),
                Pace::Skip => continue,
                Pace::Stop => return None,
            }
        }
    }
}

/// Replay `path` into the active context as `event_name` events, registering
/// the generator as auxiliary `aux_name`.
///
/// The file is opened before the generator starts, so a missing file is
/// reported here rather than on the generator thread.
pub fn start_replay(
    path: impl AsRef<Path>,
    event_name: impl Into<String>,
    aux_name: impl Into<String>,
    options: ReplayOptions,
) -> Result<Arc<EventGenerator>> {
    let source = ReplaySource::open(path)?;
    start_generator(aux_name, event_name, move |stop| source.replay(stop, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::ContextOptions;
    use crate::engine::Engine;
    use crate::testing::recording_rule;
    use serde_json::json;
    use std::io::Write;
    use std::time::Instant;
    use tempfile::NamedTempFile;

    fn recording(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_queue_wait(Duration::from_millis(20))).unwrap()
    }

    fn stop_signal(engine: &Engine) -> StopSignal {
        let ctx = engine.context(ContextOptions::named("replay"));
        EventGenerator::new(&ctx, "unused", |_| std::iter::empty())
            .stop_signal()
            .clone()
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let engine = engine();
        let file = recording(&[r#"{"n": 1}"#, "not json", "", r#"{"n": 2}"#]);

        let records: Vec<Value> = json_lines(stop_signal(&engine), file.path(), ReplayOptions::immediate())
            .unwrap()
            .collect();

        assert_eq!(records, vec![json!({"n": 1}), json!({"n": 2})]);
    }

    #[test]
    fn test_bad_timestamps_are_skipped() {
        let engine = engine();
        let file = recording(&[
            r#"{"n": 1, "at": "2020-01-01T00:00:00Z"}"#,
            r#"{"n": 2, "at": "yesterday"}"#,
            r#"{"n": 3}"#,
            r#"{"n": 4, "at": "2020-01-01T00:00:00Z"}"#,
        ]);
        let options = ReplayOptions::default().with_timestamp("at", None);

        let records: Vec<i64> = json_lines(stop_signal(&engine), file.path(), options)
            .unwrap()
            .filter_map(|r| r["n"].as_i64())
            .collect();

        assert_eq!(records, vec![1, 4]);
    }

    #[test]
    fn test_gaps_are_scaled() {
        let engine = engine();
        let file = recording(&[
            r#"{"at": 1000}"#,
            r#"{"at": 1010}"#,
        ]);
        // 10 recorded seconds at factor 100 is 100ms.
        let options = ReplayOptions::default()
            .with_timestamp("at", None)
            .with_time_factor(100.0);

        let started = Instant::now();
        let count = json_lines(stop_signal(&engine), file.path(), options)
            .unwrap()
            .count();

        assert_eq!(count, 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[test]
    fn test_custom_timestamp_format() {
        let engine = engine();
        let file = recording(&[
            r#"{"text": "a", "created_at": "Wed Aug 27 13:08:45 +0000 2008"}"#,
            r#"{"text": "b", "created_at": "Wed Aug 27 13:08:46 +0000 2008"}"#,
        ]);
        let options = ReplayOptions::default().with_timestamp("created_at", Some("%a %b %d %H:%M:%S %z %Y"));

        let texts: Vec<Value> = json_lines(stop_signal(&engine), file.path(), options)
            .unwrap()
            .map(|r| r["text"].clone())
            .collect();

        assert_eq!(texts, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_unrepresentable_delay_skips_record() {
        let engine = engine();
        let file = recording(&[
            r#"{"n": 1, "at": 1000}"#,
            r#"{"n": 2, "at": 2000}"#,
            r#"{"n": 3, "at": 2000}"#,
        ]);
        // 1000 recorded seconds divided by 1e-300 does not fit in a Duration.
        let options = ReplayOptions::default()
            .with_timestamp("at", None)
            .with_time_factor(1e-300);

        let started = Instant::now();
        let records: Vec<i64> = json_lines(stop_signal(&engine), file.path(), options)
            .unwrap()
            .filter_map(|r| r["n"].as_i64())
            .collect();

        assert_eq!(records, vec![1, 3]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_ends_replay() {
        let engine = engine();
        let file = recording(&[r#"{"n": 1}"#, r#"{"n": 2}"#]);
        let stop = stop_signal(&engine);
        stop.set();

        let count = json_lines(stop, file.path(), ReplayOptions::immediate())
            .unwrap()
            .count();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let result = ReplaySource::open("/definitely/not/here.jsonl");
        assert!(matches!(result, Err(EcaError::ReplayOpen { .. })));
    }

    #[test]
    fn test_start_replay_fires_records() {
        let engine = engine();
        let file = recording(&[r#"{"n": 1}"#, r#"{"n": 2}"#, r#"{"n": 3}"#]);
        let path = file.path().to_path_buf();
        let recorder = recording_rule(engine.rules(), "records", &["record"]);
        engine.rules().rule("start").on("init").action(move |_, _| {
            start_replay(&path, "record", "player", ReplayOptions::immediate())?;
            Ok(())
        });

        let ctx = engine.spawn_context(ContextOptions::named("main")).unwrap();
        assert!(recorder.wait_for(3, Duration::from_secs(2)));
        let player = ctx.auxiliary::<EventGenerator>("player").unwrap();
        player.join().unwrap();
        assert_eq!(player.produced(), 3);
    }
}
