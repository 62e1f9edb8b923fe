//! Training meters and scalar logs.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::dist::{self, ProcessGroup};

/// How a meter renders itself in log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterFormat {
    /// `{median:.4} ({global_avg:.4})`
    MedianGlobalAvg,
    /// `{value:.N}`
    Value(usize),
}

/// Series of values with a windowed view and a global average
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: u64,
    format: MeterFormat,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(20, MeterFormat::MedianGlobalAvg)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize, format: MeterFormat) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
            format,
        }
    }

    pub fn update(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.count += n;
        self.total += value * n as f64;
    }

    /// Sum `count` and `total` over all ranks. The window stays local.
    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> dist::Result<()> {
        if group.world_size() < 2 {
            return Ok(());
        }
        let mut buf = [self.count as f32, self.total as f32];
        group.all_reduce_sum(&mut buf)?;
        self.count = buf[0].round() as u64;
        self.total = buf[1] as f64;
        Ok(())
    }

    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        // Lower median, as torch.median does
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn max(&self) -> f64 {
        self.window.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Latest value
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            MeterFormat::MedianGlobalAvg => {
                write!(f, "{:.4} ({:.4})", self.median(), self.global_avg())
            }
            MeterFormat::Value(precision) => write!(f, "{:.*}", precision, self.value()),
        }
    }
}

fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

/// Named meters with periodic progress lines
pub struct MetricLogger {
    pub meters: BTreeMap<String, SmoothedValue>,
    delimiter: &'static str,
    print_freq: usize,
    start: Instant,
    last: Instant,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ", 10)
    }
}

impl MetricLogger {
    pub fn new(delimiter: &'static str, print_freq: usize) -> Self {
        let now = Instant::now();
        Self {
            meters: BTreeMap::new(),
            delimiter,
            print_freq: print_freq.max(1),
            start: now,
            last: now,
            iter_time: SmoothedValue::default(),
            data_time: SmoothedValue::default(),
        }
    }

    pub fn add_meter(&mut self, name: &str, meter: SmoothedValue) {
        self.meters.insert(name.to_string(), meter);
    }

    /// Add one value per name, creating default meters on first use
    pub fn update<'a>(&mut self, values: impl IntoIterator<Item = (&'a str, f64)>) {
        for (name, value) in values {
            self.meters
                .entry(name.to_string())
                .or_default()
                .update(value, 1);
        }
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Restart the timers at the beginning of a pass
    pub fn start(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last = now;
    }

    /// Record the time spent waiting for batch `i`
    pub fn data_loaded(&mut self) {
        self.data_time.update(self.last.elapsed().as_secs_f64(), 1);
    }

    /// Close iteration `i` of `len` and log a progress line every
    /// `print_freq` iterations and on the last one
    pub fn log_every(&mut self, i: usize, len: usize, header: &str) {
        self.iter_time.update(self.last.elapsed().as_secs_f64(), 1);
        self.last = Instant::now();
        if i % self.print_freq == 0 || i + 1 == len {
            let eta = format_eta(self.iter_time.global_avg() * len.saturating_sub(i + 1) as f64);
            let width = len.to_string().len();
            tracing::info!(
                eta = %eta,
                time = %format!("{:.4}", self.iter_time.avg()),
                data = %format!("{:.4}", self.data_time.avg()),
                "{} [{:>width$}/{}]{}{}",
                header,
                i,
                len,
                self.delimiter,
                self,
                width = width
            );
        }
    }

    /// Log the total duration of the pass
    pub fn finish(&self, len: usize, header: &str) -> Duration {
        let total = self.start.elapsed();
        tracing::info!(
            "{} Total time: {} ({:.4} s / it)",
            header,
            format_eta(total.as_secs_f64()),
            total.as_secs_f64() / len.max(1) as f64
        );
        total
    }

    pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> dist::Result<()> {
        for meter in self.meters.values_mut() {
            meter.synchronize_between_processes(group)?;
        }
        Ok(())
    }

    /// Global average of every meter
    pub fn global_averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, meter)) in self.meters.iter().enumerate() {
            if i > 0 {
                f.write_str(self.delimiter)?;
            }
            write!(f, "{name}: {meter}")?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    tag: &'a str,
    value: f64,
    step: i64,
}

/// Scalar log as JSON lines, one `{tag, value, step}` record per line.
///
/// Only the main process writes; elsewhere every call is a no-op.
pub struct ScalarWriter {
    path: Option<PathBuf>,
    out: Option<BufWriter<File>>,
}

impl ScalarWriter {
    /// Append to `scalars.jsonl` under `dir`
    pub fn create(dir: &Path, enabled: bool) -> std::io::Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join("scalars.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path: Some(path),
            out: Some(BufWriter::new(file)),
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            out: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: i64) -> anyhow::Result<()> {
        if let Some(out) = self.out.as_mut() {
            serde_json::to_writer(&mut *out, &ScalarRecord { tag, value, step })?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ScalarWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoothed_value_window() {
        let mut meter = SmoothedValue::new(3, MeterFormat::MedianGlobalAvg);
        for v in [10.0, 1.0, 2.0, 3.0] {
            meter.update(v, 1);
        }
        assert_eq!(meter.value(), 3.0);
        assert_eq!(meter.median(), 2.0);
        assert_eq!(meter.avg(), 2.0);
        assert_eq!(meter.max(), 3.0);
        // Global average keeps the value that left the window
        assert_eq!(meter.global_avg(), 4.0);
        assert_eq!(meter.count(), 4);
    }

    #[test]
    fn test_lower_median_and_format() {
        let mut meter = SmoothedValue::default();
        meter.update(1.0, 1);
        meter.update(2.0, 1);
        assert_eq!(meter.median(), 1.0);
        assert_eq!(meter.to_string(), "1.0000 (1.5000)");

        let mut lr = SmoothedValue::new(1, MeterFormat::Value(6));
        lr.update(1e-4, 1);
        lr.update(2e-4, 1);
        assert_eq!(lr.to_string(), "0.000200");
    }

    #[test]
    fn test_empty_meter() {
        let meter = SmoothedValue::default();
        assert_eq!(meter.median(), 0.0);
        assert_eq!(meter.global_avg(), 0.0);
        assert_eq!(meter.value(), 0.0);
    }

    #[test]
    fn test_logger_update_and_display() {
        let mut logger = MetricLogger::default();
        logger.add_meter("lr", SmoothedValue::new(1, MeterFormat::Value(2)));
        logger.update([("loss", 2.0), ("lr", 0.5)]);
        logger.update([("loss", 4.0)]);
        assert_eq!(logger.get("loss").unwrap().global_avg(), 3.0);
        assert_eq!(logger.to_string(), "loss: 2.0000 (3.0000)  lr: 0.50");
        let avgs = logger.global_averages();
        assert_eq!(avgs["lr"], 0.5);

        logger.synchronize_between_processes(&dist::SingleProcess).unwrap();
        assert_eq!(logger.get("loss").unwrap().count(), 2);
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(3725.4), "1:02:05");
        assert_eq!(format_eta(-3.0), "0:00:00");
    }

    #[test]
    fn test_scalar_writer_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = ScalarWriter::create(dir.path(), true).unwrap();
            writer.add_scalar("Loss/train", 1.5, -1).unwrap();
            writer.add_scalar("lr", 1e-4, 0).unwrap();
        }
        let text = std::fs::read_to_string(dir.path().join("scalars.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "Loss/train");
        assert_eq!(lines[0]["step"], -1);
        assert_eq!(lines[1]["value"], 1e-4);
    }

    #[test]
    fn test_disabled_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScalarWriter::create(&dir.path().join("runs"), false).unwrap();
        writer.add_scalar("lr", 1.0, 0).unwrap();
        assert!(writer.path().is_none());
        assert!(!dir.path().join("runs").exists());
    }
}
