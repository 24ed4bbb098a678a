// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 击球记录与持久化接口 (Shot record & sinks)

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::Position;

/// 飞行结束的判定依据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    /// 速度衰减到阈值一半以下
    SpeedDecay,
    /// 连续多帧丢失
    BallLost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotMetadata {
    pub impact_frame_id: u64,
    pub impact_timestamp: Duration,
    pub completion: CompletionReason,
    pub flight_frames: u32,
    pub peak_frame_speed: f32,
    pub pixels_per_meter: f32,
    pub frame_interval_secs: f32,
}

/// 一次完整击球的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotRecord {
    pub started_at: DateTime<Utc>,
    pub ball_speed: f32,     // m/s
    pub launch_angle: f32,   // 度
    pub carry_distance: f32, // m
    pub trajectory: Vec<Position>,
    pub tracking_duration: Duration,
    pub metadata: ShotMetadata,
}

/// 击球记录的持久化接口 (由外部协作方实现)
pub trait ShotRecordSink {
    fn store(&mut self, record: &ShotRecord) -> anyhow::Result<()>;
}

impl ShotRecordSink for Vec<ShotRecord> {
    fn store(&mut self, record: &ShotRecord) -> anyhow::Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// 每行一条JSON记录
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl JsonLinesSink<BufWriter<File>> {
    /// 以追加方式打开文件
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn records_written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ShotRecordSink for JsonLinesSink<W> {
    fn store(&mut self, record: &ShotRecord) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ShotRecord {
        ShotRecord {
            started_at: Utc::now(),
            ball_speed: 45.0,
            launch_angle: 30.0,
            carry_distance: 178.8,
            trajectory: vec![Position::new(1.0, 2.0), Position::new(3.0, 1.0)],
            tracking_duration: Duration::from_millis(420),
            metadata: ShotMetadata {
                impact_frame_id: 18,
                impact_timestamp: Duration::from_millis(75),
                completion: CompletionReason::BallLost,
                flight_frames: 12,
                peak_frame_speed: 45.2,
                pixels_per_meter: 100.0,
                frame_interval_secs: 1.0 / 120.0,
            },
        }
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let shot = record();
        sink.store(&shot).unwrap();
        sink.store(&shot).unwrap();
        assert_eq!(sink.records_written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ShotRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, shot);
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<ShotRecord> = Vec::new();
        sink.store(&record()).unwrap();
        assert_eq!(sink.len(), 1);
    }
}
