// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 击球生命周期状态机 (Shot lifecycle controller)
//!
//! ```text
//! Idle → Acquiring → ClubApproaching → ImpactDetected → BallInFlight → Complete
//!  ↑__________________ stop_tracking() / 超时 ___________________________|
//! ```
//! 每个 `FrameResult` 至多触发一次状态转移。

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::metrics::launch_metrics;
use super::record::{CompletionReason, ShotMetadata, ShotRecord};
use crate::config::{CalibrationConfig, ShotConfig};
use crate::detection::Position;
use crate::pipeline::FrameResult;

const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotState {
    Idle,
    Acquiring,
    ClubApproaching,
    ImpactDetected,
    BallInFlight,
    Complete,
}

impl ShotState {
    /// 正在追踪 (已开始且未结束)
    pub fn is_active(&self) -> bool {
        !matches!(self, ShotState::Idle | ShotState::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Stopped,
    Timeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShotEvent {
    BallDetected {
        frame_id: u64,
        position: Position,
    },
    ClubDetected {
        frame_id: u64,
        position: Position,
    },
    ImpactDetected {
        frame_id: u64,
        timestamp: Duration,
        position: Position,
    },
    BallInFlight {
        frame_id: u64,
    },
    BallLanded {
        frame_id: u64,
        position: Option<Position>,
        reason: CompletionReason,
    },
    TrackingComplete(Box<ShotRecord>),
    TrackingCancelled(CancelReason),
}

/// 单次击球的追踪数据,`start_tracking` 时重建
#[derive(Debug, Default)]
struct ShotProgress {
    started_at: Option<DateTime<Utc>>,
    first_timestamp: Option<Duration>,
    last_frame_id: Option<u64>,
    ball_seen: bool,
    club_seen: bool,
    impact: Option<(u64, Duration)>,
    trajectory: Vec<Position>,
    last_ball: Option<Position>,
    missed_frames: u32,
    flight_frames: u32,
    exceeded_min_speed: bool,
    peak_speed: f32,
}

pub struct ShotLifecycleController {
    config: ShotConfig,
    calibration: CalibrationConfig,
    state: ShotState,
    progress: ShotProgress,
    subscribers: Vec<Sender<ShotEvent>>,
}

impl ShotLifecycleController {
    pub fn new(config: ShotConfig, calibration: CalibrationConfig) -> Self {
        Self {
            config,
            calibration,
            state: ShotState::Idle,
            progress: ShotProgress::default(),
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> ShotState {
        self.state
    }

    pub fn trajectory(&self) -> &[Position] {
        &self.progress.trajectory
    }

    pub fn impact_frame(&self) -> Option<u64> {
        self.progress.impact.map(|(id, _)| id)
    }

    /// 订阅事件 (有界通道,慢消费者会丢事件)
    pub fn subscribe(&mut self) -> Receiver<ShotEvent> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// 开始新一杆; 追踪进行中时忽略并返回 false
    pub fn start_tracking(&mut self) -> bool {
        if self.state.is_active() {
            warn!("⚠️ 追踪进行中,忽略 start_tracking");
            return false;
        }
        self.progress = ShotProgress {
            started_at: Some(Utc::now()),
            ..ShotProgress::default()
        };
        self.state = ShotState::Acquiring;
        info!("🏌️ 开始追踪,等待球与杆头...");
        true
    }

    /// 停止追踪,回到 Idle
    pub fn stop_tracking(&mut self) -> Vec<ShotEvent> {
        let was_active = self.state.is_active();
        self.state = ShotState::Idle;
        if !was_active {
            return Vec::new();
        }
        info!("⏹️ 追踪已停止");
        let events = vec![ShotEvent::TrackingCancelled(CancelReason::Stopped)];
        self.broadcast(&events);
        events
    }

    /// 输入一帧结果,返回本帧产生的事件
    pub fn process(&mut self, frame: &FrameResult) -> Vec<ShotEvent> {
        if !self.state.is_active() {
            return Vec::new();
        }
        if let Some(last) = self.progress.last_frame_id {
            if frame.frame_id <= last {
                warn!(
                    "⚠️ 帧序号乱序/重复: {} (上一帧 {}),丢弃",
                    frame.frame_id, last
                );
                return Vec::new();
            }
        }
        self.progress.last_frame_id = Some(frame.frame_id);

        let first = *self.progress.first_timestamp.get_or_insert(frame.timestamp);
        if frame.timestamp.saturating_sub(first) > self.config.tracking_timeout() {
            warn!("⏰ 追踪超时 ({:.0}s),回到空闲", self.config.tracking_timeout_secs);
            self.state = ShotState::Idle;
            let events = vec![ShotEvent::TrackingCancelled(CancelReason::Timeout)];
            self.broadcast(&events);
            return events;
        }

        let mut events = Vec::new();
        let ball = frame.smoothed_ball_center;
        let club = frame.smoothed_club_center;
        if let (Some(position), false) = (ball, self.progress.ball_seen) {
            self.progress.ball_seen = true;
            events.push(ShotEvent::BallDetected {
                frame_id: frame.frame_id,
                position,
            });
        }
        if let (Some(position), false) = (club, self.progress.club_seen) {
            self.progress.club_seen = true;
            events.push(ShotEvent::ClubDetected {
                frame_id: frame.frame_id,
                position,
            });
        }

        let gap = match (ball, club) {
            (Some(b), Some(c)) => Some(b.distance(&c)),
            _ => None,
        };

        match self.state {
            ShotState::Acquiring => {
                if gap.map_or(false, |d| d <= self.config.club_approach_distance) {
                    debug!("🏌️ 杆头接近 (帧{})", frame.frame_id);
                    self.state = ShotState::ClubApproaching;
                }
            }
            ShotState::ClubApproaching => {
                if let (Some(d), Some(position)) = (gap, ball) {
                    if d < self.config.impact_distance() {
                        info!("💥 击球! 帧{} 距离{:.1}px", frame.frame_id, d);
                        self.progress.impact = Some((frame.frame_id, frame.timestamp));
                        self.progress.trajectory.clear();
                        self.progress.trajectory.push(position);
                        self.progress.last_ball = Some(position);
                        self.state = ShotState::ImpactDetected;
                        events.push(ShotEvent::ImpactDetected {
                            frame_id: frame.frame_id,
                            timestamp: frame.timestamp,
                            position,
                        });
                    }
                }
            }
            ShotState::ImpactDetected => {
                self.state = ShotState::BallInFlight;
                self.progress.flight_frames = 1;
                match ball {
                    Some(position) => self.push_point(position),
                    None => self.progress.missed_frames = 1,
                }
                events.push(ShotEvent::BallInFlight {
                    frame_id: frame.frame_id,
                });
            }
            ShotState::BallInFlight => self.track_flight(frame, &mut events),
            ShotState::Idle | ShotState::Complete => {}
        }

        self.broadcast(&events);
        events
    }

    fn push_point(&mut self, position: Position) {
        if self.progress.trajectory.len() < self.config.max_trajectory_points {
            self.progress.trajectory.push(position);
        }
        self.progress.last_ball = Some(position);
        self.progress.missed_frames = 0;
    }

    fn track_flight(&mut self, frame: &FrameResult, events: &mut Vec<ShotEvent>) {
        self.progress.flight_frames += 1;
        let Some(position) = frame.smoothed_ball_center else {
            self.progress.missed_frames += 1;
            if self.progress.missed_frames >= self.config.landing_miss_frames {
                let last = self.progress.last_ball;
                self.complete(frame, last, CompletionReason::BallLost, events);
            }
            return;
        };

        self.push_point(position);
        let speed = frame.ball_speed;
        self.progress.peak_speed = self.progress.peak_speed.max(speed);
        if speed >= self.config.min_flight_speed {
            self.progress.exceeded_min_speed = true;
        }
        let decayed = self.progress.exceeded_min_speed
            && speed < self.config.min_flight_speed / 2.0
            && self.progress.trajectory.len() >= self.config.min_trajectory_points;
        if decayed {
            self.complete(frame, Some(position), CompletionReason::SpeedDecay, events);
        }
    }

    fn complete(
        &mut self,
        frame: &FrameResult,
        position: Option<Position>,
        reason: CompletionReason,
        events: &mut Vec<ShotEvent>,
    ) {
        let metrics = launch_metrics(&self.progress.trajectory, &self.config, &self.calibration);
        let (impact_frame_id, impact_timestamp) = self.progress.impact.unwrap_or_default();
        let first = self.progress.first_timestamp.unwrap_or(frame.timestamp);
        let record = ShotRecord {
            started_at: self.progress.started_at.unwrap_or_else(Utc::now),
            ball_speed: metrics.ball_speed,
            launch_angle: metrics.launch_angle,
            carry_distance: metrics.carry_distance,
            trajectory: self.progress.trajectory.clone(),
            tracking_duration: frame.timestamp.saturating_sub(first),
            metadata: ShotMetadata {
                impact_frame_id,
                impact_timestamp,
                completion: reason,
                flight_frames: self.progress.flight_frames,
                peak_frame_speed: self.progress.peak_speed,
                pixels_per_meter: self.calibration.pixels_per_meter,
                frame_interval_secs: self.calibration.frame_interval_secs,
            },
        };
        info!(
            "🏁 击球完成 ({:?}): 球速 {:.1} m/s | 角度 {:.1}° | 距离 {:.1} m | {} 个轨迹点",
            reason,
            record.ball_speed,
            record.launch_angle,
            record.carry_distance,
            record.trajectory.len()
        );
        self.state = ShotState::Complete;
        events.push(ShotEvent::BallLanded {
            frame_id: frame.frame_id,
            position,
            reason,
        });
        events.push(ShotEvent::TrackingComplete(Box::new(record)));
    }

    fn broadcast(&mut self, events: &[ShotEvent]) {
        if events.is_empty() || self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|tx| {
            for event in events {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("⚠️ 事件订阅者处理过慢,丢弃事件");
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
            true
        });
    }
}
