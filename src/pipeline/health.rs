// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线健康状态 (Pipeline health)
//!
//! 不变式: `frames_sent == frames_processed + frames_dropped`
//! (`frames_processed` 计入已送达工作线程的帧)

use std::time::{Duration, Instant};

use crate::config::PipelineConfig;

/// 健康快照,由协调器在同一把锁下维护
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineHealth {
    pub frames_sent: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub results_received: u64,
    pub worker_faults: u64,
    /// 结果通道已满而丢弃的结果数
    pub results_overflowed: u64,
    /// 重启时被放弃的在途帧数
    pub frames_abandoned: u64,
    pub last_result_timestamp: Option<Instant>,
    /// 最早一个未完成帧开始等待的时刻
    pub waiting_since: Option<Instant>,
    pub unhealthy_since: Option<Instant>,
    pub is_healthy: bool,
    pub restart_recommended: bool,
}

/// 一次健康检查的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Unchanged,
    BecameUnhealthy,
    RestartRecommended,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self {
            frames_sent: 0,
            frames_processed: 0,
            frames_dropped: 0,
            results_received: 0,
            worker_faults: 0,
            results_overflowed: 0,
            frames_abandoned: 0,
            last_result_timestamp: None,
            waiting_since: None,
            unhealthy_since: None,
            is_healthy: true,
            restart_recommended: false,
        }
    }
}

impl PipelineHealth {
    /// 已送达但尚未返回结果的帧数
    pub fn in_flight(&self) -> u64 {
        self.frames_processed
            .saturating_sub(self.results_received + self.worker_faults + self.frames_abandoned)
    }

    pub fn drop_rate(&self) -> f64 {
        if self.frames_sent == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.frames_sent as f64
        }
    }

    pub(crate) fn record_admitted(&mut self, now: Instant) {
        self.frames_sent += 1;
        self.frames_processed += 1;
        if self.waiting_since.is_none() {
            self.waiting_since = Some(now);
        }
    }

    pub(crate) fn record_dropped(&mut self) {
        self.frames_sent += 1;
        self.frames_dropped += 1;
    }

    /// 收到结果或故障诊断 (工作线程仍存活); 返回是否从不健康中恢复
    pub(crate) fn record_completion(&mut self, now: Instant, fault: bool) -> bool {
        if fault {
            self.worker_faults += 1;
        } else {
            self.results_received += 1;
        }
        self.last_result_timestamp = Some(now);
        self.waiting_since = if self.in_flight() > 0 { Some(now) } else { None };

        if self.is_healthy {
            return false;
        }
        self.is_healthy = true;
        self.unhealthy_since = None;
        self.restart_recommended = false;
        true
    }

    /// 工作线程失联 (通道断开)
    pub(crate) fn mark_unhealthy(&mut self, now: Instant) {
        if self.is_healthy {
            self.is_healthy = false;
            self.unhealthy_since = Some(now);
        }
    }

    /// 重启后放弃在途帧,恢复健康
    pub(crate) fn abandon_in_flight(&mut self) {
        self.frames_abandoned += self.in_flight();
        self.waiting_since = None;
        self.unhealthy_since = None;
        self.is_healthy = true;
        self.restart_recommended = false;
    }

    /// 周期性健康检查: 有未完成的帧且超时无结果 → 不健康
    pub(crate) fn evaluate(&mut self, now: Instant, config: &PipelineConfig) -> HealthTransition {
        if self.is_healthy {
            let stalled = self.in_flight() > 0
                && self
                    .waiting_since
                    .map_or(false, |t| elapsed(now, t) > config.unhealthy_timeout());
            if stalled {
                self.is_healthy = false;
                self.unhealthy_since = Some(now);
                return HealthTransition::BecameUnhealthy;
            }
            return HealthTransition::Unchanged;
        }

        let overdue = self
            .unhealthy_since
            .map_or(false, |t| elapsed(now, t) >= config.restart_timeout());
        if overdue && !self.restart_recommended {
            self.restart_recommended = true;
            return HealthTransition::RestartRecommended;
        }
        HealthTransition::Unchanged
    }
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.saturating_duration_since(since)
}
