// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流水线协调器 (Pipeline coordinator)
//!
//! - 调用方线程: 抽帧 + `try_send`,通道满即丢帧 (背压),永不阻塞
//! - 工作线程:   见 `worker.rs`
//! - 监控线程:   汇集工作线程消息 → 更新健康状态 → 转发到结果通道; 周期性健康检查

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{error, info, warn};

use super::health::{HealthTransition, PipelineHealth};
use super::worker::FrameWorker;
use super::{FrameAdmission, FrameRequest, PipelineEvent, PipelineState, WorkerMessage};
use crate::config::{GolfConfig, PipelineConfig};
use crate::error::{Result, TrackerError};
use crate::inference::InferenceEngine;

/// 监控线程轮询上限 (保证 dispose/restart 能及时退出)
const MONITOR_POLL: Duration = Duration::from_millis(100);
/// 释放时检查工作线程是否退出的间隔
const JOIN_POLL: Duration = Duration::from_millis(5);

/// 跨线程共享状态,只通过这一把锁访问
struct Shared {
    health: PipelineHealth,
    state: PipelineState,
    /// 每次 (重新) 启动工作线程递增,旧监控线程据此退出
    generation: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PipelineCoordinator {
    config: GolfConfig,
    shared: Arc<Mutex<Shared>>,
    /// 当前工作线程的轨迹重置标志 (每个工作线程一份)
    reset_tracks: Arc<AtomicBool>,
    request_tx: Option<Sender<FrameRequest>>,
    result_tx: Sender<PipelineEvent>,
    result_rx: Receiver<PipelineEvent>,
    worker: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    frame_counter: u64,
}

impl PipelineCoordinator {
    pub fn new(config: GolfConfig) -> Self {
        let (result_tx, result_rx) =
            crossbeam_channel::bounded(config.pipeline.result_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Mutex::new(Shared {
                health: PipelineHealth::default(),
                state: PipelineState::Uninitialized,
                generation: 0,
            })),
            reset_tracks: Arc::new(AtomicBool::new(false)),
            request_tx: None,
            result_tx,
            result_rx,
            worker: None,
            monitor: None,
            frame_counter: 0,
        }
    }

    pub fn config(&self) -> &GolfConfig {
        &self.config
    }

    /// 启动工作线程并等待其就绪信号
    pub fn initialize(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        match self.state() {
            PipelineState::Disposed => return Err(TrackerError::Disposed),
            PipelineState::Uninitialized => {}
            _ => return Err(TrackerError::AlreadyInitialized),
        }
        self.config.validate()?;
        self.spawn(engine)?;
        lock(&self.shared).state = PipelineState::Ready;
        info!("✅ 流水线就绪 (抽帧 1/{})", self.config.pipeline.frame_skip.max(1));
        Ok(())
    }

    fn spawn(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        let pipeline = &self.config.pipeline;
        let (request_tx, request_rx) =
            crossbeam_channel::bounded(pipeline.request_capacity.max(1));
        let (message_tx, message_rx) =
            crossbeam_channel::bounded(pipeline.result_capacity.max(1));

        let worker = FrameWorker::new(&self.config, engine);
        // 被分离的旧工作线程不能消费新线程的重置请求
        self.reset_tracks = Arc::new(AtomicBool::new(false));
        let reset = Arc::clone(&self.reset_tracks);
        let worker_handle = thread::Builder::new()
            .name("golf-worker".into())
            .spawn(move || worker.run(request_rx, message_tx, reset))
            .map_err(TrackerError::WorkerSpawn)?;

        // 等待就绪信号
        let ready_timeout = pipeline.ready_timeout();
        match message_rx.recv_timeout(ready_timeout) {
            Ok(WorkerMessage::Ready) => {}
            Ok(other) => {
                warn!("⚠️ 工作线程首条消息不是就绪信号: {:?}", other);
            }
            Err(_) => {
                error!("❌ 工作线程未在 {:?} 内就绪", ready_timeout);
                return Err(TrackerError::WorkerStartup(ready_timeout));
            }
        }

        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.generation
        };
        let monitor = Monitor {
            shared: Arc::clone(&self.shared),
            messages: message_rx,
            results: self.result_tx.clone(),
            config: pipeline.clone(),
            generation,
        };
        let monitor_handle = thread::Builder::new()
            .name("golf-monitor".into())
            .spawn(move || monitor.run())
            .map_err(TrackerError::WorkerSpawn)?;

        self.request_tx = Some(request_tx);
        self.worker = Some(worker_handle);
        self.monitor = Some(monitor_handle);
        Ok(())
    }

    /// 提交一帧,立即返回准入结果
    pub fn process_frame(&mut self, request: FrameRequest) -> Result<FrameAdmission> {
        let Some(request_tx) = self.request_tx.as_ref() else {
            return Err(match self.state() {
                PipelineState::Disposed => TrackerError::Disposed,
                _ => TrackerError::NotInitialized,
            });
        };

        let mut shared = lock(&self.shared);
        if shared.state == PipelineState::Disposed {
            return Err(TrackerError::Disposed);
        }

        // 1. 抽帧: 每N帧处理一帧 (首帧处理)
        let n = self.frame_counter;
        self.frame_counter += 1;
        if n % self.config.pipeline.frame_skip.max(1) as u64 != 0 {
            shared.health.record_dropped();
            return Ok(FrameAdmission::Decimated);
        }

        // 2. 不健康时仅允许在无在途帧时放行一帧探测
        if !shared.health.is_healthy && shared.health.in_flight() > 0 {
            shared.health.record_dropped();
            return Ok(FrameAdmission::Unhealthy);
        }

        // 3. 非阻塞发送
        let frame_id = request.frame_id;
        match request_tx.try_send(request) {
            Ok(()) => {
                shared.health.record_admitted(Instant::now());
                if shared.state == PipelineState::Ready {
                    shared.state = PipelineState::Processing;
                }
                Ok(FrameAdmission::Accepted)
            }
            Err(TrySendError::Full(_)) => {
                shared.health.record_dropped();
                Ok(FrameAdmission::BackPressure)
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("❌ 工作线程已退出,丢弃帧{}", frame_id);
                shared.health.record_dropped();
                shared.health.mark_unhealthy(Instant::now());
                shared.state = PipelineState::Degraded;
                Ok(FrameAdmission::Unhealthy)
            }
        }
    }

    /// 结果通道 (可克隆,多处消费)
    pub fn results(&self) -> Receiver<PipelineEvent> {
        self.result_rx.clone()
    }

    pub fn try_next_event(&self) -> Option<PipelineEvent> {
        self.result_rx.try_recv().ok()
    }

    pub fn next_event_timeout(&self, timeout: Duration) -> Option<PipelineEvent> {
        self.result_rx.recv_timeout(timeout).ok()
    }

    pub fn health(&self) -> PipelineHealth {
        lock(&self.shared).health.clone()
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.shared).state
    }

    /// 清零计数器,并让工作线程在下一帧前丢弃轨迹
    pub fn reset(&mut self) {
        let mut shared = lock(&self.shared);
        shared.health = PipelineHealth::default();
        if shared.state == PipelineState::Degraded {
            shared.state = PipelineState::Processing;
        }
        self.frame_counter = 0;
        self.reset_tracks.store(true, Ordering::Release);
    }

    /// 替换工作线程 (健康检查建议重启后由调用方触发)
    pub fn restart(&mut self, engine: Box<dyn InferenceEngine>) -> Result<()> {
        match self.state() {
            PipelineState::Disposed => return Err(TrackerError::Disposed),
            PipelineState::Uninitialized => return Err(TrackerError::NotInitialized),
            _ => {}
        }
        warn!("🔄 重启工作线程...");
        self.request_tx = None;
        // 卡死的工作线程无法join,直接分离
        if let Some(handle) = self.worker.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.health.abandon_in_flight();
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }

        self.spawn(engine)?;
        lock(&self.shared).state = PipelineState::Ready;
        info!("✅ 工作线程已重启");
        Ok(())
    }

    /// 停止并释放; 可重复调用,之后到达的结果全部丢弃
    pub fn dispose(&mut self) {
        {
            let mut shared = lock(&self.shared);
            if shared.state == PipelineState::Disposed {
                return;
            }
            shared.state = PipelineState::Disposed;
        }
        self.request_tx = None;

        // 请求通道关闭后工作线程在当前帧结束时退出; 推理卡死时超时分离
        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + self.config.pipeline.dispose_timeout();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "⚠️ 工作线程 {:.1}s 内未退出,分离",
                    self.config.pipeline.dispose_timeout_secs
                );
            }
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        while self.result_rx.try_recv().is_ok() {}
        info!("🛑 流水线已释放");
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// 监控线程
struct Monitor {
    shared: Arc<Mutex<Shared>>,
    messages: Receiver<WorkerMessage>,
    results: Sender<PipelineEvent>,
    config: PipelineConfig,
    generation: u64,
}

impl Monitor {
    fn run(self) {
        let interval = self.config.health_check_interval();
        let mut next_check = Instant::now() + interval;

        loop {
            let wait = next_check
                .saturating_duration_since(Instant::now())
                .min(MONITOR_POLL);
            match self.messages.recv_timeout(wait) {
                Ok(message) => self.handle(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            {
                let shared = lock(&self.shared);
                if shared.generation != self.generation || shared.state == PipelineState::Disposed {
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_check {
                self.check_health(now);
                next_check = now + interval;
            }
        }
    }

    fn handle(&self, message: WorkerMessage) {
        let event = match message {
            WorkerMessage::Ready => return,
            WorkerMessage::EngineLoaded(name) => {
                info!("✅ 推理引擎加载成功: {}", name);
                return;
            }
            WorkerMessage::EngineFailed(e) => {
                error!("❌ 推理引擎加载失败: {}", e);
                return;
            }
            WorkerMessage::Result(result) => PipelineEvent::Result(result),
            WorkerMessage::Fault(fault) => {
                warn!("⚠️ 帧{:?} 处理失败: {}", fault.frame_id, fault.message);
                PipelineEvent::Fault(fault)
            }
        };

        let mut shared = lock(&self.shared);
        if shared.state == PipelineState::Disposed || shared.generation != self.generation {
            return;
        }
        let is_fault = matches!(event, PipelineEvent::Fault(_));
        if shared.health.record_completion(Instant::now(), is_fault) {
            info!("💚 流水线恢复正常");
        }
        if shared.state == PipelineState::Degraded {
            shared.state = PipelineState::Processing;
        }
        if self.results.try_send(event).is_err() {
            shared.health.results_overflowed += 1;
            warn!("⚠️ 结果通道已满,丢弃结果");
        }
    }

    fn check_health(&self, now: Instant) {
        let mut shared = lock(&self.shared);
        if shared.state == PipelineState::Disposed {
            return;
        }
        match shared.health.evaluate(now, &self.config) {
            HealthTransition::BecameUnhealthy => {
                shared.state = PipelineState::Degraded;
                warn!(
                    "💔 {:.0}s 内无结果,流水线不健康 (在途 {} 帧)",
                    self.config.unhealthy_timeout_secs,
                    shared.health.in_flight()
                );
            }
            HealthTransition::RestartRecommended => {
                error!(
                    "🚨 流水线持续不健康超过 {:.0}s,建议重启工作线程",
                    self.config.restart_timeout_secs
                );
            }
            HealthTransition::Unchanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{ObjectClass, OutputLayout, Position};
    use crate::inference::{synthetic_output, Candidate, ReplayEngine};
    use ndarray::ArrayD;

    fn config(skip: u32) -> GolfConfig {
        let mut config = GolfConfig::default();
        config.decoder.input_size = 32;
        config.pipeline.frame_skip = skip;
        config
    }

    fn frame(id: u64) -> FrameRequest {
        FrameRequest::filled(32, 32, 80, id, Duration::from_millis(id))
    }

    fn ball_output() -> ArrayD<f32> {
        let c = Candidate {
            center: Position::new(16., 16.),
            width: 4.,
            height: 4.,
            class: ObjectClass::Ball,
            score: 0.9,
        };
        synthetic_output(OutputLayout::DetectionMajor, &[c], 2, 2)
    }

    /// 推理永不返回,模拟卡死
    struct StuckEngine(Receiver<()>);

    impl InferenceEngine for StuckEngine {
        fn infer(&mut self, _input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
            let _ = self.0.recv();
            anyhow::bail!("released")
        }
    }

    #[test]
    fn test_process_before_initialize() {
        let mut pipeline = PipelineCoordinator::new(config(1));
        assert!(matches!(
            pipeline.process_frame(frame(0)),
            Err(TrackerError::NotInitialized)
        ));
    }

    #[test]
    fn test_decimation_and_results() {
        let mut pipeline = PipelineCoordinator::new(config(2));
        let outputs = (0..5).map(|_| ball_output()).collect();
        pipeline
            .initialize(Box::new(ReplayEngine::new(outputs, 2)))
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(matches!(
            pipeline.initialize(Box::new(ReplayEngine::new(vec![], 2))),
            Err(TrackerError::AlreadyInitialized)
        ));

        let results = pipeline.results();
        let mut received = Vec::new();
        for id in 0..10 {
            let admission = pipeline.process_frame(frame(id)).unwrap();
            if id % 2 == 1 {
                assert_eq!(admission, FrameAdmission::Decimated);
                continue;
            }
            assert_eq!(admission, FrameAdmission::Accepted);
            // 逐帧等待结果
            match results.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipelineEvent::Result(r) => received.push(r.frame_id),
                PipelineEvent::Fault(f) => panic!("unexpected fault {:?}", f),
            }
        }
        assert_eq!(received, vec![0, 2, 4, 6, 8]);

        let health = pipeline.health();
        assert_eq!(health.frames_sent, 10);
        assert_eq!(health.frames_processed, 5);
        assert_eq!(health.frames_dropped, 5);
        assert_eq!(health.results_received, 5);
        assert!(health.is_healthy);
        assert_eq!(pipeline.state(), PipelineState::Processing);
    }

    #[test]
    fn test_back_pressure_never_blocks() {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut pipeline = PipelineCoordinator::new(config(1));
        pipeline
            .initialize(Box::new(StuckEngine(release_rx)))
            .unwrap();

        let started = Instant::now();
        let admissions: Vec<_> = (0..100)
            .map(|id| pipeline.process_frame(frame(id)).unwrap())
            .collect();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(admissions.contains(&FrameAdmission::BackPressure));

        let health = pipeline.health();
        assert_eq!(health.frames_sent, 100);
        assert_eq!(
            health.frames_sent,
            health.frames_processed + health.frames_dropped
        );
        // 工作线程占用1帧 + 通道容量1帧
        assert!(health.frames_processed <= 2);

        drop(release_tx);
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Disposed);
        assert!(matches!(
            pipeline.process_frame(frame(1000)),
            Err(TrackerError::Disposed)
        ));
    }

    #[test]
    fn test_stalled_worker_turns_unhealthy_and_restarts() {
        let mut cfg = config(1);
        cfg.pipeline.health_check_interval_secs = 0.05;
        cfg.pipeline.unhealthy_timeout_secs = 0.2;
        cfg.pipeline.restart_timeout_secs = 0.2;
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut pipeline = PipelineCoordinator::new(cfg);
        pipeline
            .initialize(Box::new(StuckEngine(release_rx)))
            .unwrap();
        assert_eq!(pipeline.process_frame(frame(0)).unwrap(), FrameAdmission::Accepted);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pipeline.health().restart_recommended && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let health = pipeline.health();
        assert!(!health.is_healthy);
        assert!(health.restart_recommended);
        assert_eq!(pipeline.state(), PipelineState::Degraded);
        assert_eq!(
            pipeline.process_frame(frame(1)).unwrap(),
            FrameAdmission::Unhealthy
        );

        pipeline
            .restart(Box::new(ReplayEngine::new(vec![ball_output()], 2)))
            .unwrap();
        drop(release_tx);
        assert!(pipeline.health().is_healthy);
        assert_eq!(pipeline.process_frame(frame(2)).unwrap(), FrameAdmission::Accepted);
        let event = pipeline
            .next_event_timeout(Duration::from_secs(5))
            .unwrap();
        assert!(matches!(event, PipelineEvent::Result(ref r) if r.frame_id == 2));
        pipeline.dispose();
    }

    #[test]
    fn test_dispose_mid_flight_does_not_wait_for_stuck_engine() {
        let mut cfg = config(1);
        cfg.pipeline.dispose_timeout_secs = 0.2;
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut pipeline = PipelineCoordinator::new(cfg);
        pipeline
            .initialize(Box::new(StuckEngine(release_rx)))
            .unwrap();
        assert_eq!(pipeline.process_frame(frame(0)).unwrap(), FrameAdmission::Accepted);
        // 仍在健康超时之内
        assert!(pipeline.health().is_healthy);

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let disposer = thread::spawn(move || {
            pipeline.dispose();
            let _ = done_tx.send(pipeline.state());
        });
        let state = done_rx.recv_timeout(Duration::from_secs(3));
        assert_eq!(state, Ok(PipelineState::Disposed));
        disposer.join().unwrap();
        drop(release_tx);
    }

    #[test]
    fn test_drop_with_stuck_engine_returns() {
        let mut cfg = config(1);
        cfg.pipeline.dispose_timeout_secs = 0.1;
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let started = Instant::now();
        {
            let mut pipeline = PipelineCoordinator::new(cfg);
            pipeline
                .initialize(Box::new(StuckEngine(release_rx)))
                .unwrap();
            pipeline.process_frame(frame(0)).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(release_tx);
    }

    #[test]
    fn test_restart_gives_new_worker_its_own_reset_flag() {
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let mut pipeline = PipelineCoordinator::new(config(1));
        pipeline
            .initialize(Box::new(StuckEngine(release_rx)))
            .unwrap();
        let old_flag = Arc::clone(&pipeline.reset_tracks);

        pipeline
            .restart(Box::new(ReplayEngine::new(vec![], 2)))
            .unwrap();
        pipeline.reset();
        assert!(!Arc::ptr_eq(&old_flag, &pipeline.reset_tracks));
        assert!(!old_flag.load(Ordering::Acquire));
        assert!(pipeline.reset_tracks.load(Ordering::Acquire));
        drop(release_tx);
        pipeline.dispose();
    }

    #[test]
    fn test_initialize_rejects_invalid_timeouts() {
        let mut cfg = config(1);
        cfg.pipeline.ready_timeout_secs = -1.0;
        let mut pipeline = PipelineCoordinator::new(cfg);
        assert!(matches!(
            pipeline.initialize(Box::new(ReplayEngine::new(vec![], 2))),
            Err(TrackerError::InvalidConfig(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut pipeline = PipelineCoordinator::new(config(1));
        pipeline
            .initialize(Box::new(ReplayEngine::new(vec![], 2)))
            .unwrap();
        pipeline.dispose();
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Disposed);
        assert!(matches!(
            pipeline.initialize(Box::new(ReplayEngine::new(vec![], 2))),
            Err(TrackerError::Disposed)
        ));
    }
}
