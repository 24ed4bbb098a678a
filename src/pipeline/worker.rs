// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 帧处理工作线程 (Frame processing worker)
//! 职责: 接收FrameRequest → 预处理 → 推理 → 解码 → 卡尔曼平滑 → 发送FrameResult

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::{FrameRequest, FrameResult, WorkerFault, WorkerMessage};
use crate::config::{CalibrationConfig, EstimatorConfig, GolfConfig};
use crate::detection::{
    best_of_class, BoundingBox, DetectionDecoder, ObjectClass, Position, Preprocessor,
};
use crate::inference::InferenceEngine;
use crate::tracking::PositionEstimator;

/// 单个目标的平滑轨迹 (球 / 杆头各一个)
struct ObjectTrack {
    estimator: PositionEstimator,
    missed: u32,
    max_missed: u32,
}

impl ObjectTrack {
    fn new(config: &EstimatorConfig, dt: f64) -> Self {
        Self {
            estimator: PositionEstimator::new(config.clone(), dt),
            missed: 0,
            max_missed: config.max_missed_frames,
        }
    }

    /// 有检测时修正,无检测时滑行; 仅在本帧检测到时返回平滑位置
    fn observe(&mut self, detection: Option<&BoundingBox>) -> Option<Position> {
        match detection {
            Some(b) => {
                self.missed = 0;
                Some(self.estimator.update(b.center(), Some(b.confidence())))
            }
            None => {
                if !self.estimator.is_initialized() {
                    return None;
                }
                self.missed += 1;
                if self.missed > self.max_missed {
                    debug!("👋 连续{}帧未检测到,丢弃轨迹", self.missed);
                    self.clear();
                } else {
                    self.estimator.predict();
                }
                None
            }
        }
    }

    fn clear(&mut self) {
        self.estimator.clear();
        self.missed = 0;
    }

    /// (速度 m/s, 角度°); 图像y轴向下,向上飞行角度为正
    fn motion(&self, pixels_per_meter: f32) -> (f32, f32) {
        let Some((vx, vy)) = self.estimator.velocity() else {
            return (0.0, 0.0);
        };
        let speed = (vx * vx + vy * vy).sqrt() / pixels_per_meter;
        if !speed.is_finite() || speed <= 0.0 {
            return (0.0, 0.0);
        }
        (speed, (-vy).atan2(vx.abs()).to_degrees())
    }
}

/// 帧处理器: 独占解码器、预处理器、推理引擎和两个估计器
pub struct FrameWorker {
    decoder: DetectionDecoder,
    preprocessor: Preprocessor,
    engine: Box<dyn InferenceEngine>,
    engine_ready: bool,
    ball: ObjectTrack,
    club: ObjectTrack,
    calibration: CalibrationConfig,
    log_interval: u64,

    // 统计
    total: u64,
    count: u64,
    last: Instant,
    current_fps: f64,
}

impl FrameWorker {
    pub fn new(config: &GolfConfig, engine: Box<dyn InferenceEngine>) -> Self {
        let dt = config.calibration.frame_interval_secs as f64;
        Self {
            decoder: DetectionDecoder::new(config.decoder.clone()),
            preprocessor: Preprocessor::new(config.decoder.input_size),
            engine,
            engine_ready: false,
            ball: ObjectTrack::new(&config.estimator, dt),
            club: ObjectTrack::new(&config.estimator, dt),
            calibration: config.calibration.clone(),
            log_interval: config.pipeline.log_interval_frames.max(1),
            total: 0,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// 加载推理引擎
    pub fn load(&mut self) -> anyhow::Result<()> {
        self.engine.load()?;
        self.engine_ready = true;
        Ok(())
    }

    /// 丢弃两条轨迹 (新一杆开始、或发生故障后)
    pub fn reset_tracks(&mut self) {
        self.ball.clear();
        self.club.clear();
    }

    /// 处理单帧; 错误与panic都转换为故障诊断,工作线程继续服务
    pub fn process(&mut self, request: FrameRequest) -> Result<FrameResult, WorkerFault> {
        let frame_id = request.frame_id;
        match panic::catch_unwind(AssertUnwindSafe(|| self.process_inner(request))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("❌ 帧{} 处理崩溃: {}", frame_id, message);
                self.reset_tracks();
                Err(WorkerFault {
                    frame_id: Some(frame_id),
                    message: format!("worker panicked: {}", message),
                })
            }
        }
    }

    fn process_inner(&mut self, request: FrameRequest) -> Result<FrameResult, WorkerFault> {
        let start_total = Instant::now();
        let frame_id = request.frame_id;
        let fault = |message: String| WorkerFault {
            frame_id: Some(frame_id),
            message,
        };

        // 1. 校验帧数据,异常帧按"无检测"处理
        let planes = request.planes();
        let detections = match planes.validate() {
            Err(e) => {
                warn!("⚠️ 帧{} 数据异常: {}", frame_id, e);
                Vec::new()
            }
            Ok(()) => {
                if !self.engine_ready {
                    return Err(fault("inference engine is not loaded".into()));
                }
                // 2. 预处理: YUV → RGB → Resize → NCHW
                let input = self
                    .preprocessor
                    .prepare(planes)
                    .map_err(|e| fault(e.to_string()))?;

                // 3. 推理
                let output = self
                    .engine
                    .infer(input)
                    .map_err(|e| fault(format!("inference failed: {:#}", e)))?;

                // 4. 解码 (原图坐标)
                self.decoder
                    .decode(output.view(), request.width, request.height)
            }
        };

        // 5. 每类取最高置信度,更新估计器
        let ball_box = best_of_class(&detections, ObjectClass::Ball).cloned();
        let club_box = best_of_class(&detections, ObjectClass::ClubHead).cloned();
        let smoothed_ball_center = self.ball.observe(ball_box.as_ref());
        let smoothed_club_center = self.club.observe(club_box.as_ref());

        // 6. 速度/角度
        let (ball_speed, launch_angle) = self.ball.motion(self.calibration.pixels_per_meter);

        let processing_ms = start_total.elapsed().as_secs_f64() * 1000.0;
        self.update_stats(processing_ms, ball_box.is_some(), club_box.is_some());

        Ok(FrameResult {
            frame_id,
            timestamp: request.capture_timestamp,
            detections,
            smoothed_ball_center,
            smoothed_club_center,
            predicted_ball_center: self.ball.estimator.predicted_position(),
            ball_confidence: self.ball.estimator.confidence_score(),
            ball_speed,
            launch_angle,
            processing_ms,
        })
    }

    fn update_stats(&mut self, total_ms: f64, ball: bool, club: bool) {
        self.total += 1;
        self.count += 1;
        let now = Instant::now();
        if now.duration_since(self.last).as_secs() >= 1 {
            self.current_fps = self.count as f64 / now.duration_since(self.last).as_secs_f64();
            self.count = 0;
            self.last = now;
        }

        // 每N帧打印一次
        if self.total % self.log_interval == 0 {
            info!(
                "🎯 检测: 球{} 杆{} | {:.1}ms/帧 | {:.1}fps",
                if ball { "✓" } else { "✗" },
                if club { "✓" } else { "✗" },
                total_ms,
                self.current_fps
            );
        }
    }

    /// 工作线程主循环: 先发送就绪信号,再加载引擎,然后逐帧处理直到请求通道关闭
    pub(crate) fn run(
        mut self,
        requests: Receiver<FrameRequest>,
        messages: Sender<WorkerMessage>,
        reset: Arc<AtomicBool>,
    ) {
        info!("🔍 检测工作线程启动");
        if messages.send(WorkerMessage::Ready).is_err() {
            return;
        }

        let loaded = match self.load() {
            Ok(()) => WorkerMessage::EngineLoaded(self.engine_name().to_string()),
            Err(e) => WorkerMessage::EngineFailed(format!("{:#}", e)),
        };
        if messages.send(loaded).is_err() {
            return;
        }

        while let Ok(request) = requests.recv() {
            if reset.swap(false, Ordering::AcqRel) {
                self.reset_tracks();
            }
            let message = match self.process(request) {
                Ok(result) => WorkerMessage::Result(result),
                Err(fault) => WorkerMessage::Fault(fault),
            };
            if messages.send(message).is_err() {
                break;
            }
        }
        info!("🛑 检测工作线程退出 (共处理 {} 帧)", self.total);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::OutputLayout;
    use crate::inference::{synthetic_output, Candidate, ReplayEngine};
    use ndarray::ArrayD;
    use std::time::Duration;

    const W: u32 = 64;
    const H: u32 = 64;

    fn config() -> GolfConfig {
        let mut config = GolfConfig::default();
        config.decoder.input_size = 64;
        config.calibration.frame_interval_secs = 0.01;
        config.calibration.pixels_per_meter = 10.0;
        config
    }

    fn frame(id: u64) -> FrameRequest {
        FrameRequest::filled(W, H, 100, id, Duration::from_millis(id * 10))
    }

    fn ball_at(x: f32, y: f32) -> ArrayD<f32> {
        let c = Candidate {
            center: Position::new(x, y),
            width: 4.,
            height: 4.,
            class: ObjectClass::Ball,
            score: 0.9,
        };
        synthetic_output(OutputLayout::BoxMajor, &[c], 2, 4)
    }

    struct PanicEngine {
        calls: u32,
    }

    impl InferenceEngine for PanicEngine {
        fn infer(&mut self, _input: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("boom");
            }
            Ok(ball_at(10., 10.))
        }
    }

    #[test]
    fn test_unloaded_engine_is_a_fault() {
        let mut worker = FrameWorker::new(&config(), Box::new(ReplayEngine::new(vec![], 2)));
        let fault = worker.process(frame(1)).unwrap_err();
        assert_eq!(fault.frame_id, Some(1));
    }

    #[test]
    fn test_detection_and_velocity() {
        let outputs = (0..10).map(|i| ball_at(10. + 2. * i as f32, 40.)).collect();
        let mut worker = FrameWorker::new(&config(), Box::new(ReplayEngine::new(outputs, 2)));
        worker.load().unwrap();

        let mut last = None;
        for id in 0..10 {
            last = Some(worker.process(frame(id)).unwrap());
        }
        let result = last.unwrap();
        assert_eq!(result.frame_id, 9);
        assert_eq!(result.detections.len(), 1);
        let center = result.smoothed_ball_center.unwrap();
        assert!((center.x - 28.).abs() < 1.0, "{:?}", center);
        // 2px / 0.01s = 200 px/s = 20 m/s, 水平运动
        assert!((result.ball_speed - 20.).abs() < 2.0, "{}", result.ball_speed);
        assert!(result.launch_angle.abs() < 3.0);
        assert!(result.smoothed_club_center.is_none());
    }

    #[test]
    fn test_malformed_frame_yields_empty_result() {
        let mut worker = FrameWorker::new(&config(), Box::new(ReplayEngine::new(vec![], 2)));
        worker.load().unwrap();
        let mut bad = frame(3);
        bad.data.truncate(10);
        let result = worker.process(bad).unwrap();
        assert!(result.detections.is_empty());
        assert!(result.smoothed_ball_center.is_none());
    }

    #[test]
    fn test_panic_is_isolated() {
        let mut worker = FrameWorker::new(&config(), Box::new(PanicEngine { calls: 0 }));
        worker.load().unwrap();
        let fault = worker.process(frame(1)).unwrap_err();
        assert!(fault.message.contains("boom"));
        let result = worker.process(frame(2)).unwrap();
        assert_eq!(result.detections.len(), 1);
    }

    #[test]
    fn test_track_dropped_after_misses() {
        let mut outputs = vec![ball_at(20., 20.)];
        outputs.extend((0..11).map(|_| synthetic_output(OutputLayout::BoxMajor, &[], 2, 4)));
        let mut worker = FrameWorker::new(&config(), Box::new(ReplayEngine::new(outputs, 2)));
        worker.load().unwrap();

        let first = worker.process(frame(0)).unwrap();
        assert!(first.predicted_ball_center.is_some());
        let mut last = first;
        for id in 1..12 {
            last = worker.process(frame(id)).unwrap();
        }
        assert!(last.predicted_ball_center.is_none());
    }
}
