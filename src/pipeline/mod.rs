// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧处理流水线 (Frame Processing Pipeline)
///
/// 双线程架构,通过有界 crossbeam 通道通信:
/// - Worker:  预处理 → 推理 → 解码 → 卡尔曼平滑 (独立线程)
/// - Monitor: 汇集结果、健康检查 (独立线程)
/// - 调用方线程只做抽帧判断与 `try_send`,永不阻塞
pub mod coordinator;
pub mod health;
pub mod worker;

use std::time::Duration;

use serde::Serialize;

use crate::detection::{BoundingBox, PlanarYuv, Position};

pub use coordinator::PipelineCoordinator;
pub use health::PipelineHealth;
pub use worker::FrameWorker;

// ========== 通道消息类型定义 ==========

/// 原始帧 (调用方 → 工作线程),数据为 YUV 4:2:0 平面格式
#[derive(Clone, Debug)]
pub struct FrameRequest {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub row_stride: usize,
    pub uv_stride: usize,
    pub frame_id: u64,
    pub capture_timestamp: Duration,
}

impl FrameRequest {
    /// 紧凑排列 (无行填充) 的纯色帧,色度为中性灰
    pub fn filled(
        width: u32,
        height: u32,
        luma: u8,
        frame_id: u64,
        capture_timestamp: Duration,
    ) -> Self {
        let row_stride = width as usize;
        let uv_stride = (width as usize + 1) / 2;
        let chroma_rows = (height as usize + 1) / 2;
        let mut data = vec![luma; row_stride * height as usize];
        data.resize(data.len() + 2 * uv_stride * chroma_rows, 128);
        Self {
            data,
            width,
            height,
            row_stride,
            uv_stride,
            frame_id,
            capture_timestamp,
        }
    }

    pub fn planes(&self) -> PlanarYuv<'_> {
        PlanarYuv {
            data: &self.data,
            width: self.width,
            height: self.height,
            row_stride: self.row_stride,
            uv_stride: self.uv_stride,
        }
    }
}

/// 单帧处理结果 (工作线程 → 调用方),每个被处理的帧恰好一个
#[derive(Clone, Debug, Serialize)]
pub struct FrameResult {
    pub frame_id: u64,
    pub timestamp: Duration,
    pub detections: Vec<BoundingBox>,
    /// 本帧检测到球时的平滑位置
    pub smoothed_ball_center: Option<Position>,
    pub smoothed_club_center: Option<Position>,
    /// 下一帧球位置预测 (丢失时滑行)
    pub predicted_ball_center: Option<Position>,
    pub ball_confidence: f32,
    pub ball_speed: f32,   // m/s
    pub launch_angle: f32, // 度, 向上为正
    pub processing_ms: f64,
}

/// 单帧处理失败的诊断信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerFault {
    pub frame_id: Option<u64>,
    pub message: String,
}

/// 结果通道中的事件
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    Result(FrameResult),
    Fault(WorkerFault),
}

/// `process_frame` 的准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
    /// 已送入工作线程
    Accepted,
    /// 抽帧丢弃
    Decimated,
    /// 工作线程仍有未取走的帧
    BackPressure,
    /// 流水线不健康
    Unhealthy,
}

impl FrameAdmission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FrameAdmission::Accepted)
    }
}

/// 流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    Processing,
    Degraded,
    Disposed,
}

/// 工作线程 → 监控线程
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Ready,
    EngineLoaded(String),
    EngineFailed(String),
    Result(FrameResult),
    Fault(WorkerFault),
}
