// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 高尔夫击球追踪核心 (Golf shot tracking core)
//!
//! 数据流向:
//! ```text
//! FrameRequest → [Worker: 预处理 → 推理 → 解码 → 卡尔曼平滑] → FrameResult
//!              → ShotLifecycleController → ShotRecord
//! ```
pub mod config; // 参数配置
pub mod detection; // 检测解码
pub mod error; // 错误类型
pub mod inference; // 推理引擎接口
pub mod pipeline; // 工作线程与调度
pub mod session; // 流水线 + 状态机组合
pub mod shot; // 击球生命周期
pub mod synthetic; // 合成挥杆脚本
pub mod tracking; // 位置估计

pub use crate::config::{
    CalibrationConfig, DecoderConfig, EstimatorConfig, GolfConfig, PipelineConfig, ShotConfig,
};
pub use crate::detection::{BoundingBox, DetectionDecoder, ObjectClass, OutputLayout, Position};
pub use crate::error::{Result, TrackerError};
pub use crate::inference::{InferenceEngine, ReplayEngine};
pub use crate::pipeline::{
    FrameAdmission, FrameRequest, FrameResult, PipelineCoordinator, PipelineEvent,
    PipelineHealth, PipelineState, WorkerFault,
};
pub use crate::session::ShotSession;
pub use crate::shot::{
    JsonLinesSink, ShotEvent, ShotLifecycleController, ShotRecord, ShotRecordSink, ShotState,
};
pub use crate::tracking::{PositionEstimator, UpdateOutcome};
