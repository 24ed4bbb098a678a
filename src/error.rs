// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型 (Error taxonomy)
//!
//! - 输入异常 / 数值不稳定 / 过载 / 工作线程故障: 在核心内部恢复
//! - 存活性故障: 通过 `PipelineHealth` 暴露,不以错误形式抛出

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// 模型输出张量维度不合法
    #[error("malformed tensor: {0}")]
    MalformedTensor(String),

    /// 帧数据不合法 (尺寸为0、缓冲区不足等)
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// 协方差不可逆、出现NaN/Inf
    #[error("numerical instability: {0}")]
    NumericalInstability(&'static str),

    #[error("pipeline is not initialized")]
    NotInitialized,

    #[error("pipeline is already initialized")]
    AlreadyInitialized,

    #[error("pipeline has been disposed")]
    Disposed,

    /// 工作线程未在规定时间内就绪
    #[error("worker did not signal readiness within {0:?}")]
    WorkerStartup(Duration),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
