// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 位置估计 (Position Estimation)
///
/// - kalman: 匀速模型卡尔曼滤波,自适应噪声 + 离群剔除
pub mod kalman;

pub use kalman::{PositionEstimator, UpdateOutcome};
