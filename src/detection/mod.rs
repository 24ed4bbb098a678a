// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测系统 (Detection System)
///
/// - types:      检测框 / 坐标 / 类别
/// - decoder:    YOLO 原始输出解码 + 按类别NMS
/// - preprocess: YUV420 → RGB → 模型输入张量
pub mod decoder;
pub mod preprocess;
pub mod types;

pub use decoder::{non_max_suppression, DetectionDecoder, OutputLayout, OutputShape};
pub use preprocess::{PlanarYuv, Preprocessor};
pub use types::{best_of_class, BoundingBox, ObjectClass, Position};
