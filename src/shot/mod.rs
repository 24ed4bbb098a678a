// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 击球生命周期 (Shot Lifecycle)
///
/// - lifecycle: 状态机 Idle → ... → Complete,产生事件
/// - metrics:   球速 / 出球角度 / 飞行距离
/// - record:    击球记录与持久化接口
pub mod lifecycle;
pub mod metrics;
pub mod record;

pub use lifecycle::{CancelReason, ShotEvent, ShotLifecycleController, ShotState};
pub use metrics::{carry_distance, launch_metrics, LaunchMetrics};
pub use record::{CompletionReason, JsonLinesSink, ShotMetadata, ShotRecord, ShotRecordSink};
