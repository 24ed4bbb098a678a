// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 参数配置 - 通过JSON文件调整参数

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TrackerError};

/// 全部参数
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GolfConfig {
    pub decoder: DecoderConfig,
    pub estimator: EstimatorConfig,
    pub pipeline: PipelineConfig,
    pub shot: ShotConfig,
    pub calibration: CalibrationConfig,
}

/// 检测解码参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub conf_threshold: f32, // 检测置信度阈值
    pub iou_threshold: f32,  // NMS IOU阈值
    pub input_size: u32,     // 模型输入尺寸 (正方形)
    /// 类别数; `None` 时按较短轴推断布局
    pub num_classes: Option<usize>,
    /// 输出坐标是否归一化到 [0,1] (部分TFLite导出)
    pub normalized_coordinates: bool,
    pub class_names: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            input_size: 640,
            num_classes: Some(2),
            normalized_coordinates: false,
            class_names: vec!["ball".to_string(), "club_head".to_string()],
        }
    }
}

/// 卡尔曼滤波参数 (像素 / 秒 单位)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub process_noise_position: f64,   // 位置过程噪声
    pub process_noise_velocity: f64,   // 速度过程噪声
    pub measurement_noise: f64,        // 观测噪声
    pub initial_velocity_variance: f64, // 初始速度方差
    pub residual_history: usize,       // 残差历史长度
    pub outlier_sigma: f64,            // 离群判定: 均值 + k·σ
    pub outlier_min_distance: f64,     // 离群判定下限 (像素)
    pub max_consecutive_outliers: u32, // 连续离群次数达到后重新捕获
    pub max_missed_frames: u32,        // 连续丢失帧数达到后丢弃轨迹
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            process_noise_position: 1.0,
            process_noise_velocity: 50.0,
            measurement_noise: 4.0,
            initial_velocity_variance: 1.0e6,
            residual_history: 10,
            outlier_sigma: 3.0,
            outlier_min_distance: 3.0,
            max_consecutive_outliers: 3,
            max_missed_frames: 10,
        }
    }
}

/// 流水线调度参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_skip: u32,                // 每N帧处理一帧
    pub request_capacity: usize,        // 请求通道容量
    pub result_capacity: usize,         // 结果通道容量
    pub ready_timeout_secs: f64,        // 工作线程就绪等待
    pub health_check_interval_secs: f64, // 健康检查周期
    pub unhealthy_timeout_secs: f64,    // 无结果超过该时长判定不健康
    pub restart_timeout_secs: f64,      // 持续不健康超过该时长建议重启
    pub dispose_timeout_secs: f64,      // 释放时等待工作线程退出的上限
    pub log_interval_frames: u64,       // 吞吐日志间隔
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            request_capacity: 1,
            result_capacity: 64,
            ready_timeout_secs: 5.0,
            health_check_interval_secs: 5.0,
            unhealthy_timeout_secs: 10.0,
            restart_timeout_secs: 30.0,
            dispose_timeout_secs: 2.0,
            log_interval_frames: 60,
        }
    }
}

impl PipelineConfig {
    pub fn ready_timeout(&self) -> Duration {
        seconds(self.ready_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        seconds(self.health_check_interval_secs)
    }

    pub fn unhealthy_timeout(&self) -> Duration {
        seconds(self.unhealthy_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        seconds(self.restart_timeout_secs)
    }

    pub fn dispose_timeout(&self) -> Duration {
        seconds(self.dispose_timeout_secs)
    }
}

/// 秒数上限 (一年),保证 `Instant + Duration` 不溢出
const MAX_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// 秒数 → Duration: 负数/NaN 取 0,过大值截断
fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(value.min(MAX_SECS))
}

fn check_secs(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 && value <= MAX_SECS {
        Ok(())
    } else {
        Err(TrackerError::InvalidConfig(format!(
            "{} must be a positive number of seconds, got {}",
            name, value
        )))
    }
}

/// 击球状态机参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShotConfig {
    pub club_approach_distance: f32, // 球杆接近判定 (像素)
    /// 击球判定距离; `None` 时取接近距离的一半
    pub impact_distance: Option<f32>,
    pub min_flight_speed: f32,      // 最低飞行速度 (m/s)
    pub min_trajectory_points: usize,
    pub landing_miss_frames: u32,   // 飞行中连续丢失帧数 → 落地
    pub tracking_timeout_secs: f64, // 单次追踪硬超时
    pub metrics_window: usize,      // 速度/角度计算窗口
    pub max_carry_distance: f32,    // 飞行距离上限 (m)
    pub gravity: f32,
    pub max_trajectory_points: usize,
}

impl Default for ShotConfig {
    fn default() -> Self {
        Self {
            club_approach_distance: 50.0,
            impact_distance: None,
            min_flight_speed: 5.0,
            min_trajectory_points: 5,
            landing_miss_frames: 10,
            tracking_timeout_secs: 10.0,
            metrics_window: 5,
            max_carry_distance: 300.0,
            gravity: 9.81,
            max_trajectory_points: 512,
        }
    }
}

impl ShotConfig {
    pub fn impact_distance(&self) -> f32 {
        self.impact_distance
            .unwrap_or(self.club_approach_distance / 2.0)
    }

    pub fn tracking_timeout(&self) -> Duration {
        seconds(self.tracking_timeout_secs)
    }
}

/// 标定常量 (由外部提供,不在内部推导)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub pixels_per_meter: f32,
    /// 相邻两次处理帧之间的有效时间间隔 (已考虑抽帧)
    pub frame_interval_secs: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            pixels_per_meter: 100.0,
            frame_interval_secs: 1.0 / 120.0,
        }
    }
}

impl GolfConfig {
    /// 从JSON文件加载配置,失败时回退默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::from_file(path) {
            Ok(config) => {
                info!("✅ 配置已从 {} 加载", path.display());
                config
            }
            Err(TrackerError::Io(_)) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("❌ 保存配置失败: {}", e);
                }
                config
            }
            Err(e) => {
                warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                Self::default()
            }
        }
    }

    /// 严格加载: 读取、解析并校验
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        info!("💾 配置已保存到 {}", path.as_ref().display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.decoder;
        if !(0.0..=1.0).contains(&d.conf_threshold) || !(0.0..=1.0).contains(&d.iou_threshold) {
            return Err(TrackerError::InvalidConfig(
                "decoder thresholds must lie in [0, 1]".into(),
            ));
        }
        if d.input_size == 0 {
            return Err(TrackerError::InvalidConfig("decoder.input_size is 0".into()));
        }
        if self.pipeline.frame_skip == 0 || self.pipeline.request_capacity == 0 {
            return Err(TrackerError::InvalidConfig(
                "pipeline.frame_skip and pipeline.request_capacity must be >= 1".into(),
            ));
        }
        if self.estimator.residual_history < 3 || self.estimator.measurement_noise <= 0.0 {
            return Err(TrackerError::InvalidConfig(
                "estimator needs residual_history >= 3 and a positive measurement_noise".into(),
            ));
        }
        let pipeline = &self.pipeline;
        for (name, value) in [
            ("pipeline.ready_timeout_secs", pipeline.ready_timeout_secs),
            ("pipeline.health_check_interval_secs", pipeline.health_check_interval_secs),
            ("pipeline.unhealthy_timeout_secs", pipeline.unhealthy_timeout_secs),
            ("pipeline.restart_timeout_secs", pipeline.restart_timeout_secs),
            ("pipeline.dispose_timeout_secs", pipeline.dispose_timeout_secs),
            ("shot.tracking_timeout_secs", self.shot.tracking_timeout_secs),
        ] {
            check_secs(name, value)?;
        }
        let c = &self.calibration;
        let positive = |v: f32| v.is_finite() && v > 0.0;
        if !positive(c.pixels_per_meter) || !positive(c.frame_interval_secs) {
            return Err(TrackerError::InvalidConfig(
                "calibration constants must be positive".into(),
            ));
        }
        if self.shot.impact_distance() > self.shot.club_approach_distance {
            return Err(TrackerError::InvalidConfig(
                "shot.impact_distance exceeds shot.club_approach_distance".into(),
            ));
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前配置:");
        info!(
            "  检测置信度: {:.2} | NMS IOU: {:.2} | 输入尺寸: {}",
            self.decoder.conf_threshold, self.decoder.iou_threshold, self.decoder.input_size
        );
        info!(
            "  抽帧: 1/{} | 健康超时: {:.0}s",
            self.pipeline.frame_skip, self.pipeline.unhealthy_timeout_secs
        );
        info!(
            "  接近/击球距离: {:.0}px / {:.0}px",
            self.shot.club_approach_distance,
            self.shot.impact_distance()
        );
        info!(
            "  标定: {:.1} px/m, 帧间隔 {:.2}ms",
            self.calibration.pixels_per_meter,
            self.calibration.frame_interval_secs * 1000.0
        );
    }
}
