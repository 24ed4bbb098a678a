// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 击球参数计算 (Launch metrics)

use crate::config::{CalibrationConfig, ShotConfig};
use crate::detection::Position;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LaunchMetrics {
    pub ball_speed: f32,     // m/s
    pub launch_angle: f32,   // 度
    pub carry_distance: f32, // m
}

/// 由飞行初段 (前 `metrics_window` 个轨迹点) 计算出球参数
pub fn launch_metrics(
    trajectory: &[Position],
    shot: &ShotConfig,
    calibration: &CalibrationConfig,
) -> LaunchMetrics {
    let n = trajectory.len().min(shot.metrics_window.max(2));
    if n < 2 {
        return LaunchMetrics::default();
    }
    let (first, last) = (trajectory[0], trajectory[n - 1]);
    let steps = (n - 1) as f32;
    let dx = (last.x - first.x) / steps;
    let dy = (last.y - first.y) / steps;

    let speed = (dx * dx + dy * dy).sqrt()
        / calibration.frame_interval_secs
        / calibration.pixels_per_meter;
    if !speed.is_finite() || speed <= 0.0 {
        return LaunchMetrics::default();
    }
    // y轴向下,向上为正角度
    let angle = (-dy).atan2(dx.abs()).to_degrees();
    LaunchMetrics {
        ball_speed: speed,
        launch_angle: angle,
        carry_distance: carry_distance(speed, angle, shot.gravity, shot.max_carry_distance),
    }
}

/// 无空气阻力抛体射程 v²·sin(2θ)/g,裁剪到 [0, max]
pub fn carry_distance(speed: f32, angle_deg: f32, gravity: f32, max: f32) -> f32 {
    if gravity <= 0.0 {
        return 0.0;
    }
    let carry = speed * speed * (2.0 * angle_deg.to_radians()).sin() / gravity;
    if carry.is_finite() {
        carry.clamp(0.0, max)
    } else {
        0.0
    }
}
