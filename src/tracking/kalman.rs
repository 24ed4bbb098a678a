// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 卡尔曼位置估计器 (Kalman position estimator)
//!
//! 状态向量: [x, y, vx, vy] (像素, 像素/秒)
//! 观测: 仅位置 (检测框中心)

use std::collections::VecDeque;

use nalgebra::{Cholesky, Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use tracing::debug;

use crate::config::EstimatorConfig;
use crate::detection::Position;
use crate::error::TrackerError;

/// 单次更新的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 首次观测,以观测值初始化
    Initialized,
    /// 正常修正
    Corrected,
    /// 离群观测,仅预测不修正
    OutlierRejected,
    /// 连续离群达到上限,以新观测重新捕获
    Reacquired,
    /// 数值异常,回滚到更新前状态
    Skipped,
}

/// 滤波器内部状态 (仅由所属估计器修改)
#[derive(Clone, Debug)]
struct TrackState {
    x: Vector4<f64>,
    p: Matrix4<f64>,
    residuals: VecDeque<f64>,
    /// 最近一次被接受的位置
    last_accepted: Vector2<f64>,
    /// 距最近一次被接受观测的预测步数
    steps_since_accepted: u32,
}

/// 匀速模型卡尔曼滤波器,带自适应噪声与离群剔除
#[derive(Clone, Debug)]
pub struct PositionEstimator {
    config: EstimatorConfig,
    dt: f64,
    state: Option<TrackState>,
    consecutive_outliers: u32,
}

/// 置信度 → 噪声倍率: 置信度越低越信任运动模型
pub(crate) fn noise_multiplier(confidence: Option<f32>) -> f64 {
    match confidence {
        Some(c) if c.is_finite() => (2.0 - c as f64).clamp(0.1, 5.0),
        _ => 1.0,
    }
}

impl PositionEstimator {
    pub fn new(config: EstimatorConfig, dt: f64) -> Self {
        Self {
            config,
            dt: if dt.is_finite() && dt > 0.0 { dt } else { 1.0 / 30.0 },
            state: None,
            consecutive_outliers: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// 以给定位置和速度重新开始跟踪
    pub fn reset(&mut self, position: Position, vx: f32, vy: f32) {
        let r = self.config.measurement_noise;
        let v0 = self.config.initial_velocity_variance;
        let (vx, vy) = if vx.is_finite() && vy.is_finite() {
            (vx as f64, vy as f64)
        } else {
            (0.0, 0.0)
        };
        self.state = Some(TrackState {
            x: Vector4::new(position.x as f64, position.y as f64, vx, vy),
            p: Matrix4::from_diagonal(&Vector4::new(r, r, v0, v0)),
            residuals: VecDeque::with_capacity(self.config.residual_history),
            last_accepted: Vector2::new(position.x as f64, position.y as f64),
            steps_since_accepted: 0,
        });
        self.consecutive_outliers = 0;
    }

    /// 丢弃轨迹,下一次观测重新初始化
    pub fn clear(&mut self) {
        self.state = None;
        self.consecutive_outliers = 0;
    }

    /// 当前平滑位置
    pub fn position(&self) -> Option<Position> {
        self.state.as_ref().map(|s| to_position(s.x[0], s.x[1]))
    }

    /// 当前速度 (像素/秒)
    pub fn velocity(&self) -> Option<(f32, f32)> {
        self.state.as_ref().map(|s| (s.x[2] as f32, s.x[3] as f32))
    }

    /// 速度大小 (像素/秒)
    pub fn speed(&self) -> f32 {
        self.velocity()
            .map(|(vx, vy)| (vx * vx + vy * vy).sqrt())
            .unwrap_or(0.0)
    }

    /// 下一帧位置预测 (当前状态前推一个 dt)
    pub fn predicted_position(&self) -> Option<Position> {
        self.state
            .as_ref()
            .map(|s| to_position(s.x[0] + s.x[2] * self.dt, s.x[1] + s.x[3] * self.dt))
    }

    /// 跟踪置信度 [0,1]: 协方差越小、残差越稳定越高
    pub fn confidence_score(&self) -> f32 {
        let Some(state) = self.state.as_ref() else {
            return 0.0;
        };
        let r = self.config.measurement_noise;
        let position_variance = (state.p[(0, 0)] + state.p[(1, 1)]) / 2.0;
        let certainty = r / (r + position_variance.max(0.0));
        let consistency = if state.residuals.is_empty() {
            0.5
        } else {
            let mean = state.residuals.iter().sum::<f64>() / state.residuals.len() as f64;
            1.0 / (1.0 + mean / r.sqrt())
        };
        let score = 0.5 * (certainty + consistency);
        if score.is_finite() {
            score.clamp(0.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// 无观测时仅做预测 (滑行)
    pub fn predict(&mut self) -> Option<Position> {
        let state = self.state.as_ref()?;
        let (x, p) = self.propagate(state, 1.0);
        if !all_finite(&x) || !p.iter().all(|v| v.is_finite()) {
            debug!("⚠️ 预测出现非有限值,保持原状态");
            return self.position();
        }
        if let Some(state) = self.state.as_mut() {
            state.x = x;
            state.p = p;
            state.steps_since_accepted = state.steps_since_accepted.saturating_add(1);
        }
        self.position()
    }

    /// 融合一次观测,返回平滑后的位置
    pub fn update(&mut self, measurement: Position, confidence: Option<f32>) -> Position {
        self.update_detailed(measurement, confidence).0
    }

    pub fn update_detailed(
        &mut self,
        measurement: Position,
        confidence: Option<f32>,
    ) -> (Position, UpdateOutcome) {
        if !measurement.is_finite() {
            return (
                self.position().unwrap_or_default(),
                UpdateOutcome::Skipped,
            );
        }
        let Some(snapshot) = self.state.clone() else {
            self.reset(measurement, 0.0, 0.0);
            return (measurement, UpdateOutcome::Initialized);
        };

        let m = noise_multiplier(confidence);

        // 1. 预测
        let (x_pred, p_pred) = self.propagate(&snapshot, m);
        if !all_finite(&x_pred) || !p_pred.iter().all(|v| v.is_finite()) {
            return (to_position(snapshot.x[0], snapshot.x[1]), UpdateOutcome::Skipped);
        }

        let z = Vector2::new(measurement.x as f64, measurement.y as f64);
        let innovation = z - Vector2::new(x_pred[0], x_pred[1]);
        let distance = innovation.norm();

        // 2. 离群检验
        if self.is_outlier(&snapshot.residuals, distance) {
            self.consecutive_outliers += 1;
            if self.consecutive_outliers >= self.config.max_consecutive_outliers.max(1) {
                // 连续离群: 目标运动状态已改变 (如击球瞬间),重新捕获
                let steps = (snapshot.steps_since_accepted + 1) as f64;
                let v = (z - snapshot.last_accepted) / (steps * self.dt);
                debug!(
                    "🔄 连续{}次离群,重新捕获 @ ({:.1}, {:.1})",
                    self.consecutive_outliers, measurement.x, measurement.y
                );
                self.reset(measurement, v[0] as f32, v[1] as f32);
                return (measurement, UpdateOutcome::Reacquired);
            }
            if let Some(state) = self.state.as_mut() {
                state.x = x_pred;
                state.p = p_pred;
                state.steps_since_accepted = state.steps_since_accepted.saturating_add(1);
            }
            return (to_position(x_pred[0], x_pred[1]), UpdateOutcome::OutlierRejected);
        }

        // 3. 修正
        match self.correct(&x_pred, &p_pred, &innovation, m) {
            Ok((x, p)) => {
                let capacity = self.config.residual_history.max(1);
                if let Some(state) = self.state.as_mut() {
                    state.x = x;
                    state.p = p;
                    if state.residuals.len() >= capacity {
                        state.residuals.pop_front();
                    }
                    state.residuals.push_back(distance);
                    state.last_accepted = Vector2::new(x[0], x[1]);
                    state.steps_since_accepted = 0;
                }
                self.consecutive_outliers = 0;
                (to_position(x[0], x[1]), UpdateOutcome::Corrected)
            }
            Err(e) => {
                debug!("⚠️ 卡尔曼更新失败 ({}),回滚", e);
                self.state = Some(snapshot);
                (
                    self.position().unwrap_or(measurement),
                    UpdateOutcome::Skipped,
                )
            }
        }
    }

    fn transition(&self) -> Matrix4<f64> {
        let dt = self.dt;
        Matrix4::new(
            1.0, 0.0, dt, 0.0, //
            0.0, 1.0, 0.0, dt, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn observation() -> Matrix2x4<f64> {
        Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0,
        )
    }

    fn propagate(&self, state: &TrackState, m: f64) -> (Vector4<f64>, Matrix4<f64>) {
        let f = self.transition();
        let qp = self.config.process_noise_position;
        let qv = self.config.process_noise_velocity;
        let q = Matrix4::from_diagonal(&Vector4::new(qp, qp, qv, qv)) * m;
        (f * state.x, f * state.p * f.transpose() + q)
    }

    fn is_outlier(&self, residuals: &VecDeque<f64>, distance: f64) -> bool {
        if residuals.len() < 3 {
            return false;
        }
        let n = residuals.len() as f64;
        let mean = residuals.iter().sum::<f64>() / n;
        let variance = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        let spread = mean + self.config.outlier_sigma * variance.sqrt();
        distance > spread.max(self.config.outlier_min_distance)
    }

    fn correct(
        &self,
        x: &Vector4<f64>,
        p: &Matrix4<f64>,
        innovation: &Vector2<f64>,
        m: f64,
    ) -> Result<(Vector4<f64>, Matrix4<f64>), TrackerError> {
        let h = Self::observation();
        let r = Matrix2::identity() * (self.config.measurement_noise * m);

        let s = h * p * h.transpose() + r;
        let s_inv = s
            .try_inverse()
            .ok_or(TrackerError::NumericalInstability("singular innovation covariance"))?;
        let k = p * h.transpose() * s_inv;

        let x_new = x + k * innovation;
        // Joseph 形式,保持对称半正定
        let i_kh = Matrix4::identity() - k * h;
        let p_new = i_kh * p * i_kh.transpose() + k * r * k.transpose();
        let p_new = (p_new + p_new.transpose()) * 0.5;

        if !all_finite(&x_new) || !p_new.iter().all(|v| v.is_finite()) {
            return Err(TrackerError::NumericalInstability("non-finite state"));
        }
        Cholesky::new(p_new + Matrix4::identity() * 1e-9).ok_or(
            TrackerError::NumericalInstability("covariance is not positive definite"),
        )?;
        Ok((x_new, p_new))
    }
}

fn all_finite(x: &Vector4<f64>) -> bool {
    x.iter().all(|v| v.is_finite())
}

fn to_position(x: f64, y: f64) -> Position {
    Position::new(x as f32, y as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator(dt: f64) -> PositionEstimator {
        PositionEstimator::new(EstimatorConfig::default(), dt)
    }

    #[test]
    fn test_noise_multiplier_range() {
        assert_eq!(noise_multiplier(None), 1.0);
        assert!((noise_multiplier(Some(0.9)) - 1.1).abs() < 1e-6);
        assert!((noise_multiplier(Some(1.0)) - 1.0).abs() < 1e-6);
        assert_eq!(noise_multiplier(Some(1.95)), 0.1);
        assert_eq!(noise_multiplier(Some(-10.0)), 5.0);
        assert_eq!(noise_multiplier(Some(f32::NAN)), 1.0);
    }

    #[test]
    fn test_first_update_initializes() {
        let mut kf = estimator(1.0 / 30.0);
        assert!(!kf.is_initialized());
        assert_eq!(kf.confidence_score(), 0.0);
        let (p, outcome) = kf.update_detailed(Position::new(12., 34.), Some(0.9));
        assert_eq!(outcome, UpdateOutcome::Initialized);
        assert_eq!(p, Position::new(12., 34.));
        assert!(kf.is_initialized());
    }

    #[test]
    fn test_converges_to_constant_measurement() {
        let mut kf = estimator(1.0 / 30.0);
        kf.reset(Position::new(0., 0.), 0., 0.);
        let target = Position::new(50., 50.);
        let mut p = Position::default();
        for _ in 0..50 {
            p = kf.update(target, None);
        }
        assert!(p.distance(&target) < 1.0, "estimate {:?}", p);
    }

    #[test]
    fn test_linear_trajectory_average_error() {
        let mut kf = estimator(1.0 / 30.0);
        let mut total = 0.0;
        for i in 0..20 {
            let truth = Position::new(100. + 10. * i as f32, 100. - 5. * i as f32);
            let p = kf.update(truth, None);
            total += p.distance(&truth);
        }
        assert!(total / 20. < 2.0, "average error {}", total / 20.);
    }

    #[test]
    fn test_single_outlier_is_rejected() {
        let mut kf = estimator(1.0 / 30.0);
        let noise = [
            0.4, -0.3, 0.5, -0.6, 0.2, -0.1, 0.3, -0.4, 0.6, -0.2, 0.1, -0.5, 0.4, -0.3, 0.2,
        ];
        for i in 0..15 {
            let f = i as f32;
            let z = Position::new(200. + 4. * f + noise[i], 300. + 2. * f - noise[(i + 3) % 15]);
            kf.update(z, None);
        }
        let before = kf.position().unwrap();
        let jump = 50.0;
        let z = Position::new(200. + 4. * 15. + jump, 300. + 2. * 15.);
        let (after, outcome) = kf.update_detailed(z, None);
        assert_eq!(outcome, UpdateOutcome::OutlierRejected);
        assert!(after.distance(&before) < 0.2 * jump);
    }

    #[test]
    fn test_consecutive_outliers_reacquire() {
        let mut kf = estimator(1.0 / 30.0);
        for _ in 0..10 {
            kf.update(Position::new(100., 100.), None);
        }
        // 目标开始以 30 像素/帧 移动
        let mut outcomes = Vec::new();
        for k in 1..=3 {
            let z = Position::new(100. + 30. * k as f32, 100.);
            outcomes.push(kf.update_detailed(z, None).1);
        }
        assert_eq!(
            outcomes,
            vec![
                UpdateOutcome::OutlierRejected,
                UpdateOutcome::OutlierRejected,
                UpdateOutcome::Reacquired
            ]
        );
        assert_eq!(kf.position().unwrap(), Position::new(190., 100.));
        // 重新捕获时速度由间隔位移估计
        let (vx, vy) = kf.velocity().unwrap();
        assert!((vx - 900.).abs() < 1.0, "vx {}", vx);
        assert!(vy.abs() < 1e-3);
    }

    #[test]
    fn test_predicted_position_is_one_step_ahead() {
        let mut kf = estimator(0.5);
        kf.reset(Position::new(10., 20.), 4., -2.);
        assert_eq!(kf.predicted_position().unwrap(), Position::new(12., 19.));
        let coasted = kf.predict().unwrap();
        assert_eq!(coasted, Position::new(12., 19.));
    }

    #[test]
    fn test_degenerate_covariance_is_skipped() {
        let config = EstimatorConfig {
            process_noise_position: 0.0,
            process_noise_velocity: 0.0,
            measurement_noise: 0.0,
            initial_velocity_variance: 0.0,
            ..EstimatorConfig::default()
        };
        let mut kf = PositionEstimator::new(config, 1.0 / 30.0);
        kf.reset(Position::new(5., 5.), 0., 0.);
        let (p, outcome) = kf.update_detailed(Position::new(6., 6.), None);
        assert_eq!(outcome, UpdateOutcome::Skipped);
        assert_eq!(p, Position::new(5., 5.));
    }

    #[test]
    fn test_singular_innovation_reports_instability() {
        let config = EstimatorConfig {
            measurement_noise: 0.0,
            ..EstimatorConfig::default()
        };
        let kf = PositionEstimator::new(config, 1.0 / 30.0);
        let x = Vector4::new(1.0, 2.0, 0.0, 0.0);
        let innovation = Vector2::new(0.5, 0.5);
        let result = kf.correct(&x, &Matrix4::zeros(), &innovation, 1.0);
        assert!(matches!(
            result,
            Err(TrackerError::NumericalInstability(_))
        ));
    }

    #[test]
    fn test_non_finite_measurement_is_skipped() {
        let mut kf = estimator(1.0 / 30.0);
        kf.reset(Position::new(5., 5.), 0., 0.);
        let (p, outcome) = kf.update_detailed(Position::new(f32::NAN, 1.), None);
        assert_eq!(outcome, UpdateOutcome::Skipped);
        assert_eq!(p, Position::new(5., 5.));
    }

    #[test]
    fn test_state_stays_finite() {
        let mut kf = estimator(1.0 / 60.0);
        let mut seed: u64 = 42;
        for i in 0..5000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let r = (seed >> 33) as f32 / (1u64 << 31) as f32;
            let scale = if i % 97 == 0 { 1e6 } else { 50.0 };
            let z = Position::new(r * scale, (1.0 - r) * scale);
            let conf = if i % 5 == 0 { None } else { Some(r) };
            let p = kf.update(z, conf);
            assert!(p.is_finite());
            if i % 7 == 0 {
                kf.predict();
            }
            let (vx, vy) = kf.velocity().unwrap();
            assert!(vx.is_finite() && vy.is_finite());
            let score = kf.confidence_score();
            assert!((0.0..=1.0).contains(&score));
        }
    }
}
