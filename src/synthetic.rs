// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 合成挥杆脚本 (Synthetic swing script)
//!
//! 球静置于球座,杆头水平匀速接近,击球后球以给定速度/角度做抛体运动。
//! 生成每帧的原始检测张量与 YUV 帧,用于回放引擎驱动完整流水线。

use std::time::Duration;

use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::CalibrationConfig;
use crate::detection::{ObjectClass, OutputLayout, Position};
use crate::inference::{synthetic_output, Candidate};
use crate::pipeline::FrameRequest;

#[derive(Debug, Clone)]
pub struct ShotScript {
    pub image_width: u32,
    pub image_height: u32,
    pub capture_fps: f32,
    pub frame_skip: u32,
    pub tee: Position,
    /// 杆头起点相对球座的水平偏移 (像素)
    pub club_offset: f32,
    /// 杆头速度 (像素/采集帧)
    pub club_step: f32,
    /// 击球发生的采集帧,此后球开始飞行
    pub launch_frame: u64,
    pub launch_speed: f32, // m/s
    pub launch_angle: f32, // 度
    pub pixels_per_meter: f32,
    pub gravity: f32,
    pub ball_size: f32,
    pub club_size: f32,
    /// 检测中心的均匀抖动幅度 (像素)
    pub jitter: f32,
}

impl Default for ShotScript {
    fn default() -> Self {
        Self {
            image_width: 1280,
            image_height: 720,
            capture_fps: 240.0,
            frame_skip: 2,
            tee: Position::new(400.0, 600.0),
            club_offset: -130.0,
            club_step: 6.0,
            launch_frame: 18,
            launch_speed: 45.0,
            launch_angle: 30.0,
            pixels_per_meter: 100.0,
            gravity: 9.81,
            ball_size: 12.0,
            club_size: 24.0,
            jitter: 0.0,
        }
    }
}

impl ShotScript {
    /// 与脚本一致的标定常量 (帧间隔已考虑抽帧)
    pub fn calibration(&self) -> CalibrationConfig {
        CalibrationConfig {
            pixels_per_meter: self.pixels_per_meter,
            frame_interval_secs: self.frame_skip.max(1) as f32 / self.capture_fps,
        }
    }

    pub fn timestamp(&self, frame: u64) -> Duration {
        Duration::from_secs_f64(frame as f64 / self.capture_fps as f64)
    }

    /// 第 `frame` 个采集帧时球的真实位置
    pub fn ball_at(&self, frame: u64) -> Position {
        if frame <= self.launch_frame {
            return self.tee;
        }
        let tau = (frame - self.launch_frame) as f32 / self.capture_fps;
        let angle = self.launch_angle.to_radians();
        let v = self.launch_speed * self.pixels_per_meter;
        let g = self.gravity * self.pixels_per_meter;
        Position::new(
            self.tee.x + v * angle.cos() * tau,
            self.tee.y - v * angle.sin() * tau + 0.5 * g * tau * tau,
        )
    }

    pub fn club_at(&self, frame: u64) -> Position {
        Position::new(
            self.tee.x + self.club_offset + self.club_step * frame as f32,
            self.tee.y,
        )
    }

    fn inside(&self, center: Position, size: f32) -> bool {
        let half = size / 2.0;
        center.x - half >= 0.0
            && center.y - half >= 0.0
            && center.x + half <= self.image_width as f32
            && center.y + half <= self.image_height as f32
    }

    /// 第 `frame` 帧的检测候选 (模型输入坐标)
    pub fn candidates(
        &self,
        frame: u64,
        input_size: u32,
        rng: Option<&mut StdRng>,
    ) -> Vec<Candidate> {
        let mut objects = vec![
            (self.ball_at(frame), self.ball_size, ObjectClass::Ball, 0.9),
            (self.club_at(frame), self.club_size, ObjectClass::ClubHead, 0.85),
        ];
        if let Some(rng) = rng {
            if self.jitter > 0.0 {
                for (center, ..) in objects.iter_mut() {
                    center.x += rng.gen_range(-self.jitter..=self.jitter);
                    center.y += rng.gen_range(-self.jitter..=self.jitter);
                }
            }
        }
        objects
            .into_iter()
            .filter(|(center, size, ..)| self.inside(*center, *size))
            .map(|(center, size, class, score)| {
                Candidate::from_image_space(
                    center,
                    size,
                    size,
                    class,
                    score,
                    (self.image_width, self.image_height),
                    input_size,
                )
            })
            .collect()
    }

    /// 被处理帧 (每 `frame_skip` 帧一个) 对应的原始输出序列
    pub fn outputs(
        &self,
        frames: u64,
        layout: OutputLayout,
        num_classes: usize,
        input_size: u32,
        mut rng: Option<&mut StdRng>,
    ) -> Vec<ArrayD<f32>> {
        let skip = self.frame_skip.max(1) as u64;
        (0..frames)
            .filter(|t| t % skip == 0)
            .map(|t| {
                let candidates = self.candidates(t, input_size, rng.as_deref_mut());
                synthetic_output(layout, &candidates, num_classes, 8)
            })
            .collect()
    }

    /// 中性灰 YUV 帧
    pub fn frame(&self, frame: u64) -> FrameRequest {
        FrameRequest::filled(
            self.image_width,
            self.image_height,
            96,
            frame,
            self.timestamp(frame),
        )
    }
}
