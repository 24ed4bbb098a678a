// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理引擎接口 (Inference engine boundary)
//!
//! 神经网络执行对核心是不透明的: 输入 `[1, 3, S, S]` 归一化张量,输出原始检测张量。
//! - `InferenceEngine`:   后端需实现的trait (ONNX / TFLite / ...)
//! - `ReplayEngine`:      回放预先录制的原始输出 (测试、演示、离线调试)
//! - `synthetic_output`:  按指定布局构造原始输出张量

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayD};
use tracing::debug;

use crate::detection::{ObjectClass, OutputLayout, Position};

/// 推理引擎
pub trait InferenceEngine: Send {
    fn name(&self) -> &str {
        "engine"
    }

    /// 加载模型 (在工作线程中、处理首帧前调用)
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    /// 单次前向推理
    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>>;
}

/// 回放引擎: 按顺序返回预先准备的输出,耗尽后返回空张量
pub struct ReplayEngine {
    outputs: VecDeque<ArrayD<f32>>,
    num_classes: usize,
    latency: Option<Duration>,
    loaded: bool,
}

impl ReplayEngine {
    pub fn new(outputs: Vec<ArrayD<f32>>, num_classes: usize) -> Self {
        Self {
            outputs: outputs.into(),
            num_classes,
            latency: None,
            loaded: false,
        }
    }

    /// 模拟推理耗时
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&mut self, output: ArrayD<f32>) {
        self.outputs.push_back(output);
    }

    pub fn remaining(&self) -> usize {
        self.outputs.len()
    }
}

impl InferenceEngine for ReplayEngine {
    fn name(&self) -> &str {
        "replay"
    }

    fn load(&mut self) -> Result<()> {
        self.loaded = true;
        debug!("📼 回放引擎就绪: {} 个输出", self.outputs.len());
        Ok(())
    }

    fn infer(&mut self, input: ArrayD<f32>) -> Result<ArrayD<f32>> {
        if !self.loaded {
            bail!("replay engine used before load()");
        }
        if input.ndim() != 4 {
            bail!("expected NCHW input, got shape {:?}", input.shape());
        }
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }
        Ok(self.outputs.pop_front().unwrap_or_else(|| {
            Array3::<f32>::zeros((1, 4 + self.num_classes, 0)).into_dyn()
        }))
    }
}

/// 模型输入坐标系下的一个候选框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub center: Position,
    pub width: f32,
    pub height: f32,
    pub class: ObjectClass,
    pub score: f32,
}

impl Candidate {
    /// 由原图坐标换算到模型输入坐标
    pub fn from_image_space(
        center: Position,
        width: f32,
        height: f32,
        class: ObjectClass,
        score: f32,
        image_size: (u32, u32),
        input_size: u32,
    ) -> Self {
        let sx = input_size as f32 / image_size.0.max(1) as f32;
        let sy = input_size as f32 / image_size.1.max(1) as f32;
        Self {
            center: Position::new(center.x * sx, center.y * sy),
            width: width * sx,
            height: height * sy,
            class,
            score,
        }
    }
}

/// 构造原始检测张量 (`[1, 4+K, N]` 或 `[1, N, 4+K]`),空位得分为0
pub fn synthetic_output(
    layout: OutputLayout,
    candidates: &[Candidate],
    num_classes: usize,
    num_candidates: usize,
) -> ArrayD<f32> {
    let attrs = 4 + num_classes;
    let n = num_candidates.max(candidates.len());
    let mut out = match layout {
        OutputLayout::BoxMajor => Array3::<f32>::zeros((1, attrs, n)),
        OutputLayout::DetectionMajor => Array3::<f32>::zeros((1, n, attrs)),
    };
    for (i, c) in candidates.iter().enumerate() {
        let mut values = vec![0.0; attrs];
        values[0] = c.center.x;
        values[1] = c.center.y;
        values[2] = c.width;
        values[3] = c.height;
        let class = c.class.id();
        if class < num_classes {
            values[4 + class] = c.score;
        }
        for (attr, v) in values.into_iter().enumerate() {
            match layout {
                OutputLayout::BoxMajor => out[[0, attr, i]] = v,
                OutputLayout::DetectionMajor => out[[0, i, attr]] = v,
            }
        }
    }
    out.into_dyn()
}
