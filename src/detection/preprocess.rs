// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 帧预处理 (Frame preprocessing)
//! 职责: YUV420 平面数据 → RGB → Resize到模型输入 → 归一化 NCHW 张量

use fast_image_resize as fr;
use image::RgbImage;
use ndarray::{Array4, ArrayD};

use crate::error::{Result, TrackerError};

/// YUV 4:2:0 平面帧的只读视图 (Y平面后依次为U、V平面)
#[derive(Debug, Clone, Copy)]
pub struct PlanarYuv<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub row_stride: usize,
    pub uv_stride: usize,
}

impl<'a> PlanarYuv<'a> {
    pub fn chroma_rows(&self) -> usize {
        (self.height as usize + 1) / 2
    }

    /// 三个平面所需的最小字节数
    pub fn required_len(&self) -> usize {
        self.row_stride * self.height as usize + 2 * self.uv_stride * self.chroma_rows()
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(TrackerError::MalformedFrame(format!(
                "frame size {}x{}",
                self.width, self.height
            )));
        }
        if self.row_stride < self.width as usize || self.uv_stride < (self.width as usize + 1) / 2
        {
            return Err(TrackerError::MalformedFrame(format!(
                "strides {}/{} too small for width {}",
                self.row_stride, self.uv_stride, self.width
            )));
        }
        if self.data.len() < self.required_len() {
            return Err(TrackerError::MalformedFrame(format!(
                "buffer holds {} bytes, {} required",
                self.data.len(),
                self.required_len()
            )));
        }
        Ok(())
    }

    /// BT.601 全范围 YUV → RGB
    pub fn to_rgb(&self) -> Result<RgbImage> {
        self.validate()?;
        let (w, h) = (self.width as usize, self.height as usize);
        let u_offset = self.row_stride * h;
        let v_offset = u_offset + self.uv_stride * self.chroma_rows();

        let mut rgb = Vec::with_capacity(w * h * 3);
        for row in 0..h {
            let y_row = &self.data[row * self.row_stride..row * self.row_stride + w];
            let c_row = (row / 2) * self.uv_stride;
            for (col, &luma) in y_row.iter().enumerate() {
                let y = luma as f32;
                let u = self.data[u_offset + c_row + col / 2] as f32 - 128.0;
                let v = self.data[v_offset + c_row + col / 2] as f32 - 128.0;
                rgb.push(clamp_u8(y + 1.402 * v));
                rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
                rgb.push(clamp_u8(y + 1.772 * u));
            }
        }
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| TrackerError::MalformedFrame("RGB图像转换失败".into()))
    }
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// 预处理器 (复用 Resizer 缓冲)
pub struct Preprocessor {
    input_size: u32,
    resizer: fr::Resizer,
}

impl Preprocessor {
    pub fn new(input_size: u32) -> Self {
        Self {
            input_size: input_size.max(1),
            resizer: fr::Resizer::new(),
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// 完整流程: YUV → RGB → 输入张量 `[1, 3, S, S]`
    pub fn prepare(&mut self, frame: PlanarYuv<'_>) -> Result<ArrayD<f32>> {
        let rgb = frame.to_rgb()?;
        self.to_tensor(rgb)
    }

    pub fn to_tensor(&mut self, rgb: RgbImage) -> Result<ArrayD<f32>> {
        let s = self.input_size;
        let (width, height) = rgb.dimensions();

        // Nearest 插值,速度优先
        let src_image =
            fr::images::Image::from_vec_u8(width, height, rgb.into_raw(), fr::PixelType::U8x3)
                .map_err(|e| TrackerError::MalformedFrame(e.to_string()))?;
        let mut dst_image = fr::images::Image::new(s, s, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src_image,
                &mut dst_image,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
            )
            .map_err(|e| TrackerError::MalformedFrame(e.to_string()))?;

        // HWC u8 → NCHW f32 / 255
        let s = s as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
        for (i, px) in dst_image.buffer().chunks_exact(3).enumerate() {
            let (y, x) = (i / s, i % s);
            tensor[[0, 0, y, x]] = px[0] as f32 / 255.0;
            tensor[[0, 1, y, x]] = px[1] as f32 / 255.0;
            tensor[[0, 2, y, x]] = px[2] as f32 / 255.0;
        }
        Ok(tensor.into_dyn())
    }
}
