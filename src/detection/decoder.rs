// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测输出解码
// 包含: 布局识别、置信度过滤、坐标还原、按类别NMS

use ndarray::{ArrayView2, ArrayViewD, IxDyn};
use tracing::{debug, warn};

use super::types::BoundingBox;
use crate::config::DecoderConfig;
use crate::error::{Result, TrackerError};

const CXYWH_OFFSET: usize = 4;

/// 模型输出布局
///
/// - `BoxMajor`:       `[4+K, N]` (YOLOv8 ONNX/TFLite 默认导出)
/// - `DetectionMajor`: `[N, 4+K]` (转置后的导出)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    BoxMajor,
    DetectionMajor,
}

/// 布局识别结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputShape {
    pub layout: OutputLayout,
    pub num_candidates: usize,
    pub num_attributes: usize,
}

impl OutputLayout {
    /// 根据张量维度识别布局 (去掉前导的 batch=1 维度)
    ///
    /// 已知类别数时以 `4+K` 所在的轴为属性轴; 否则取较短轴
    pub fn detect(shape: &[usize], num_classes: Option<usize>) -> Result<OutputShape> {
        let mut dims = shape;
        while dims.len() > 2 && dims[0] == 1 {
            dims = &dims[1..];
        }
        let (rows, cols) = match dims {
            [rows, cols] => (*rows, *cols),
            _ => {
                return Err(TrackerError::MalformedTensor(format!(
                    "expected [1, A, B] or [A, B], got {:?}",
                    shape
                )))
            }
        };

        let layout = match num_classes {
            Some(k) => {
                let attrs = CXYWH_OFFSET + k;
                if rows == attrs {
                    OutputLayout::BoxMajor
                } else if cols == attrs {
                    OutputLayout::DetectionMajor
                } else {
                    return Err(TrackerError::MalformedTensor(format!(
                        "no axis of {:?} matches 4 + {} class scores",
                        shape, k
                    )));
                }
            }
            None if rows <= cols => OutputLayout::BoxMajor,
            None => OutputLayout::DetectionMajor,
        };

        let (num_attributes, num_candidates) = match layout {
            OutputLayout::BoxMajor => (rows, cols),
            OutputLayout::DetectionMajor => (cols, rows),
        };
        if num_attributes <= CXYWH_OFFSET {
            return Err(TrackerError::MalformedTensor(format!(
                "{} attributes per candidate leaves no class scores",
                num_attributes
            )));
        }

        Ok(OutputShape {
            layout,
            num_candidates,
            num_attributes,
        })
    }
}

/// 检测解码器
pub struct DetectionDecoder {
    config: DecoderConfig,
}

impl DetectionDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// 解码,输入异常时记录诊断并返回空结果
    pub fn decode(
        &self,
        output: ArrayViewD<'_, f32>,
        image_width: u32,
        image_height: u32,
    ) -> Vec<BoundingBox> {
        match self.try_decode(output, image_width, image_height) {
            Ok(boxes) => boxes,
            Err(e) => {
                warn!("⚠️ 检测输出解码失败: {}", e);
                Vec::new()
            }
        }
    }

    /// 从扁平缓冲区 + 维度解码
    pub fn decode_flat(
        &self,
        data: &[f32],
        shape: &[usize],
        image_width: u32,
        image_height: u32,
    ) -> Result<Vec<BoundingBox>> {
        let view = ArrayViewD::from_shape(IxDyn(shape), data).map_err(|e| {
            TrackerError::MalformedTensor(format!(
                "buffer of {} values does not fit shape {:?}: {}",
                data.len(),
                shape,
                e
            ))
        })?;
        self.try_decode(view, image_width, image_height)
    }

    pub fn try_decode(
        &self,
        output: ArrayViewD<'_, f32>,
        image_width: u32,
        image_height: u32,
    ) -> Result<Vec<BoundingBox>> {
        if image_width == 0 || image_height == 0 {
            return Err(TrackerError::MalformedFrame(format!(
                "image size {}x{}",
                image_width, image_height
            )));
        }
        let shape = OutputLayout::detect(output.shape(), self.config.num_classes)?;
        let (rows, cols) = match shape.layout {
            OutputLayout::BoxMajor => (shape.num_attributes, shape.num_candidates),
            OutputLayout::DetectionMajor => (shape.num_candidates, shape.num_attributes),
        };
        let table = output
            .to_shape((rows, cols))
            .map_err(|e| TrackerError::MalformedTensor(e.to_string()))?;

        let mut boxes = self.collect_candidates(table.view(), shape, image_width, image_height);
        let candidates = boxes.len();
        non_max_suppression(&mut boxes, self.config.iou_threshold);
        debug!(
            "🔍 解码: 布局={:?} 候选={} 过阈值={} NMS后={}",
            shape.layout,
            shape.num_candidates,
            candidates,
            boxes.len()
        );
        Ok(boxes)
    }

    fn collect_candidates(
        &self,
        table: ArrayView2<'_, f32>,
        shape: OutputShape,
        image_width: u32,
        image_height: u32,
    ) -> Vec<BoundingBox> {
        let at = |attr: usize, i: usize| match shape.layout {
            OutputLayout::BoxMajor => table[[attr, i]],
            OutputLayout::DetectionMajor => table[[i, attr]],
        };

        let input_size = self.config.input_size.max(1) as f32;
        let coord_scale = if self.config.normalized_coordinates {
            input_size
        } else {
            1.0
        };
        let width_original = image_width as f32;
        let height_original = image_height as f32;
        let scale_x = width_original / input_size;
        let scale_y = height_original / input_size;

        let mut boxes = Vec::new();
        for i in 0..shape.num_candidates {
            // 最高类别得分
            let (id, confidence) = (CXYWH_OFFSET..shape.num_attributes)
                .map(|attr| (attr - CXYWH_OFFSET, at(attr, i)))
                .fold((0, f32::NEG_INFINITY), |max, x| if x.1 > max.1 { x } else { max });

            if !confidence.is_finite() || confidence <= self.config.conf_threshold {
                continue;
            }

            let cx = at(0, i) * coord_scale;
            let cy = at(1, i) * coord_scale;
            let w = at(2, i) * coord_scale;
            let h = at(3, i) * coord_scale;
            if !(cx.is_finite() && cy.is_finite() && w.is_finite() && h.is_finite()) {
                continue;
            }

            // 中心点 → 左上角,缩放到原图并裁剪
            let x1 = ((cx - w / 2.) * scale_x).clamp(0., width_original);
            let y1 = ((cy - h / 2.) * scale_y).clamp(0., height_original);
            let x2 = ((cx + w / 2.) * scale_x).clamp(0., width_original);
            let y2 = ((cy + h / 2.) * scale_y).clamp(0., height_original);
            if x2 - x1 <= 0. || y2 - y1 <= 0. {
                continue;
            }

            boxes.push(BoundingBox::new(
                x1,
                y1,
                x2 - x1,
                y2 - y1,
                id,
                confidence.clamp(0., 1.),
            ));
        }
        boxes
    }
}

/// 按类别的非极大值抑制: 只有同类别框之间互相抑制
pub fn non_max_suppression(xs: &mut Vec<BoundingBox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().total_cmp(&b1.confidence()));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id() != xs[index].class_id() {
                continue;
            }
            if xs[prev_index].iou(&xs[index]) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// (cx, cy, w, h, class, score) → `[4+K, N]` 张量
    fn box_major(cands: &[(f32, f32, f32, f32, usize, f32)], k: usize) -> Array2<f32> {
        let mut t = Array2::zeros((4 + k, cands.len()));
        for (i, &(cx, cy, w, h, class, score)) in cands.iter().enumerate() {
            t[[0, i]] = cx;
            t[[1, i]] = cy;
            t[[2, i]] = w;
            t[[3, i]] = h;
            t[[4 + class, i]] = score;
        }
        t
    }

    fn decoder() -> DetectionDecoder {
        DetectionDecoder::new(DecoderConfig::default())
    }

    #[test]
    fn test_detect_layout() {
        let s = OutputLayout::detect(&[1, 6, 8400], Some(2)).unwrap();
        assert_eq!(s.layout, OutputLayout::BoxMajor);
        assert_eq!(s.num_candidates, 8400);

        let s = OutputLayout::detect(&[1, 8400, 6], Some(2)).unwrap();
        assert_eq!(s.layout, OutputLayout::DetectionMajor);
        assert_eq!(s.num_attributes, 6);

        // 未知类别数: 较短轴为属性轴
        let s = OutputLayout::detect(&[84, 8400], None).unwrap();
        assert_eq!(s.layout, OutputLayout::BoxMajor);
        let s = OutputLayout::detect(&[1, 8400, 84], None).unwrap();
        assert_eq!(s.layout, OutputLayout::DetectionMajor);
    }

    #[test]
    fn test_detect_layout_rejects_bad_shapes() {
        assert!(OutputLayout::detect(&[6], Some(2)).is_err());
        assert!(OutputLayout::detect(&[2, 6, 10], Some(2)).is_err());
        assert!(OutputLayout::detect(&[1, 7, 100], Some(2)).is_err());
        assert!(OutputLayout::detect(&[1, 3, 100], None).is_err());
    }

    #[test]
    fn test_decode_rescales_to_original() {
        let t = box_major(&[(320., 320., 20., 20., 0, 0.9)], 2);
        let boxes = decoder().try_decode(t.view().into_dyn(), 1280, 720).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert!((b.x() - 620.).abs() < 1e-3);
        assert!((b.y() - 348.75).abs() < 1e-3);
        assert!((b.width() - 40.).abs() < 1e-3);
        assert!((b.height() - 22.5).abs() < 1e-3);
        assert_eq!(b.class_id(), 0);
    }

    #[test]
    fn test_both_layouts_agree() {
        let cands = [
            (100., 200., 30., 30., 0, 0.8),
            (400., 420., 60., 40., 1, 0.7),
        ];
        let bm = box_major(&cands, 2);
        let dm = bm.t().to_owned();
        let d = decoder();
        let a = d.try_decode(bm.view().into_dyn(), 640, 480).unwrap();
        let b = d.try_decode(dm.view().into_dyn(), 640, 480).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_confidence_threshold() {
        let t = box_major(
            &[(100., 100., 10., 10., 0, 0.25), (300., 300., 10., 10., 1, 0.26)],
            2,
        );
        let boxes = decoder().try_decode(t.view().into_dyn(), 640, 640).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].class_id(), 1);
    }

    #[test]
    fn test_clamps_to_image_bounds() {
        let t = box_major(&[(5., 635., 40., 40., 0, 0.9)], 2);
        let boxes = decoder().try_decode(t.view().into_dyn(), 640, 640).unwrap();
        let b = &boxes[0];
        assert_eq!(b.x(), 0.);
        assert_eq!(b.ymax(), 640.);
        assert!(b.width() > 0. && b.height() > 0.);
    }

    #[test]
    fn test_nms_is_class_wise() {
        let t = box_major(
            &[
                (100., 100., 40., 40., 0, 0.9),
                (102., 101., 40., 40., 0, 0.8), // 同类重叠 → 抑制
                (101., 100., 40., 40., 1, 0.7), // 异类重叠 → 保留
            ],
            2,
        );
        let boxes = decoder().try_decode(t.view().into_dyn(), 640, 640).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].confidence(), 0.9);
        assert_eq!(boxes[1].class_id(), 1);
    }

    #[test]
    fn test_malformed_returns_empty() {
        let d = decoder();
        let t = Array2::<f32>::zeros((7, 10));
        assert!(d.try_decode(t.view().into_dyn(), 640, 640).is_err());
        assert!(d.decode(t.view().into_dyn(), 640, 640).is_empty());

        let ok = box_major(&[(100., 100., 10., 10., 0, 0.9)], 2);
        assert!(matches!(
            d.try_decode(ok.view().into_dyn(), 0, 640),
            Err(TrackerError::MalformedFrame(_))
        ));
        assert!(d.decode_flat(&[0.0; 11], &[1, 6, 2], 640, 640).is_err());
    }

    #[test]
    fn test_decode_flat_detection_major() {
        // [1, 1, 6]: cx cy w h ball club
        let data = [320., 240., 20., 20., 0.1, 0.95];
        let boxes = decoder().decode_flat(&data, &[1, 1, 6], 640, 640).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].class_id(), 1);
    }

    #[test]
    fn test_normalized_coordinates() {
        let mut config = DecoderConfig::default();
        config.normalized_coordinates = true;
        let d = DetectionDecoder::new(config);
        let t = box_major(&[(0.5, 0.5, 0.1, 0.1, 0, 0.9)], 2);
        let boxes = d.try_decode(t.view().into_dyn(), 640, 640).unwrap();
        assert!((boxes[0].center().x - 320.).abs() < 1e-3);
        assert!((boxes[0].width() - 64.).abs() < 1e-3);
    }

    #[test]
    fn test_decoded_boxes_are_valid() {
        // 确定性伪随机候选
        let mut cands = Vec::new();
        for i in 0..200 {
            let f = i as f32;
            cands.push((
                (f * 37.) % 700. - 30.,
                (f * 53.) % 700. - 30.,
                10. + (f * 7.) % 90.,
                10. + (f * 11.) % 90.,
                i % 2,
                (f * 0.137) % 1.2,
            ));
        }
        let t = box_major(&cands, 2);
        let d = decoder();
        let boxes = d.try_decode(t.view().into_dyn(), 800, 600).unwrap();
        assert!(!boxes.is_empty());
        for b in &boxes {
            assert!((0. ..=1.).contains(&b.confidence()));
            assert!(b.width() > 0. && b.height() > 0.);
            assert!(b.x() >= 0. && b.y() >= 0.);
            assert!(b.xmax() <= 800. && b.ymax() <= 600.);
        }
        for (i, a) in boxes.iter().enumerate() {
            for b in &boxes[i + 1..] {
                if a.class_id() == b.class_id() {
                    assert!(a.iou(b) <= d.config().iou_threshold);
                }
            }
        }
    }
}
