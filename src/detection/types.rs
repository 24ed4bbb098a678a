// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 检测数据结构 (Detection data structures)

use serde::{Deserialize, Serialize};

/// 检测类别 (与模型元数据 `classes: ["ball", "club_head"]` 对应)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Ball,
    ClubHead,
    Other(usize),
}

impl ObjectClass {
    pub fn from_id(id: usize) -> Self {
        match id {
            0 => ObjectClass::Ball,
            1 => ObjectClass::ClubHead,
            n => ObjectClass::Other(n),
        }
    }

    pub fn id(&self) -> usize {
        match self {
            ObjectClass::Ball => 0,
            ObjectClass::ClubHead => 1,
            ObjectClass::Other(n) => *n,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ObjectClass::Ball => "ball",
            ObjectClass::ClubHead => "club_head",
            ObjectClass::Other(_) => "unknown",
        }
    }
}

/// 图像坐标点 (y轴向下)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// 检测框 (左上角 + 宽高),生成后不可变
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    class_id: usize,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32, class_id: usize, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            class_id,
        }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn xmax(&self) -> f32 {
        self.x + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.y + self.height
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn class_id(&self) -> usize {
        self.class_id
    }

    pub fn class(&self) -> ObjectClass {
        ObjectClass::from_id(self.class_id)
    }

    pub fn center(&self) -> Position {
        Position::new(self.x + self.width / 2., self.y + self.height / 2.)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &BoundingBox) -> f32 {
        let l = self.x.max(another.x);
        let r = self.xmax().min(another.xmax());
        let t = self.y.max(another.y);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &BoundingBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    /// 交并比,无重叠或面积退化时为0
    pub fn iou(&self, another: &BoundingBox) -> f32 {
        let inter = self.intersection_area(another);
        if inter <= 0. {
            return 0.;
        }
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        (inter / union).clamp(0., 1.)
    }
}

/// 取某一类别中置信度最高的检测框
pub fn best_of_class(boxes: &[BoundingBox], class: ObjectClass) -> Option<&BoundingBox> {
    boxes
        .iter()
        .filter(|b| b.class() == class)
        .max_by(|a, b| a.confidence().total_cmp(&b.confidence()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center() {
        let b = BoundingBox::new(10., 20., 30., 40., 0, 0.9);
        assert_eq!(b.center(), Position::new(25., 40.));
    }

    #[test]
    fn test_iou_disjoint_and_identical() {
        let a = BoundingBox::new(0., 0., 10., 10., 0, 0.9);
        let b = BoundingBox::new(20., 20., 10., 10., 0, 0.9);
        let touching = BoundingBox::new(10., 0., 10., 10., 0, 0.9);
        assert_eq!(a.iou(&b), 0.);
        assert_eq!(a.iou(&touching), 0.);
        assert!((a.iou(&a) - 1.).abs() < 1e-6);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = BoundingBox::new(0., 0., 10., 10., 0, 0.9);
        let b = BoundingBox::new(5., 0., 10., 10., 0, 0.9);
        // 交集50, 并集150
        assert!((a.iou(&b) - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_best_of_class() {
        let boxes = vec![
            BoundingBox::new(0., 0., 5., 5., 0, 0.4),
            BoundingBox::new(0., 0., 5., 5., 1, 0.95),
            BoundingBox::new(0., 0., 5., 5., 0, 0.7),
        ];
        let ball = best_of_class(&boxes, ObjectClass::Ball).unwrap();
        assert_eq!(ball.confidence(), 0.7);
        assert!(best_of_class(&boxes, ObjectClass::Other(3)).is_none());
    }
}
