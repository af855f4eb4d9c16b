/// Bounding box for a detected face, in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let overlap_h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let inter = overlap_w.max(0.0) * overlap_h.max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }
}

/// Pick the face with the largest box area. Ties go to the earlier
/// (higher-confidence) detection.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best: Option<&BoundingBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x: 10.0,
            y: 10.0,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_largest_face_by_area() {
        let faces = vec![bbox(40.0, 40.0, 0.99), bbox(90.0, 80.0, 0.6), bbox(50.0, 50.0, 0.8)];
        let largest = largest_face(&faces).unwrap();
        assert_eq!(largest.width, 90.0);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = vec![bbox(50.0, 50.0, 0.9), bbox(50.0, 50.0, 0.7)];
        assert_eq!(largest_face(&faces).unwrap().confidence, 0.9);
    }

    #[test]
    fn test_largest_face_empty() {
        assert!(largest_face(&[]).is_none());
    }

    #[test]
    fn test_iou() {
        let a = bbox(10.0, 10.0, 1.0);
        let mut b = a.clone();
        b.x += 5.0;
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        b.x += 100.0;
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_negative_extent_has_zero_area() {
        assert_eq!(bbox(-5.0, 20.0, 0.5).area(), 0.0);
    }
}
