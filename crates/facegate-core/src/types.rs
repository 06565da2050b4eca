use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> i64 {
        self.width as i64 * self.height as i64
    }

    /// Intersect with an image of the given size. Returns `None` if nothing is left.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<FaceRect> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.width).min(image_width as i32);
        let y1 = (self.y + self.height).min(image_height as i32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(FaceRect::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Which detected face the pipeline hands to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaceSelection {
    /// Whatever the detector reports first.
    #[default]
    First,
    /// The rectangle with the largest area; ties keep detector order.
    Largest,
}

impl FaceSelection {
    pub fn select(self, faces: &[FaceRect]) -> Option<FaceRect> {
        match self {
            FaceSelection::First => faces.first().copied(),
            FaceSelection::Largest => faces
                .iter()
                .copied()
                .fold(None, |best: Option<FaceRect>, f| match best {
                    Some(b) if b.area() >= f.area() => Some(b),
                    _ => Some(f),
                }),
        }
    }
}

impl std::str::FromStr for FaceSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(FaceSelection::First),
            "largest" => Ok(FaceSelection::Largest),
            other => Err(format!("unknown face selection policy: {other}")),
        }
    }
}

/// Top-1 class of a classifier output vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub score: f32,
}

impl Prediction {
    /// Argmax over `scores`. The lowest index wins ties; NaN never wins.
    pub fn from_scores(scores: &[f32]) -> Option<Prediction> {
        let mut best: Option<Prediction> = None;
        for (index, &score) in scores.iter().enumerate() {
            let better = match best {
                None => !score.is_nan(),
                Some(b) => score > b.score,
            };
            if better {
                best = Some(Prediction { index, score });
            }
        }
        best
    }
}

/// Outcome of one verification request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Recognized { name: String, confidence: f32 },
    NotRecognized,
    NoFace,
}

/// Wire shape of a verdict.
#[derive(Debug, Serialize)]
pub struct VerdictBody<'a> {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl Verdict {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verdict::Recognized { .. })
    }

    pub fn body(&self) -> VerdictBody<'_> {
        match self {
            Verdict::Recognized { name, confidence } => VerdictBody {
                verified: true,
                name: Some(name),
                confidence: Some(*confidence),
                message: None,
            },
            Verdict::NotRecognized => VerdictBody {
                verified: false,
                name: None,
                confidence: None,
                message: Some("Face not recognized"),
            },
            Verdict::NoFace => VerdictBody {
                verified: false,
                name: None,
                confidence: None,
                message: Some("No face detected"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prediction_argmax() {
        let p = Prediction::from_scores(&[0.1, 0.6, 0.2, 0.1]).unwrap();
        assert_eq!(p.index, 1);
        assert!((p.score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_prediction_ties_keep_first() {
        let p = Prediction::from_scores(&[0.5, 0.5]).unwrap();
        assert_eq!(p.index, 0);
    }

    #[test]
    fn test_prediction_empty() {
        assert!(Prediction::from_scores(&[]).is_none());
    }

    #[test]
    fn test_prediction_skips_nan() {
        let p = Prediction::from_scores(&[f32::NAN, 0.3]).unwrap();
        assert_eq!(p.index, 1);
    }

    #[test]
    fn test_clamp_inside() {
        let r = FaceRect::new(10, 10, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(r));
    }

    #[test]
    fn test_clamp_overhang() {
        let r = FaceRect::new(-5, 90, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(FaceRect::new(0, 90, 15, 10)));
    }

    #[test]
    fn test_clamp_outside() {
        let r = FaceRect::new(200, 200, 20, 20);
        assert_eq!(r.clamp_to(100, 100), None);
    }

    #[test]
    fn test_selection_first() {
        let faces = [FaceRect::new(0, 0, 10, 10), FaceRect::new(0, 0, 50, 50)];
        assert_eq!(FaceSelection::First.select(&faces), Some(faces[0]));
    }

    #[test]
    fn test_selection_largest() {
        let faces = [
            FaceRect::new(0, 0, 10, 10),
            FaceRect::new(5, 5, 50, 50),
            FaceRect::new(9, 9, 50, 50),
        ];
        assert_eq!(FaceSelection::Largest.select(&faces), Some(faces[1]));
        assert_eq!(FaceSelection::Largest.select(&[]), None);
    }

    #[test]
    fn test_selection_parse() {
        assert_eq!("Largest".parse::<FaceSelection>(), Ok(FaceSelection::Largest));
        assert!("center".parse::<FaceSelection>().is_err());
    }

    #[test]
    fn test_verdict_body_shapes() {
        let ok = Verdict::Recognized {
            name: "Rhys".into(),
            confidence: 0.75,
        };
        assert_eq!(
            serde_json::to_value(ok.body()).unwrap(),
            json!({"verified": true, "name": "Rhys", "confidence": 0.75})
        );
        assert_eq!(
            serde_json::to_value(Verdict::NoFace.body()).unwrap(),
            json!({"verified": false, "message": "No face detected"})
        );
        assert_eq!(
            serde_json::to_value(Verdict::NotRecognized.body()).unwrap(),
            json!({"verified": false, "message": "Face not recognized"})
        );
    }
}
