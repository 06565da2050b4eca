//! Verification pipeline: decode → detect → crop/normalize → classify → threshold.

use crate::cascade::CascadeError;
use crate::classifier::ClassifierError;
use crate::image_ops::{self, ImageDecodeError};
use crate::labels::LabelMap;
use crate::types::{FaceRect, FaceSelection, Prediction, Verdict};
use image::GrayImage;
use ndarray::Array4;
use thiserror::Error;

/// Minimum top-1 score (exclusive) for a positive identification.
pub const CONFIDENCE_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Image(#[from] ImageDecodeError),
    #[error("detector: {0}")]
    Detector(#[from] CascadeError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("classifier returned no scores")]
    NoScores,
}

/// Finds face rectangles in a grayscale image.
pub trait FaceDetector: Send {
    fn detect(&self, gray: &GrayImage) -> Result<Vec<FaceRect>, CascadeError>;
}

/// Scores a normalized `(1, H, W, 1)` face tensor against the known identities.
pub trait FaceClassifier: Send {
    fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerifierSettings {
    pub confidence_threshold: f32,
    pub selection: FaceSelection,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: CONFIDENCE_THRESHOLD,
            selection: FaceSelection::First,
        }
    }
}

/// Owns the loaded detector, classifier and label map for the process lifetime.
pub struct Verifier {
    detector: Box<dyn FaceDetector>,
    classifier: Box<dyn FaceClassifier>,
    labels: LabelMap,
    settings: VerifierSettings,
}

impl Verifier {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        classifier: Box<dyn FaceClassifier>,
        labels: LabelMap,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            detector,
            classifier,
            labels,
            settings,
        }
    }

    pub fn settings(&self) -> VerifierSettings {
        self.settings
    }

    /// Run the full pipeline on a `<prefix>,<base64>` image string.
    pub fn verify_data_url(&mut self, data_url: &str) -> Result<Verdict, VerifyError> {
        let bytes = image_ops::decode_data_url(data_url)?;
        self.verify_bytes(&bytes)
    }

    /// Run the full pipeline on encoded image bytes.
    pub fn verify_bytes(&mut self, bytes: &[u8]) -> Result<Verdict, VerifyError> {
        let rgb = image_ops::decode_rgb(bytes)?;
        let gray = image_ops::to_grayscale(&rgb);

        let faces = self.detector.detect(&gray)?;
        let Some(face) = self.settings.selection.select(&faces) else {
            tracing::debug!(width = gray.width(), height = gray.height(), "no face detected");
            return Ok(Verdict::NoFace);
        };

        let crop = image_ops::crop(&gray, face)?;
        let input = image_ops::face_tensor(&crop);
        let scores = self.classifier.classify(&input)?;
        let prediction = Prediction::from_scores(&scores).ok_or(VerifyError::NoScores)?;

        tracing::debug!(
            faces = faces.len(),
            ?face,
            class = prediction.index,
            score = prediction.score,
            "face classified"
        );

        Ok(self.decide(prediction))
    }

    fn decide(&self, prediction: Prediction) -> Verdict {
        if prediction.score > self.settings.confidence_threshold {
            Verdict::Recognized {
                name: self.labels.name(prediction.index).to_string(),
                confidence: prediction.score,
            }
        } else {
            Verdict::NotRecognized
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cascade::{tests::EDGE_CASCADE, CascadeClassifier, HaarFaceDetector};
    use base64::Engine;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Detector that reports a fixed set of rectangles.
    pub(crate) struct FixedDetector(pub Vec<FaceRect>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _gray: &GrayImage) -> Result<Vec<FaceRect>, CascadeError> {
            Ok(self.0.clone())
        }
    }

    /// Classifier that returns fixed scores and records the inputs it saw.
    pub(crate) struct FixedClassifier {
        pub scores: Vec<f32>,
        pub seen: Arc<Mutex<Vec<Array4<f32>>>>,
    }

    impl FixedClassifier {
        pub fn new(scores: Vec<f32>) -> Self {
            Self {
                scores,
                seen: Arc::default(),
            }
        }
    }

    impl FaceClassifier for FixedClassifier {
        fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ClassifierError> {
            self.seen.lock().unwrap().push(input.clone());
            Ok(self.scores.clone())
        }
    }

    fn verifier(faces: Vec<FaceRect>, scores: Vec<f32>) -> Verifier {
        Verifier::new(
            Box::new(FixedDetector(faces)),
            Box::new(FixedClassifier::new(scores)),
            LabelMap::default(),
            VerifierSettings::default(),
        )
    }

    fn data_url(img: &RgbImage) -> String {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(buf.into_inner())
        )
    }

    fn sample_image() -> RgbImage {
        RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 90]))
    }

    #[test]
    fn test_no_face() {
        let mut v = verifier(vec![], vec![0.9, 0.1]);
        assert_eq!(v.verify_data_url(&data_url(&sample_image())).unwrap(), Verdict::NoFace);
    }

    #[test]
    fn test_recognized_above_threshold() {
        let mut v = verifier(vec![FaceRect::new(4, 4, 30, 30)], vec![0.05, 0.05, 0.1, 0.8]);
        let verdict = v.verify_data_url(&data_url(&sample_image())).unwrap();
        assert_eq!(
            verdict,
            Verdict::Recognized {
                name: "Rhys".into(),
                confidence: 0.8
            }
        );
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut v = verifier(vec![FaceRect::new(4, 4, 30, 30)], vec![0.7, 0.3]);
        assert_eq!(
            v.verify_data_url(&data_url(&sample_image())).unwrap(),
            Verdict::NotRecognized
        );
    }

    #[test]
    fn test_unknown_index() {
        let mut scores = vec![0.0; 6];
        scores[5] = 0.99;
        let mut v = verifier(vec![FaceRect::new(0, 0, 10, 10)], scores);
        let verdict = v.verify_data_url(&data_url(&sample_image())).unwrap();
        assert_eq!(
            verdict,
            Verdict::Recognized {
                name: "Unknown".into(),
                confidence: 0.99
            }
        );
    }

    #[test]
    fn test_classifier_sees_normalized_crop() {
        let classifier = FixedClassifier::new(vec![1.0]);
        let seen = classifier.seen.clone();
        let mut v = Verifier::new(
            Box::new(FixedDetector(vec![FaceRect::new(10, 5, 20, 20)])),
            Box::new(classifier),
            LabelMap::default(),
            VerifierSettings::default(),
        );
        v.verify_data_url(&data_url(&sample_image())).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].shape(), &[1, 100, 100, 1]);
        assert!(seen[0].iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_largest_selection() {
        let classifier = FixedClassifier::new(vec![1.0]);
        let seen = classifier.seen.clone();
        let img = RgbImage::from_fn(60, 60, |x, _| {
            if x < 30 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mut v = Verifier::new(
            Box::new(FixedDetector(vec![
                FaceRect::new(0, 0, 10, 10),
                FaceRect::new(30, 0, 30, 30),
            ])),
            Box::new(classifier),
            LabelMap::default(),
            VerifierSettings {
                selection: FaceSelection::Largest,
                ..Default::default()
            },
        );
        v.verify_data_url(&data_url(&img)).unwrap();
        // The larger face lies entirely in the white half.
        assert!(seen.lock().unwrap()[0].iter().all(|&p| p == 1.0));
    }

    #[test]
    fn test_repeated_calls_identical() {
        let mut v = verifier(vec![FaceRect::new(4, 4, 30, 30)], vec![0.1, 0.85]);
        let url = data_url(&sample_image());
        let a = v.verify_data_url(&url).unwrap();
        let b = v.verify_data_url(&url).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bad_base64_is_error() {
        let mut v = verifier(vec![], vec![]);
        assert!(matches!(
            v.verify_data_url("data:image/png;base64,@@@"),
            Err(VerifyError::Image(ImageDecodeError::Base64(_)))
        ));
    }

    #[test]
    fn test_missing_separator_is_error() {
        let mut v = verifier(vec![], vec![]);
        assert!(matches!(
            v.verify_data_url("iVBORw0KGgo"),
            Err(VerifyError::Image(ImageDecodeError::MissingSeparator))
        ));
    }

    #[test]
    fn test_corrupt_image_is_error() {
        let mut v = verifier(vec![], vec![]);
        let url = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(b"nope")
        );
        assert!(matches!(
            v.verify_data_url(&url),
            Err(VerifyError::Image(ImageDecodeError::Image(_)))
        ));
    }

    #[test]
    fn test_empty_scores_is_error() {
        let mut v = verifier(vec![FaceRect::new(0, 0, 10, 10)], vec![]);
        assert!(matches!(
            v.verify_data_url(&data_url(&sample_image())),
            Err(VerifyError::NoScores)
        ));
    }

    #[test]
    fn test_face_outside_image_is_error() {
        let mut v = verifier(vec![FaceRect::new(500, 500, 10, 10)], vec![1.0]);
        assert!(matches!(
            v.verify_data_url(&data_url(&sample_image())),
            Err(VerifyError::Image(ImageDecodeError::EmptyCrop(..)))
        ));
    }

    #[test]
    fn test_with_haar_detector() {
        let cascade = CascadeClassifier::from_xml(EDGE_CASCADE).unwrap();
        let detector = HaarFaceDetector::with_params(cascade, 1.1, 0);
        let mut v = Verifier::new(
            Box::new(detector),
            Box::new(FixedClassifier::new(vec![0.2, 0.75])),
            LabelMap::default(),
            VerifierSettings::default(),
        );

        let edge = RgbImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                Rgb([200, 200, 200])
            } else {
                Rgb([50, 50, 50])
            }
        });
        let verdict = v.verify_data_url(&data_url(&edge)).unwrap();
        assert_eq!(
            verdict,
            Verdict::Recognized {
                name: "Johan".into(),
                confidence: 0.75
            }
        );

        let flat = RgbImage::from_pixel(10, 10, Rgb([128, 128, 128]));
        assert_eq!(v.verify_data_url(&data_url(&flat)).unwrap(), Verdict::NoFace);
    }
}
