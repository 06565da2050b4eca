//! facegate-core — Face detection and identity classification.
//!
//! Uses a Haar cascade (OpenCV XML format) for face detection and a small
//! CNN running via ONNX Runtime to classify the cropped face against a fixed
//! set of known identities.

pub mod cascade;
pub mod classifier;
pub mod image_ops;
pub mod labels;
pub mod pipeline;
pub mod types;

pub use cascade::{CascadeClassifier, HaarFaceDetector};
pub use classifier::OnnxClassifier;
pub use labels::LabelMap;
pub use pipeline::{FaceClassifier, FaceDetector, Verifier, VerifierSettings, VerifyError};
pub use types::{FaceRect, FaceSelection, Prediction, Verdict};
