//! Identity classifier via ONNX Runtime.
//!
//! Runs the face CNN (an ONNX export of the Keras model) on a single
//! `(1, 100, 100, 1)` grayscale crop and returns its per-class scores.

use crate::image_ops::FACE_INPUT_SIZE;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}; export the Keras model to ONNX and place it there")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed face classifier.
pub struct OnnxClassifier {
    session: Session,
}

impl OnnxClassifier {
    /// Load the classifier model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ClassifierError> {
        if !Path::new(model_path).exists() {
            return Err(ClassifierError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face classifier"
        );

        Ok(Self { session })
    }
}

impl crate::pipeline::FaceClassifier for OnnxClassifier {
    fn classify(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ClassifierError> {
        let expected = [1, FACE_INPUT_SIZE, FACE_INPUT_SIZE, 1];
        if input.shape() != expected {
            return Err(ClassifierError::InferenceFailed(format!(
                "input shape {:?}, expected {expected:?}",
                input.shape()
            )));
        }

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("score extraction: {e}")))?;

        first_row(&shape[..], data)
    }
}

/// Scores for batch element 0 of a `(batch, classes)` output.
fn first_row(shape: &[i64], data: &[f32]) -> Result<Vec<f32>, ClassifierError> {
    let classes = match shape {
        [_, classes] => *classes,
        [classes] => *classes,
        other => {
            return Err(ClassifierError::InferenceFailed(format!(
                "unexpected output shape {other:?}"
            )))
        }
    };
    if classes <= 0 || data.len() < classes as usize {
        return Err(ClassifierError::InferenceFailed(format!(
            "output has {} values for {classes} classes",
            data.len()
        )));
    }
    Ok(data[..classes as usize].to_vec())
}
