use crate::config::Config;
use facegate_core::cascade::CascadeError;
use facegate_core::{
    HaarFaceDetector, LabelMap, OnnxClassifier, Verdict, Verifier, VerifierSettings, VerifyError,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
    #[error("classifier: {0}")]
    Classifier(#[from] facegate_core::classifier::ClassifierError),
    #[error("labels: {0}")]
    Labels(#[from] facegate_core::labels::LabelMapError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("verification panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Verify {
        image: String,
        reply: oneshot::Sender<Result<Verdict, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run the verification pipeline on a `<prefix>,<base64>` image string.
    pub async fn verify(&self, image: String) -> Result<Verdict, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the cascade, classifier and label map named by `config`.
///
/// Any missing or unreadable artifact is an error; the daemon does not start
/// without all three.
pub fn load_verifier(config: &Config) -> Result<Verifier, EngineError> {
    if config.scale_factor.is_nan() || config.scale_factor <= 1.0 {
        return Err(CascadeError::BadScaleFactor(config.scale_factor).into());
    }

    let cascade_path = config.cascade_path_str();
    let detector = HaarFaceDetector::with_params(
        facegate_core::CascadeClassifier::load(&cascade_path)?,
        config.scale_factor,
        config.min_neighbors,
    );
    tracing::info!(
        path = %cascade_path,
        scale_factor = config.scale_factor,
        min_neighbors = config.min_neighbors,
        "face detector loaded"
    );

    let model_path = config.model_path_str();
    let classifier = OnnxClassifier::load(&model_path)?;
    tracing::info!(path = %model_path, "classifier loaded");

    let labels = match &config.labels_path {
        Some(path) => LabelMap::load(&path.to_string_lossy())?,
        None => LabelMap::default(),
    };

    Ok(Verifier::new(
        Box::new(detector),
        Box::new(classifier),
        labels,
        VerifierSettings {
            confidence_threshold: config.confidence_threshold,
            selection: config.face_selection,
        },
    ))
}

/// Spawn the engine on a dedicated OS thread.
///
/// The verifier is moved onto the thread and serves requests one at a time
/// in arrival order.
pub fn spawn_engine(mut verifier: Verifier) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!(settings = ?verifier.settings(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Verify { image, reply } => {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            verifier.verify_data_url(&image).map_err(EngineError::from)
                        }))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            tracing::error!(%message, "verification panicked");
                            Err(EngineError::Panicked(message))
                        });
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
