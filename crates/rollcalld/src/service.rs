//! Recognition service: the composition point between encoder, gallery,
//! matcher, and the attendance arbiter.
//!
//! Constructed once at startup and injected into the D-Bus handlers — no
//! global state. The service performs no side effect before `mark`, so a
//! request aborted between encode and mark leaves no record behind.

use crate::notify::Notifier;
use chrono::{DateTime, Utc};
use rollcall_core::{
    AlwaysLive, Embedding, EncodeError, Encoder, EuclideanMatcher, Gallery, GalleryError,
    LivenessChecker, MatchOutcome, Matcher,
};
use rollcall_store::{
    AttendanceStatus, AttendanceStore, CheckInMethod, MarkOutcome, MarkRequest, SessionInfo,
    StoreError,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("store task failed: {0}")]
    TaskFailed(String),
}

/// Messages sent from request handlers to the encoder thread.
enum EncodeRequest {
    Encode {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, EncodeError>>,
    },
}

/// Clone-safe handle to the encoder thread.
#[derive(Clone)]
pub struct EncoderHandle {
    tx: mpsc::Sender<EncodeRequest>,
}

impl EncoderHandle {
    /// Extract a probe embedding on the encoder thread.
    pub async fn encode(&self, image: Vec<u8>) -> Result<Embedding, EncodeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EncodeRequest::Encode { image, reply: reply_tx })
            .await
            .map_err(|_| EncodeError::EncodingFailed("encoder thread exited".into()))?;
        reply_rx
            .await
            .map_err(|_| EncodeError::EncodingFailed("encoder thread exited".into()))?
    }
}

/// Spawn the encoder on a dedicated OS thread.
///
/// Inference takes `&mut self` on the underlying sessions; a single request
/// loop serializes encode calls without blocking the async runtime.
pub fn spawn_encoder(mut encoder: Box<dyn Encoder>) -> EncoderHandle {
    let (tx, mut rx) = mpsc::channel::<EncodeRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-encoder".into())
        .spawn(move || {
            tracing::info!("encoder thread started");
            while let Some(EncodeRequest::Encode { image, reply }) = rx.blocking_recv() {
                let _ = reply.send(encoder.encode(&image));
            }
            tracing::info!("encoder thread exiting");
        })
        .expect("failed to spawn encoder thread");

    EncoderHandle { tx }
}

/// Reason a recognition attempt ended without touching the attendance store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionFailure {
    NoFaceDetected,
    MultipleFacesDetected,
    EncodingFailed,
    NoMatch,
}

impl From<&EncodeError> for RecognitionFailure {
    fn from(err: &EncodeError) -> Self {
        match err {
            EncodeError::NoFaceDetected => Self::NoFaceDetected,
            EncodeError::MultipleFacesDetected => Self::MultipleFacesDetected,
            EncodeError::DecodeError(_) | EncodeError::EncodingFailed(_) => Self::EncodingFailed,
        }
    }
}

/// Outcome of one recognition request, in the shape clients consume.
///
/// `AlreadyRecorded` and `RecognitionFailed` are not errors: clients must
/// render them distinctly from system failures (`Error`).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RecognitionResponse {
    Recorded {
        student: String,
        confidence: f32,
        time: DateTime<Utc>,
    },
    AlreadyRecorded {
        student: String,
        confidence: f32,
        existing_time: DateTime<Utc>,
    },
    RecognitionFailed {
        reason: RecognitionFailure,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationFailure {
    NoFaceDetected,
    MultipleFacesDetected,
    EncodingFailed,
    UnknownIdentity,
    Internal,
}

impl From<&EncodeError> for RegistrationFailure {
    fn from(err: &EncodeError) -> Self {
        match err {
            EncodeError::NoFaceDetected => Self::NoFaceDetected,
            EncodeError::MultipleFacesDetected => Self::MultipleFacesDetected,
            EncodeError::DecodeError(_) | EncodeError::EncodingFailed(_) => Self::EncodingFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RegistrationResponse {
    Success { message: String },
    Failure { reason: RegistrationFailure },
}

/// The attendance recognition service.
pub struct AttendanceService {
    gallery: Arc<Gallery>,
    gallery_path: PathBuf,
    matcher: EuclideanMatcher,
    encoder: EncoderHandle,
    store: Arc<AttendanceStore>,
    liveness: Box<dyn LivenessChecker>,
    notifier: Box<dyn Notifier>,
    /// f32 bits. Adjustable at runtime; applies to subsequent calls only.
    threshold: AtomicU32,
}

impl AttendanceService {
    pub fn new(
        gallery: Arc<Gallery>,
        gallery_path: PathBuf,
        encoder: EncoderHandle,
        store: Arc<AttendanceStore>,
        notifier: Box<dyn Notifier>,
        threshold: f32,
    ) -> Self {
        Self {
            gallery,
            gallery_path,
            matcher: EuclideanMatcher,
            encoder,
            store,
            liveness: Box::new(AlwaysLive),
            notifier,
            threshold: AtomicU32::new(threshold.to_bits()),
        }
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::Relaxed))
    }

    /// Adjust the confidence threshold. Rejects values outside [0, 1].
    pub fn set_threshold(&self, value: f32) -> bool {
        if !(0.0..=1.0).contains(&value) {
            tracing::warn!(value, "rejected out-of-range confidence threshold");
            return false;
        }
        self.threshold.store(value.to_bits(), Ordering::Relaxed);
        tracing::info!(value, "confidence threshold updated");
        true
    }

    pub fn gallery_len(&self) -> usize {
        self.gallery.len()
    }

    /// Replace the in-memory gallery from its persisted file.
    pub fn reload_gallery(&self) -> Result<usize, GalleryError> {
        self.gallery.reload(&self.gallery_path)
    }

    /// Run one recognition attempt against a session.
    pub async fn recognize(&self, session_id: i64, image: Vec<u8>) -> RecognitionResponse {
        let embedding = match self.encoder.encode(image.clone()).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::debug!(error = %err, "probe encoding inconclusive");
                self.notifier.not_recognized();
                return RecognitionResponse::RecognitionFailed {
                    reason: RecognitionFailure::from(&err),
                };
            }
        };

        let snapshot = self.gallery.snapshot();
        let outcome = self.matcher.classify(&embedding, &snapshot, self.threshold());

        let (identity, confidence) = match outcome {
            MatchOutcome::Matched { identity, confidence } => (identity, confidence),
            MatchOutcome::NoMatch => {
                self.notifier.not_recognized();
                return RecognitionResponse::RecognitionFailed {
                    reason: RecognitionFailure::NoMatch,
                };
            }
            MatchOutcome::NoFaceDetected => {
                return RecognitionResponse::RecognitionFailed {
                    reason: RecognitionFailure::NoFaceDetected,
                };
            }
            MatchOutcome::MultipleFacesDetected => {
                return RecognitionResponse::RecognitionFailed {
                    reason: RecognitionFailure::MultipleFacesDetected,
                };
            }
            MatchOutcome::EncodingFailed => {
                return RecognitionResponse::RecognitionFailed {
                    reason: RecognitionFailure::EncodingFailed,
                };
            }
        };

        let liveness_verified = self.liveness.verify(std::slice::from_ref(&image));

        match self
            .mark(session_id, identity.clone(), confidence, liveness_verified)
            .await
        {
            Ok(MarkOutcome::Created(record)) => {
                self.notifier.recorded(&identity);
                RecognitionResponse::Recorded {
                    student: identity,
                    confidence,
                    time: record.check_in_time,
                }
            }
            Ok(MarkOutcome::AlreadyExists(record)) => {
                self.notifier.already_recorded(&identity);
                RecognitionResponse::AlreadyRecorded {
                    student: identity,
                    confidence,
                    existing_time: record.check_in_time,
                }
            }
            Err(err) => {
                tracing::error!(error = %err, session = session_id, "mark failed");
                RecognitionResponse::Error { message: err.to_string() }
            }
        }
    }

    /// Register (or re-register) the reference face for an enrolled student.
    pub async fn register(&self, identity: String, image: Vec<u8>) -> RegistrationResponse {
        let id = identity.clone();
        let exists = match self.with_store(move |store| store.student_exists(&id)).await {
            Ok(exists) => exists,
            Err(err) => {
                tracing::error!(error = %err, "student lookup failed");
                return RegistrationResponse::Failure { reason: RegistrationFailure::Internal };
            }
        };
        if !exists {
            return RegistrationResponse::Failure {
                reason: RegistrationFailure::UnknownIdentity,
            };
        }

        let embedding = match self.encoder.encode(image).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::debug!(error = %err, identity = %identity, "registration encoding failed");
                return RegistrationResponse::Failure {
                    reason: RegistrationFailure::from(&err),
                };
            }
        };

        if let Err(err) = self.gallery.upsert(&identity, embedding) {
            tracing::error!(error = %err, identity = %identity, "gallery upsert rejected");
            return RegistrationResponse::Failure {
                reason: RegistrationFailure::EncodingFailed,
            };
        }

        // Best-effort durability: the in-memory gallery is already updated
        // and stays authoritative for this process.
        if let Err(err) = self.gallery.persist(&self.gallery_path) {
            tracing::warn!(error = %err, "gallery persist failed; continuing with in-memory state");
        }

        RegistrationResponse::Success {
            message: format!("face registered for {identity}"),
        }
    }

    pub async fn add_student(&self, id: String, name: String) -> Result<bool, ServiceError> {
        self.with_store(move |store| store.ensure_student(&id, &name))
            .await
    }

    pub async fn create_session(
        &self,
        course: String,
        date: String,
        starts_at: String,
        ends_at: String,
    ) -> Result<SessionInfo, ServiceError> {
        self.with_store(move |store| store.create_session(&course, &date, &starts_at, &ends_at))
            .await
    }

    async fn mark(
        &self,
        session_id: i64,
        identity: String,
        confidence: f32,
        liveness_verified: bool,
    ) -> Result<MarkOutcome, ServiceError> {
        self.with_store(move |store| {
            store.mark(&MarkRequest {
                session_id,
                identity: &identity,
                status: AttendanceStatus::Present,
                confidence,
                liveness_verified,
                method: CheckInMethod::FaceRecognition,
                recorded_by: Some("rollcalld"),
            })
        })
        .await
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&AttendanceStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ServiceError::TaskFailed(e.to_string()))?
            .map_err(ServiceError::from)
    }
}
