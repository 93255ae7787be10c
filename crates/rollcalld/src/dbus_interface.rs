use crate::service::AttendanceService;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Recognition and registration results are JSON strings; the tagged
/// response shapes are stable and shared with any other transport.
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Run one recognition attempt against a session. Returns a JSON
    /// object tagged `recorded`, `already_recorded`, `recognition_failed`,
    /// or `error`.
    async fn recognize(&self, session_id: i64, image: Vec<u8>) -> String {
        tracing::info!(session_id, bytes = image.len(), "recognize requested");
        let response = self.service.recognize(session_id, image).await;
        serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"result":"error","message":"{e}"}}"#))
    }

    /// Register (or re-register) the reference face for a student. Returns
    /// a JSON object tagged `success` or `failure`.
    async fn register(&self, identity: &str, image: Vec<u8>) -> String {
        tracing::info!(identity, bytes = image.len(), "register requested");
        let response = self.service.register(identity.to_string(), image).await;
        serde_json::to_string(&response)
            .unwrap_or_else(|e| format!(r#"{{"result":"failure","reason":"internal","message":"{e}"}}"#))
    }

    /// Adjust the confidence threshold for subsequent recognitions.
    /// Rejects values outside [0, 1].
    async fn set_threshold(&self, threshold: f64) -> bool {
        self.service.set_threshold(threshold as f32)
    }

    /// Reload the gallery from its persisted file. Returns the number of
    /// entries loaded.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        match self.service.reload_gallery() {
            Ok(count) => Ok(count as u32),
            Err(e) => Err(zbus::fdo::Error::Failed(e.to_string())),
        }
    }

    /// Enroll a student identity. Returns false if it already existed.
    async fn add_student(&self, id: &str, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, name, "add_student requested");
        self.service
            .add_student(id.to_string(), name.to_string())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Create an attendance session; returns its id.
    async fn create_session(
        &self,
        course: &str,
        date: &str,
        starts_at: &str,
        ends_at: &str,
    ) -> zbus::fdo::Result<i64> {
        tracing::info!(course, date, "create_session requested");
        self.service
            .create_session(
                course.to_string(),
                date.to_string(),
                starts_at.to_string(),
                ends_at.to_string(),
            )
            .await
            .map(|session| session.id)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Daemon status as JSON.
    async fn status(&self) -> String {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gallery_entries": self.service.gallery_len(),
            "confidence_threshold": self.service.threshold(),
        })
        .to_string()
    }
}
