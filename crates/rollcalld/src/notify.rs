//! Operator notifications for recognition outcomes.
//!
//! Deployments hang a speech engine off this trait; the daemon itself ships
//! a tracing-backed notifier. The service fires exactly one notification per
//! request, keyed off the arbiter outcome, so a retried request that lands
//! on `AlreadyExists` never announces "recorded" twice.

pub trait Notifier: Send + Sync {
    fn recorded(&self, student: &str);
    fn already_recorded(&self, student: &str);
    fn not_recognized(&self);
}

/// Notifier that logs instead of speaking.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn recorded(&self, student: &str) {
        tracing::info!(student, "notify: attendance recorded");
    }

    fn already_recorded(&self, student: &str) {
        tracing::info!(student, "notify: attendance already recorded");
    }

    fn not_recognized(&self) {
        tracing::info!("notify: face not recognized");
    }
}
