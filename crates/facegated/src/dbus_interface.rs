use facegate_core::OnnxAnalyzer;
use facegate_hw::Camera;
use serde::Serialize;
use zbus::interface;

use crate::service::{Service, ServiceError};

pub const BUS_NAME: &str = "org.facegate.FaceGate1";
pub const OBJECT_PATH: &str = "/org/facegate/FaceGate1";

/// D-Bus interface for the FaceGate daemon.
///
/// Bus name: org.facegate.FaceGate1
/// Object path: /org/facegate/FaceGate1
pub struct FaceGateService {
    pub service: Service<OnnxAnalyzer, Camera>,
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Busy => zbus::fdo::Error::LimitsExceeded(e.to_string()),
            _ => zbus::fdo::Error::Failed(e.to_string()),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facegate.FaceGate1")]
impl FaceGateService {
    /// Scan a live face and store it as `user`'s enrollment.
    ///
    /// Returns the enrollment id.
    async fn register(&self, user: &str) -> zbus::fdo::Result<String> {
        tracing::info!(user, "register requested");
        if user.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("user must not be empty".into()));
        }
        self.service.register(user).await.map_err(|e| {
            tracing::error!(error = %e, user, "register failed");
            e.into()
        })
    }

    /// Scan a live face and match it against all active enrollments.
    ///
    /// Returns JSON `{user, enrollment_id, distance}`.
    async fn authenticate(&self) -> zbus::fdo::Result<String> {
        tracing::info!("authenticate requested");
        let authenticated = self.service.authenticate().await.map_err(|e| {
            tracing::warn!(error = %e, "authenticate failed");
            zbus::fdo::Error::from(e)
        })?;
        tracing::info!(user = %authenticated.user, distance = authenticated.distance, "authenticated");
        to_json(&authenticated)
    }

    async fn cancel(&self) -> bool {
        let cancelled = self.service.cancel();
        tracing::info!(cancelled, "cancel requested");
        cancelled
    }

    /// JSON snapshot of the current or last scan, `null` before the first.
    async fn progress(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.progress())
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.status().await?)
    }

    async fn list_enrollments(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.list().await?)
    }

    async fn remove_enrollment(&self, user: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(user, "remove_enrollment requested");
        Ok(self.service.remove(user).await?)
    }

    async fn set_active(&self, user: &str, active: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(user, active, "set_active requested");
        Ok(self.service.set_active(user, active).await?)
    }
}
