// ── MEF link seam ──
//
// The federated-edge link runs its own connect timer. The lifecycle layer
// only starts and stops that timer around manager switches and hands it
// the in-use chain once a FusionDirector session is up.

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::MefCert;

#[async_trait]
pub trait MefLink: Send + Sync {
    async fn start_connect_timer(&self);

    async fn stop_connect_timer(&self);

    /// The MEF peer is connected and accepts identity updates.
    fn ready_for_send(&self) -> bool;

    async fn send_fd_info(&self, cert: MefCert) -> Result<(), CoreError>;
}

/// Used when the device has no MEF link.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledMef;

#[async_trait]
impl MefLink for DisabledMef {
    async fn start_connect_timer(&self) {}

    async fn stop_connect_timer(&self) {}

    fn ready_for_send(&self) -> bool {
        false
    }

    async fn send_fd_info(&self, _cert: MefCert) -> Result<(), CoreError> {
        Ok(())
    }
}
