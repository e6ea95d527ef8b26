//! Establishing, tearing down and replacing the pipe of an endpoint.

use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};
use crate::endpoint::RpcEndpoint;
use crate::error::RpcError;
use crate::pipe::CancelPredicate;

impl RpcEndpoint {
    /// Creates a new pipe to the server. This resets the round trip estimates and the
    ///  congestion window, since nothing that was learned about the previous pipe applies to
    ///  the new one.
    pub(crate) async fn connect(&self, cancel: &CancelPredicate) -> Result<(), RpcError> {
        if self.is_unmounted() {
            return Err(RpcError::Fatal("endpoint is unmounted".to_string()));
        }

        let connect = self.connector.connect(&self.config);
        tokio::pin!(connect);

        let pipe = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(pipe) => break pipe,
                    Err(e) => {
                        debug!("connecting to {:?} failed: {}", self.config.server_addr, e);
                        return Err(e.into());
                    }
                },
                _ = tokio::time::sleep(self.config.cancel_poll) => {
                    if self.is_interrupted(cancel) {
                        debug!("connecting to {:?} was interrupted", self.config.server_addr);
                        return Err(RpcError::Cancelled);
                    }
                }
            }
        };

        *self.pipe.write().unwrap() = Some(pipe);
        *self.pending_record.lock().unwrap() = None;
        self.congestion.lock().unwrap().reset();
        debug!("connected to {:?}", self.config.server_addr);
        Ok(())
    }

    /// Shuts down and drops the pipe, if there is one
    pub(crate) async fn disconnect(&self) {
        let pipe = self.pipe.write().unwrap().take();
        if let Some(pipe) = pipe {
            debug!("disconnecting from {:?}", self.config.server_addr);
            pipe.shutdown().await;
        }
    }

    /// Replaces the pipe, retrying until a connection is established or the calling context is
    ///  interrupted. All requests in flight are flagged for retransmission on the new pipe.
    ///
    /// NB: This requires the caller to hold the send lock, which is enforced by the `_send_guard`
    ///      parameter
    pub(crate) async fn reconnect(&self, _send_guard: &MutexGuard<'_, ()>, cancel: &CancelPredicate) -> Result<(), RpcError> {
        info!("reconnecting to {:?}", self.config.server_addr);
        self.disconnect().await;

        loop {
            match self.connect(cancel).await {
                Ok(()) => break,
                Err(RpcError::Cancelled) => return Err(RpcError::Cancelled),
                Err(e @ RpcError::Fatal(_)) => return Err(e),
                Err(e) => {
                    if self.is_interrupted(cancel) {
                        return Err(RpcError::Cancelled);
                    }
                    warn!("reconnecting to {:?} failed: {} - retrying", self.config.server_addr, e);
                    // pace the retries, the connector may fail immediately
                    tokio::time::sleep(self.config.cancel_poll).await;
                }
            }
        }

        self.registry.mark_all_must_resend();
        self.stats.inc_reconnects();
        info!("reconnected to {:?}", self.config.server_addr);
        Ok(())
    }
}
