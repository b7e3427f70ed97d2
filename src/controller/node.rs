//! Connect node contract
//!
//! A connect node is one pending (re)connection request for a session. The
//! controller decides *when* `run` is invoked; the session layer decides what
//! running means.

use crate::error::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;

/// One session waiting to be admitted
#[async_trait]
pub trait ConnectNode: Send + Sync {
    /// Shard this node connects
    fn shard_id(&self) -> u32;

    /// True when the session is re-establishing a lost connection
    fn is_reconnect(&self) -> bool;

    /// Perform the admitted handshake.
    ///
    /// Returns once the identify payload is on its way, not once the session
    /// is fully ready. `is_last` is true when no other node is waiting in the
    /// bucket, so the implementation may skip any internal pacing.
    async fn run(&self, is_last: bool) -> Result<(), GatewayError>;
}

/// Node identity (pointer equality, ignoring vtables)
pub(crate) fn same_node(a: &Arc<dyn ConnectNode>, b: &Arc<dyn ConnectNode>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
