//! Per-bucket admission worker
//!
//! Each bucket owns a FIFO of connect nodes and at most one worker task
//! draining it. The worker runs one node, then waits the admission interval
//! before the next one. It exits when the queue is empty; the emptiness check
//! and the "worker active" flag change under the same lock, so a concurrent
//! append either sees the worker still active or starts a new one.

use crate::controller::node::{same_node, ConnectNode};
use crate::controller::ControllerInner;
use crate::error::ErrorKind;
use crate::metrics;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Queue and worker bookkeeping for one bucket
#[derive(Default)]
pub(crate) struct BucketQueue {
    pub(crate) nodes: VecDeque<Arc<dyn ConnectNode>>,
    pub(crate) worker_active: bool,
    /// Nodes appended since the current worker started
    pub(crate) seen: usize,
}

impl BucketQueue {
    /// Queue `node`, replacing any pending node for the same shard.
    pub(crate) fn push(&mut self, node: Arc<dyn ConnectNode>) {
        let shard_id = node.shard_id();
        self.nodes.retain(|queued| queued.shard_id() != shard_id);
        self.nodes.push_back(node);
        self.seen += 1;
    }

    /// Put a failed node back unless a newer node for its shard arrived.
    fn requeue(&mut self, node: Arc<dyn ConnectNode>) {
        let shard_id = node.shard_id();
        if self.nodes.iter().any(|queued| queued.shard_id() == shard_id) {
            return;
        }
        self.nodes.push_back(node);
    }

    pub(crate) fn remove(&mut self, node: &Arc<dyn ConnectNode>) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|queued| !same_node(queued, node));
        before != self.nodes.len()
    }

    fn retire(&mut self) {
        self.worker_active = false;
        self.seen = 0;
    }
}

/// Drain `bucket` until its queue is empty or the controller shuts down.
pub(crate) async fn drain_bucket(inner: Arc<ControllerInner>, bucket: u32) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    debug!(bucket, "Bucket worker started");

    loop {
        let next = {
            let mut state = inner.state.lock();
            if state.shut_down {
                return;
            }
            let Some(queue) = state.buckets.get_mut(&bucket) else {
                return;
            };
            match queue.nodes.pop_front() {
                Some(node) => {
                    let is_last = queue.seen > 1 && queue.nodes.is_empty();
                    Some((node, is_last))
                }
                None => {
                    queue.retire();
                    None
                }
            }
        };

        let Some((node, is_last)) = next else {
            debug!(bucket, "Bucket drained, worker exiting");
            return;
        };

        let shard_id = node.shard_id();
        debug!(
            shard_id,
            bucket,
            reconnect = node.is_reconnect(),
            is_last,
            "Admitting session"
        );

        match node.run(is_last).await {
            Ok(()) => {
                metrics::record_admission(bucket);
            }
            Err(err) => {
                let kind = err.kind();
                metrics::record_requeue(bucket, kind);
                match kind {
                    ErrorKind::Interrupted => {
                        debug!(shard_id, bucket, "Admission interrupted, re-queueing node");
                        let mut state = inner.state.lock();
                        if let Some(queue) = state.buckets.get_mut(&bucket) {
                            queue.requeue(node);
                            queue.retire();
                        }
                        return;
                    }
                    ErrorKind::TransientNetwork | ErrorKind::RateLimited => {
                        warn!(shard_id, bucket, error = %err, "Failed to establish connection, appending to queue");
                    }
                    ErrorKind::Auth | ErrorKind::Config | ErrorKind::Other => {
                        error!(shard_id, bucket, error = %err, "Unexpected error running connect node, appending to queue");
                    }
                }
                let mut state = inner.state.lock();
                if !state.shut_down {
                    if let Some(queue) = state.buckets.get_mut(&bucket) {
                        queue.requeue(node);
                    }
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(inner.admission_interval) => {}
            _ = shutdown.changed() => {
                debug!(bucket, "Bucket worker interrupted during admission interval");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;

    struct Stub(u32);

    #[async_trait]
    impl ConnectNode for Stub {
        fn shard_id(&self) -> u32 {
            self.0
        }
        fn is_reconnect(&self) -> bool {
            false
        }
        async fn run(&self, _is_last: bool) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    fn node(id: u32) -> Arc<dyn ConnectNode> {
        Arc::new(Stub(id))
    }

    #[test]
    fn push_replaces_pending_node_for_same_shard() {
        let mut queue = BucketQueue::default();
        let first = node(2);
        let second = node(2);
        queue.push(first.clone());
        queue.push(node(4));
        queue.push(second.clone());

        let ids: Vec<_> = queue.nodes.iter().map(|n| n.shard_id()).collect();
        assert_eq!(ids, vec![4, 2]);
        assert!(same_node(&queue.nodes[1], &second));
        assert_eq!(queue.seen, 3);
    }

    #[test]
    fn requeue_yields_to_newer_node() {
        let mut queue = BucketQueue::default();
        let newer = node(6);
        queue.push(newer.clone());
        queue.requeue(node(6));
        assert_eq!(queue.nodes.len(), 1);
        assert!(same_node(&queue.nodes[0], &newer));
    }

    #[test]
    fn remove_uses_identity() {
        let mut queue = BucketQueue::default();
        let queued = node(0);
        queue.push(queued.clone());
        assert!(!queue.remove(&node(0)));
        assert!(queue.remove(&queued));
        assert!(queue.nodes.is_empty());
    }
}
