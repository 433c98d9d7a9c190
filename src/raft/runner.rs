use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::{NodeStatus, RaftNode};
use crate::network::Envelope;

// Stand-in deadline for the disabled timer branch of the select.
const IDLE: Duration = Duration::from_secs(24 * 60 * 60);

/// Drives one [`RaftNode`]: a single consumer of its inbox and timers, so
/// handlers for the node never run concurrently.
pub struct NodeRunner {
    node: RaftNode,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
    status: watch::Sender<NodeStatus>,
}

impl NodeRunner {
    pub fn new(
        node: RaftNode,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        shutdown: CancellationToken,
    ) -> (Self, watch::Receiver<NodeStatus>) {
        let (status, status_rx) = watch::channel(node.status());
        let runner = Self {
            node,
            inbox,
            shutdown,
            status,
        };
        (runner, status_rx)
    }

    /// Runs until the shutdown token is cancelled or the inbox closes, and
    /// returns the node's final status. A cancellation is only observed
    /// between iterations.
    pub async fn run(mut self) -> NodeStatus {
        let id = self.node.id();
        self.node.start();
        self.publish();

        loop {
            let next = self.node.next_deadline();
            let wake_at = next
                .map(|(deadline, _)| deadline)
                .unwrap_or_else(|| Instant::now() + IDLE);

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!("{id} received shutdown signal");
                    break;
                }
                envelope = self.inbox.recv() => match envelope {
                    Some(envelope) => self.node.handle_envelope(envelope),
                    None => {
                        info!("{id} inbox closed, stopping");
                        break;
                    }
                },
                _ = sleep_until(wake_at), if next.is_some() => {
                    if let Some((_, kind)) = next {
                        self.node.on_timer(kind);
                    }
                }
            }

            self.publish();
        }

        let status = self.node.status();
        info!("{id} stopped as {} in term {}", status.role, status.term);
        status
    }

    fn publish(&self) {
        let status = self.node.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
