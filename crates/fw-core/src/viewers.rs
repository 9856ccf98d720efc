use crate::events::ServerEvent;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

pub type ViewerId = u64;

pub const DEFAULT_VIEWER_QUEUE: usize = 256;

/// Sending side of one connected viewer's outbound queue.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    id: ViewerId,
    sender: mpsc::Sender<ServerEvent>,
}

impl ViewerHandle {
    pub fn new(id: ViewerId, sender: mpsc::Sender<ServerEvent>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Never waits: a full queue drops the event for this viewer only.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = "viewer_send_backpressure", viewer = self.id, dropped = event.name());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

pub struct ViewerHub {
    counter: AtomicU64,
    queue: usize,
    viewers: RwLock<HashMap<ViewerId, ViewerHandle>>,
}

impl Default for ViewerHub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_QUEUE)
    }
}

impl ViewerHub {
    pub fn new(queue: usize) -> Self {
        Self {
            counter: AtomicU64::new(0),
            queue: queue.max(1),
            viewers: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_viewer_id(&self) -> ViewerId {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocates an id and a bounded queue; the caller registers the handle
    /// once it is ready to drain the receiver.
    pub fn channel(&self) -> (ViewerHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.queue);
        (ViewerHandle::new(self.next_viewer_id(), tx), rx)
    }

    pub async fn register(&self, handle: ViewerHandle) -> usize {
        let mut viewers = self.viewers.write().await;
        debug!(event = "viewer_registered", viewer = handle.id());
        viewers.insert(handle.id(), handle);
        viewers.len()
    }

    pub async fn unregister(&self, id: ViewerId) -> usize {
        let mut viewers = self.viewers.write().await;
        if viewers.remove(&id).is_some() {
            debug!(event = "viewer_unregistered", viewer = id);
        }
        viewers.len()
    }

    pub async fn count(&self) -> usize {
        self.viewers.read().await.len()
    }

    pub async fn get(&self, id: ViewerId) -> Option<ViewerHandle> {
        self.viewers.read().await.get(&id).cloned()
    }

    /// Delivers to every viewer; closed queues are pruned afterwards.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let targets = {
            let viewers = self.viewers.read().await;
            viewers.values().cloned().collect::<Vec<_>>()
        };
        let mut delivered = 0;
        let mut closed = Vec::new();
        for viewer in targets {
            if viewer.send(event.clone()) {
                delivered += 1;
            } else if viewer.is_closed() {
                closed.push(viewer.id());
            }
        }
        if !closed.is_empty() {
            let mut viewers = self.viewers.write().await;
            for id in closed {
                viewers.remove(&id);
            }
        }
        delivered
    }

    pub async fn send_to(&self, id: ViewerId, event: ServerEvent) -> bool {
        match self.get(id).await {
            Some(viewer) => viewer.send(event),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_skips_gone_viewers_and_prunes_them() {
        let hub = ViewerHub::new(4);
        let (a, mut rx_a) = hub.channel();
        let (b, rx_b) = hub.channel();
        hub.register(a.clone()).await;
        hub.register(b).await;
        drop(rx_b);

        let delivered = hub.broadcast(ServerEvent::Info("hello".into())).await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.count().await, 1);
        assert_eq!(rx_a.recv().await, Some(ServerEvent::Info("hello".into())));
    }

    #[tokio::test]
    async fn full_queue_drops_event_but_keeps_viewer() {
        let hub = ViewerHub::new(1);
        let (a, mut rx) = hub.channel();
        hub.register(a.clone()).await;
        assert!(a.send(ServerEvent::Info("one".into())));
        assert!(!a.send(ServerEvent::Info("two".into())));
        assert_eq!(hub.count().await, 1);
        assert_eq!(rx.recv().await, Some(ServerEvent::Info("one".into())));
    }

    #[tokio::test]
    async fn ids_are_unique_and_unregister_reports_remaining() {
        let hub = ViewerHub::default();
        let (a, _rx_a) = hub.channel();
        let (b, _rx_b) = hub.channel();
        assert_ne!(a.id(), b.id());
        hub.register(a.clone()).await;
        assert_eq!(hub.register(b.clone()).await, 2);
        assert_eq!(hub.unregister(a.id()).await, 1);
        assert!(hub.send_to(b.id(), ServerEvent::Info("x".into())).await);
        assert!(!hub.send_to(a.id(), ServerEvent::Info("x".into())).await);
    }
}
