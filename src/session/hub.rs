use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, RwLock};

use super::ClientId;
use crate::protocol::ServerEvent;

/// Media events a connection may have queued before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 64;

/// Sending half of a connection's queue.
///
/// One FIFO carries every event so ordering is preserved. Control events
/// are always accepted; media events are dropped once `media_capacity` of
/// them are waiting.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Arc<ServerEvent>>,
    queued_media: Arc<AtomicUsize>,
    media_capacity: usize,
}

/// Receiving half, drained by the connection's writer task.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Arc<ServerEvent>>,
    queued_media: Arc<AtomicUsize>,
}

pub fn outbox(media_capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued_media = Arc::new(AtomicUsize::new(0));
    (
        Outbox {
            tx,
            queued_media: Arc::clone(&queued_media),
            media_capacity,
        },
        Inbox { rx, queued_media },
    )
}

enum Offer {
    Queued,
    MediaFull,
    Closed,
}

impl Outbox {
    fn offer(&self, event: Arc<ServerEvent>) -> Offer {
        let media = event.is_media();
        if media {
            let admitted = self
                .queued_media
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.media_capacity).then_some(n + 1)
                })
                .is_ok();
            if !admitted {
                return Offer::MediaFull;
            }
        }
        match self.tx.send(event) {
            Ok(()) => Offer::Queued,
            Err(_) => {
                if media {
                    self.queued_media.fetch_sub(1, Ordering::AcqRel);
                }
                Offer::Closed
            }
        }
    }
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Arc<ServerEvent>> {
        let event = self.rx.recv().await?;
        self.taken(&event);
        Some(event)
    }

    pub fn try_recv(&mut self) -> Result<Arc<ServerEvent>, TryRecvError> {
        let event = self.rx.try_recv()?;
        self.taken(&event);
        Ok(event)
    }

    fn taken(&self, event: &ServerEvent) {
        if event.is_media() {
            self.queued_media.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Fan-out to connected clients. Never blocks: a client that is behind
/// misses media, never control events.
#[derive(Clone, Default)]
pub struct Hub {
    peers: Arc<RwLock<HashMap<ClientId, Outbox>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, client: ClientId, outbox: Outbox) {
        self.peers.write().await.insert(client, outbox);
    }

    pub async fn unregister(&self, client: &str) {
        self.peers.write().await.remove(client);
    }

    pub async fn send_to(&self, client: &str, event: ServerEvent) {
        if let Some(outbox) = self.peers.read().await.get(client) {
            deliver(client, outbox, Arc::new(event));
        }
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        let event = Arc::new(event);
        for (client, outbox) in self.peers.read().await.iter() {
            deliver(client, outbox, Arc::clone(&event));
        }
    }
}

fn deliver(client: &str, outbox: &Outbox, event: Arc<ServerEvent>) {
    let name = event.name();
    match outbox.offer(event) {
        Offer::Queued => {}
        Offer::MediaFull => tracing::trace!(client, "outbox full, {} dropped", name),
        Offer::Closed => tracing::debug!(client, "outbox closed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatsPayload;

    fn stats() -> ServerEvent {
        ServerEvent::Stats(StatsPayload {
            fps: 30.0,
            frame_size: 1024,
            resolution: "1920x1080".into(),
            encoder: "jpeg".into(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_and_send_to_one() {
        let hub = Hub::new();
        let (a_tx, mut a_rx) = outbox(4);
        let (b_tx, mut b_rx) = outbox(4);
        hub.register("a".into(), a_tx).await;
        hub.register("b".into(), b_tx).await;

        hub.broadcast(ServerEvent::ClientCountUpdated { count: 2 }).await;
        hub.send_to("b", ServerEvent::AudioError { message: "none".into() }).await;

        assert_eq!(a_rx.recv().await.unwrap().name(), "client_count_updated");
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.recv().await.unwrap().name(), "client_count_updated");
        assert_eq!(b_rx.recv().await.unwrap().name(), "audio_error");
    }

    #[tokio::test]
    async fn full_outbox_drops_media_only() {
        let hub = Hub::new();
        let (tx, mut rx) = outbox(2);
        hub.register("slow".into(), tx).await;
        for _ in 0..10 {
            hub.broadcast(stats()).await;
        }
        for count in 0..3 {
            hub.broadcast(ServerEvent::ClientCountUpdated { count }).await;
        }

        let mut names = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            names.push(ev.name());
        }
        assert_eq!(
            names,
            [
                "stats",
                "stats",
                "client_count_updated",
                "client_count_updated",
                "client_count_updated"
            ]
        );
    }

    #[tokio::test]
    async fn takeover_notice_survives_a_backlog_of_media() {
        let hub = Hub::new();
        let (tx, mut rx) = outbox(OUTBOX_CAPACITY);
        hub.register("old".into(), tx).await;
        for _ in 0..OUTBOX_CAPACITY * 2 {
            hub.send_to("old", stats()).await;
        }
        hub.send_to(
            "old",
            ServerEvent::SharingTakenOver {
                new_sharer: "new".into(),
            },
        )
        .await;

        let mut media = 0;
        let mut last = None;
        while let Ok(ev) = rx.try_recv() {
            if ev.is_media() {
                media += 1;
            }
            last = Some(ev);
        }
        assert_eq!(media, OUTBOX_CAPACITY);
        let Some(last) = last else {
            panic!("nothing delivered");
        };
        assert!(matches!(&*last, ServerEvent::SharingTakenOver { new_sharer } if new_sharer == "new"));
    }

    #[tokio::test]
    async fn draining_frees_media_slots() {
        let (tx, mut rx) = outbox(1);
        assert!(matches!(tx.offer(Arc::new(stats())), Offer::Queued));
        assert!(matches!(tx.offer(Arc::new(stats())), Offer::MediaFull));
        rx.recv().await.unwrap();
        assert!(matches!(tx.offer(Arc::new(stats())), Offer::Queued));
    }

    #[tokio::test]
    async fn unregistered_clients_get_nothing() {
        let hub = Hub::new();
        let (tx, mut rx) = outbox(4);
        hub.register("gone".into(), tx).await;
        hub.unregister("gone").await;
        hub.broadcast(ServerEvent::ClientCountUpdated { count: 0 }).await;
        assert!(rx.recv().await.is_none());
    }
}
