//! Async fan-out pub/sub: publishers send into one channel, a background
//! task relays each event to every currently-registered subscriber.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, Receiver, Sender};

pub struct EventManager<T: Send + Clone + 'static> {
    senders: Arc<Mutex<Vec<Sender<T>>>>,
    sender: Sender<T>,
}

impl<T: Send + Clone + 'static> EventManager<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let senders: Arc<Mutex<Vec<Sender<T>>>> = Arc::new(Mutex::new(Vec::new()));
        spawn_fanout(receiver, senders.clone());
        EventManager { senders, sender }
    }

    /// A sender usable by any publisher of this event type.
    pub fn create_sender(&self) -> Sender<T> {
        self.sender.clone()
    }

    /// A fresh receiver that will observe every event published from now on.
    pub fn create_receiver(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        rx
    }

    /// Convenience for publishing directly without holding onto a `Sender`.
    pub async fn publish(&self, event: T) {
        let _ = self.sender.send(event).await;
    }
}

fn spawn_fanout<T: Send + Clone + 'static>(
    mut receiver: Receiver<T>,
    senders: Arc<Mutex<Vec<Sender<T>>>>,
) {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let subscribers: Vec<Sender<T>> = senders.lock().unwrap().clone();
            for sub in subscribers {
                let _ = sub.send(event.clone()).await;
            }
        }
    });
}

impl<T: Send + Clone + 'static> Default for EventManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_every_subscriber() {
        let manager: EventManager<u32> = EventManager::new();
        let mut rx1 = manager.create_receiver();
        let mut rx2 = manager.create_receiver();

        manager.publish(42).await;

        assert_eq!(rx1.recv().await, Some(42));
        assert_eq!(rx2.recv().await, Some(42));
    }
}
