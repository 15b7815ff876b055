use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

type Inflight<T> = Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>;

/// At most one running operation per key. Later callers for the same key
/// attach to the running one and receive its result.
#[derive(Debug)]
pub struct SingleFlight<T> {
    inflight: Inflight<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub enum Flight<T> {
    Leader(FlightLease<T>),
    Follower(watch::Receiver<Option<T>>),
}

/// Held by the caller doing the work. Dropping it releases the key, with or
/// without a published result.
pub struct FlightLease<T> {
    key: String,
    sender: watch::Sender<Option<T>>,
    inflight: Inflight<T>,
    released: bool,
}

fn lock<T>(inflight: &Inflight<T>) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<T>>>> {
    inflight.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, key: &str) -> Flight<T> {
        let mut inflight = lock(&self.inflight);
        if let Some(receiver) = inflight.get(key) {
            return Flight::Follower(receiver.clone());
        }
        let (sender, receiver) = watch::channel(None);
        inflight.insert(key.to_string(), receiver);
        Flight::Leader(FlightLease {
            key: key.to_string(),
            sender,
            inflight: self.inflight.clone(),
            released: false,
        })
    }

    pub fn is_running(&self, key: &str) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    /// `None` when the leader went away without publishing.
    pub async fn wait(mut receiver: watch::Receiver<Option<T>>) -> Option<T> {
        match receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

impl<T> FlightLease<T> {
    /// The key is free again before followers see the value, so a caller
    /// that arrives after completion starts a fresh run.
    pub fn complete(mut self, value: T) {
        self.release();
        self.sender.send_replace(Some(value));
    }

    fn release(&mut self) {
        if !self.released {
            lock(&self.inflight).remove(&self.key);
            self.released = true;
        }
    }
}

impl<T> Drop for FlightLease<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_follows_and_sees_leader_result() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let Flight::Leader(lease) = flights.claim("item_1") else {
            panic!("first claim should lead");
        };
        let Flight::Follower(receiver) = flights.claim("item_1") else {
            panic!("second claim should follow");
        };
        let waiter = tokio::spawn(SingleFlight::wait(receiver));
        lease.complete(7);
        assert_eq!(waiter.await.unwrap(), Some(7));
        assert!(!flights.is_running("item_1"));
        assert!(matches!(flights.claim("item_1"), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn abandoned_lease_releases_followers() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let Flight::Leader(lease) = flights.claim("item_1") else {
            panic!("first claim should lead");
        };
        let Flight::Follower(receiver) = flights.claim("item_1") else {
            panic!("second claim should follow");
        };
        drop(lease);
        assert_eq!(SingleFlight::wait(receiver).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follower_woken_by_completion_can_lead_the_next_run() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        for round in 0..200 {
            let Flight::Leader(lease) = flights.claim("item_1") else {
                panic!("round {round}: key should be free");
            };
            let Flight::Follower(receiver) = flights.claim("item_1") else {
                panic!("round {round}: second claim should follow");
            };
            let next = tokio::spawn({
                let flights = flights.clone();
                async move {
                    let _ = SingleFlight::wait(receiver).await;
                    matches!(flights.claim("item_1"), Flight::Leader(_))
                }
            });
            lease.complete(round);
            assert!(next.await.unwrap(), "round {round}: claim after completion joined a finished run");
        }
    }

    #[test]
    fn keys_are_independent() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let _a = flights.claim("item_a");
        assert!(matches!(flights.claim("item_b"), Flight::Leader(_)));
    }
}
