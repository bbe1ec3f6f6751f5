//! Multi-subscriber event used by the monitor pool to publish domain state
//! transitions. Subscribers run on the emitting task's thread and must not
//! block; a panicking subscriber is logged and never tears the task down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use log::warn;
use uuid::Uuid;

type Subscriber = Box<dyn Fn(Uuid, bool) + Send + Sync>;

pub struct DomainStateChangeEvent {
    name: &'static str,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl DomainStateChangeEvent {
    pub fn new(name: &'static str) -> Self {
        DomainStateChangeEvent {
            name,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, subscriber: impl Fn(Uuid, bool) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Box::new(subscriber));
    }

    pub fn emit(&self, sd_uuid: Uuid, valid: bool) {
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(sd_uuid, valid))).is_err() {
                warn!("Could not emit {} for domain {sd_uuid}", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let event = DomainStateChangeEvent::new("test.onDomainStateChange");
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let count = count.clone();
            event.register(move |_, valid| {
                if valid {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        event.emit(Uuid::new_v4(), true);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_subscriber_is_contained() {
        let event = DomainStateChangeEvent::new("test.onDomainStateChange");
        let count = Arc::new(AtomicU32::new(0));

        event.register(|_, _| panic!("subscriber bug"));
        let count_clone = count.clone();
        event.register(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        event.emit(Uuid::new_v4(), false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
