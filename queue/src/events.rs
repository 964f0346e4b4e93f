use std::sync::{Arc, RwLock};

/// The events a queue emits as jobs move through it.
#[derive(Clone, Debug)]
pub enum QueueEvent {
    Completed {
        job_id: u64,
        result: Option<serde_json::Value>,
    },
    Failed {
        job_id: u64,
        error: String,
    },
    Progress {
        job_id: u64,
        progress: u32,
    },
    Paused,
    Resumed,
    Empty,
    NewJob {
        job_id: u64,
    },
}

type Observer = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// In-process event hub. Delivery is best-effort and not persisted:
/// observers are plain synchronous callbacks invoked on whichever task
/// triggered the event, so a slow observer slows that task down. This is
/// intentionally not a `tokio::sync::broadcast` channel, which would
/// decouple emit from delivery.
#[derive(Clone, Default)]
pub struct EventHub {
    observers: Arc<RwLock<Vec<Observer>>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.observers.write().unwrap().push(Arc::new(observer));
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        let observers = self.observers.read().unwrap();
        for observer in observers.iter() {
            observer(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_subscriber_sees_every_event() {
        let hub = EventHub::new();
        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));

        let a = a_count.clone();
        hub.subscribe(move |_event| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = b_count.clone();
        hub.subscribe(move |_event| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(QueueEvent::Empty);
        hub.emit(QueueEvent::NewJob { job_id: 1 });

        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let hub = EventHub::new();
        hub.emit(QueueEvent::Paused);
    }
}
