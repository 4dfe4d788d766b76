use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Callback<E> = Box<dyn FnMut(&E) -> bool + Send>;

/// Fan-out list of event subscribers.
///
/// Events are handed to every subscriber on the emitting thread, in emission
/// order. Emission holds an internal lock, so events from different threads
/// are totally ordered as well. Callbacks must not block and must not
/// subscribe to the same list re-entrantly.
pub struct Subscribers<E> {
    inner: Arc<Mutex<Vec<Callback<E>>>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.len())
            .finish()
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Returning `false` from it unsubscribes.
    pub fn subscribe_with(&self, callback: impl FnMut(&E) -> bool + Send + 'static) {
        self.lock().push(Box::new(callback));
    }

    /// Deliver `event` to every subscriber.
    pub fn emit(&self, event: E) {
        self.lock().retain_mut(|callback| callback(&event));
    }

    /// Deliver `event` only if `condition` holds, evaluated under the
    /// emission lock. Returns whether the event was emitted.
    ///
    /// Lets a producer couple a state flip with its notification so that no
    /// other emission can interleave between the two.
    pub fn emit_if(&self, condition: impl FnOnce() -> bool, event: E) -> bool {
        let mut subscribers = self.lock();
        if !condition() {
            return false;
        }
        subscribers.retain_mut(|callback| callback(&event));
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Callback<E>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Clone + Send + 'static> Subscribers<E> {
    /// Register a channel subscriber. Dropping the receiver unsubscribes it
    /// on the next emission.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = mpsc::channel();
        self.subscribe_with(move |event: &E| tx.send(event.clone()).is_ok());
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn channel_subscribers_receive_in_order() {
        let subscribers = Subscribers::new();
        let first = subscribers.subscribe();
        let second = subscribers.subscribe();

        for i in 0..5 {
            subscribers.emit(i);
        }

        assert_eq!(first.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(second.try_iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let subscribers = Subscribers::new();
        let kept = subscribers.subscribe();
        drop(subscribers.subscribe());
        assert_eq!(subscribers.len(), 2);

        subscribers.emit("ping");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(kept.recv().unwrap(), "ping");
    }

    #[test]
    fn callback_returning_false_unsubscribes() {
        let subscribers = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        subscribers.subscribe_with(move |_: &u8| counter.fetch_add(1, Ordering::SeqCst) < 1);

        subscribers.emit(1);
        subscribers.emit(2);
        subscribers.emit(3);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn emit_if_skips_when_condition_false() {
        let subscribers = Subscribers::new();
        let rx = subscribers.subscribe();

        assert!(!subscribers.emit_if(|| false, 1));
        assert!(subscribers.emit_if(|| true, 2));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn per_thread_order_is_preserved_across_threads() {
        let subscribers = Subscribers::new();
        let rx = subscribers.subscribe();

        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let subscribers = subscribers.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        subscribers.emit((t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut last = [None::<u32>; 4];
        for (t, i) in rx.try_iter() {
            let slot = &mut last[t as usize];
            assert!(slot.map_or(true, |prev| prev < i));
            *slot = Some(i);
        }
        assert!(last.iter().all(|seen| *seen == Some(99)));
    }
}
