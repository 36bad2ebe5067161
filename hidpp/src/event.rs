use std::sync::Mutex;

/// A simple event emitter sending a single event to multiple channels.
#[derive(Debug)]
pub struct EventEmitter<T: Clone> {
    senders: Mutex<Vec<flume::Sender<T>>>,
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Creates a new receiver and adds the corresponding sender to the sender
    /// list.
    pub fn create_receiver(&self) -> flume::Receiver<T> {
        let (tx, rx) = flume::unbounded();
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Emits an event to all senders. Senders whose receivers were dropped are
    /// removed from the list.
    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    /// Drops every registered sender, which disconnects all receivers.
    pub fn close(&self) {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::EventEmitter;

    #[test]
    fn emits_to_every_live_receiver() {
        let emitter = EventEmitter::new();
        let first = emitter.create_receiver();
        let second = emitter.create_receiver();
        drop(second);

        emitter.emit(7u8);
        assert_eq!(first.try_recv(), Ok(7));
        assert_eq!(emitter.senders.lock().unwrap().len(), 1);

        emitter.close();
        assert!(first.recv().is_err());
    }
}
