//! Event bus between the engine and whatever renders the message list.
//!
//! Single-threaded by construction: the engine runs on one serialized
//! context, so interior mutability via RefCell is enough. Events are buffered
//! for consumers that poll (`drain`) and pushed to listeners that subscribe.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chat_types::event::ChatEvent;

type Listener = Box<dyn Fn(&ChatEvent)>;

#[derive(Default)]
struct Inner {
    queue: VecDeque<ChatEvent>,
    listeners: Vec<Listener>,
}

/// Shared event bus, cheap to clone (Rc).
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event. Listeners run synchronously, then the event is buffered.
    pub fn emit(&self, event: ChatEvent) {
        // Listeners must not emit re-entrantly; the borrow is shared only.
        for listener in self.inner.borrow().listeners.iter() {
            listener(&event);
        }
        self.inner.borrow_mut().queue.push_back(event);
    }

    /// Register a callback invoked for every subsequent event.
    pub fn subscribe(&self, listener: impl Fn(&ChatEvent) + 'static) {
        self.inner.borrow_mut().listeners.push(Box::new(listener));
    }

    /// Drain all buffered events.
    pub fn drain(&self) -> Vec<ChatEvent> {
        self.inner.borrow_mut().queue.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}
