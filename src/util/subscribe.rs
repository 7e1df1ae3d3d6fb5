/// Handle returned by every listener registration; calling it detaches the listener.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Handle that does nothing, returned when a registration could not be made so callers
/// can always invoke what they were given.
pub fn noop_unsubscribe() -> Unsubscribe {
    Box::new(|| {})
}
