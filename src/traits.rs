//! Core traits for the push channel surface.

/// Receiver for inbound push payloads.
///
/// Invoked once per inbound text frame, in arrival order, with the payload
/// passed through uninterpreted. Implemented for any suitable closure, so a
/// plain `|payload: String| { ... }` works as a handler.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one inbound payload.
    fn on_message(&self, payload: String);
}

impl<F> MessageHandler for F
where
    F: Fn(String) + Send + Sync + 'static,
{
    fn on_message(&self, payload: String) {
        self(payload);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |payload: String| sink.lock().expect("lock").push(payload);

        handler.on_message("one".to_owned());
        handler.on_message("two".to_owned());

        assert_eq!(*seen.lock().expect("lock"), vec!["one", "two"]);
    }
}
