//! The callback surface a Peers listener dispatches into.

use crate::handshake::Handshake;
use crate::sticktable::EntryUpdate;

/// Receives handshake and stick-table events for one connection.
///
/// `handle_update`'s `definition` is the table the update was decoded
/// against; it is shared with every other update dispatched off the same
/// connection and replaced wholesale by the next `Definition` message, so a
/// handler that needs to retain it past the call must clone the fields it
/// cares about.
pub trait Handler: Send + Sync {
    fn handle_handshake(&self, handshake: &Handshake) {
        let _ = handshake;
    }

    fn handle_update(&self, definition: &crate::sticktable::Definition, update: &EntryUpdate);
}

/// Adapts a plain closure over `(definition, update)` into a [`Handler`].
pub struct HandlerFn<F>(pub F)
where
    F: Fn(&crate::sticktable::Definition, &EntryUpdate) + Send + Sync;

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&crate::sticktable::Definition, &EntryUpdate) + Send + Sync,
{
    fn handle_update(&self, definition: &crate::sticktable::Definition, update: &EntryUpdate) {
        (self.0)(definition, update)
    }
}
