//! The application-supplied callback invoked for each message inside a
//! NOTIFY frame.

use agent_wire::{ActionWriter, Message};

/// Handles one SPOE message, appending any `SET-VAR`/`UNSET-VAR` actions it
/// wants acknowledged back to HAProxy into `w`.
///
/// Implementations must not block for long: the scheduler runs a fixed
/// pool of workers, and a slow handler call holds that worker (and the
/// frame it's processing) until it returns.
pub trait Handler: Send + Sync {
    fn handle_spoe(&self, w: &mut ActionWriter<'_>, m: &mut Message<'_>);
}

/// Adapts a plain closure into a [`Handler`].
pub struct HandlerFn<F>(pub F)
where
    F: Fn(&mut ActionWriter<'_>, &mut Message<'_>) + Send + Sync;

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut ActionWriter<'_>, &mut Message<'_>) + Send + Sync,
{
    fn handle_spoe(&self, w: &mut ActionWriter<'_>, m: &mut Message<'_>) {
        (self.0)(w, m)
    }
}
