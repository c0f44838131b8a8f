//! Calls to blocking plugin methods.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Instance, Lifecycle};

/// The plugin call did not return normally.
#[derive(Debug)]
pub(crate) enum CallError {
    /// The plugin panicked. The message of the panic is kept.
    Panicked(String),
    /// The call did not return within the cancellation grace period, after cancellation.
    /// The instance has been abandoned: it will be closed when the call returns.
    Unresponsive,
    /// The instance is not available anymore, because a previous call was abandoned.
    Unavailable,
}

/// Runs `f` on the blocking thread pool, with exclusive access to the plugin instance.
///
/// The instance is moved to the blocking thread and moved back to `slot` when `f` returns.
/// If `cancel` is triggered, the call gets `grace` more time to return. After that,
/// the call is abandoned and `slot` stays empty.
pub(crate) async fn call_blocking<P, R, F>(
    slot: &mut Option<Instance<P>>,
    cancel: &CancellationToken,
    grace: Duration,
    f: F,
) -> Result<R, CallError>
where
    P: ?Sized + Lifecycle + 'static,
    R: Send + 'static,
    F: FnOnce(&mut P) -> R + Send + 'static,
{
    let Some(mut instance) = slot.take() else {
        return Err(CallError::Unavailable);
    };
    let mut handle = tokio::task::spawn_blocking(move || {
        let res = catch_unwind(AssertUnwindSafe(|| f(instance.get_mut())));
        (instance, res)
    });

    let joined = tokio::select! {
        res = &mut handle => res,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(res) => res,
                Err(_) => return Err(CallError::Unresponsive),
            }
        }
    };

    match joined {
        Ok((instance, Ok(res))) => {
            *slot = Some(instance);
            Ok(res)
        }
        Ok((instance, Err(panic))) => {
            *slot = Some(instance);
            Err(CallError::Panicked(panic_message(panic.as_ref())))
        }
        // The blocking task was cancelled by the runtime shutdown.
        Err(e) => Err(CallError::Panicked(e.to_string())),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}
