//! Dialplan lookups and after-bridge continuations.
//!
//! The dialplan itself lives outside the core. Transfers only need two
//! questions answered ("does this extension exist?", "what application
//! is on it?"), plus the ability to record where a channel should
//! continue once its bridge participation ends.

use crate::endpoint::{AfterBridgeReason, Endpoint};
use std::{fmt, sync::Arc};
use tracing::debug;

/// Answers extension queries for the transfer primitives.
pub trait Dialplan: Send + Sync {
    /// Whether `exten` exists within `context`.
    fn exten_exists(&self, context: &str, exten: &str) -> bool;

    /// The application bound to `exten` within `context`, if any.
    fn exten_app(&self, context: &str, exten: &str) -> Option<String>;

    /// Runs a registered application on an endpoint, blocking until
    /// it returns.
    fn run_app(
        &self,
        _endpoint: &Arc<dyn Endpoint>,
        _app: &str,
        _args: &str,
    ) -> crate::error::Result<()> {
        Err(crate::error::Error::InvalidArgument)
    }
}

/// A dialplan location recorded for execution after bridging.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AfterGoto {
    /// Destination context.
    pub context: String,
    /// Destination extension.
    pub exten: String,
    /// Destination priority.
    pub priority: u32,
}

impl AfterGoto {
    /// Creates a goto record.
    #[must_use]
    pub fn new(context: &str, exten: &str, priority: u32) -> Self {
        Self {
            context: context.to_string(),
            exten: exten.to_string(),
            priority,
        }
    }
}

impl fmt::Display for AfterGoto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.context, self.exten, self.priority)
    }
}

/// A callback recorded for execution after bridging.
///
/// The failure arm runs instead of the callback when the continuation
/// is discarded unrun, so the installer can release what it captured.
pub struct AfterCallback {
    /// Runs when the channel leaves its bridge normally.
    pub callback: Box<dyn FnOnce(&Arc<dyn Endpoint>) + Send>,
    /// Runs when the continuation is discarded, with the reason.
    pub failed: Option<Box<dyn FnOnce(AfterBridgeReason) + Send>>,
}

impl AfterCallback {
    /// Creates a continuation with no failure arm.
    #[must_use]
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&Arc<dyn Endpoint>) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            failed: None,
        }
    }

    /// Creates a continuation with a failure arm.
    #[must_use]
    pub fn with_failed<F, G>(callback: F, failed: G) -> Self
    where
        F: FnOnce(&Arc<dyn Endpoint>) + Send + 'static,
        G: FnOnce(AfterBridgeReason) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
            failed: Some(Box::new(failed)),
        }
    }
}

impl fmt::Debug for AfterCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AfterCallback([function], failed: {})",
            self.failed.is_some()
        )
    }
}

/// Discards any recorded after-bridge callback, running its failure
/// arm with the given reason.
pub fn discard_after_callback(endpoint: &Arc<dyn Endpoint>, reason: AfterBridgeReason) {
    if let Some(cb) = endpoint.take_after_callback() {
        debug!(
            "Discarding after-bridge callback on {} ({:?}).",
            endpoint.name(),
            reason
        );
        if let Some(failed) = cb.failed {
            failed(reason);
        }
    }
}

/// Runs the recorded after-bridge continuation, if any.
///
/// A callback takes precedence over a goto; installing either discards
/// the other, so at most one fires.
pub fn run_after(endpoint: &Arc<dyn Endpoint>) {
    if let Some(cb) = endpoint.take_after_callback() {
        debug!("Running after-bridge callback on {}.", endpoint.name());
        (cb.callback)(endpoint);
        return;
    }

    if let Some(dest) = endpoint.take_after_goto() {
        debug!("After-bridge goto {} on {}.", dest, endpoint.name());
        if endpoint.async_goto(&dest.context, &dest.exten, dest.priority).is_err() {
            debug!("After-bridge goto failed on {}.", endpoint.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEndpoint;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[test]
    fn callback_outranks_goto() {
        let endpoint: Arc<dyn Endpoint> = MockEndpoint::new("SIP/a-1");
        let ran = Arc::new(AtomicBool::new(false));

        endpoint.set_after_goto(AfterGoto::new("default", "100", 1));
        {
            let ran = ran.clone();
            endpoint.set_after_callback(AfterCallback::new(move |_ep| {
                ran.store(true, Ordering::SeqCst);
            }));
        }

        run_after(&endpoint);
        assert!(ran.load(Ordering::SeqCst));

        // The goto is still recorded but must not have fired.
        let mock = MockEndpoint::new("SIP/b-1");
        let as_dyn: Arc<dyn Endpoint> = mock.clone();
        as_dyn.set_after_goto(AfterGoto::new("default", "100", 1));
        run_after(&as_dyn);
        assert_eq!(mock.gotos(), vec![("default".into(), "100".into(), 1)]);
    }

    #[test]
    fn discard_runs_the_failure_arm() {
        let endpoint: Arc<dyn Endpoint> = MockEndpoint::new("SIP/a-1");
        let failed_with = Arc::new(parking_lot::Mutex::new(None));

        {
            let failed_with = failed_with.clone();
            endpoint.set_after_callback(AfterCallback::with_failed(
                |_ep| panic!("must not run"),
                move |reason| {
                    *failed_with.lock() = Some(reason);
                },
            ));
        }

        discard_after_callback(&endpoint, AfterBridgeReason::Depart);
        assert_eq!(*failed_with.lock(), Some(AfterBridgeReason::Depart));

        // Idempotent: nothing left to discard.
        discard_after_callback(&endpoint, AfterBridgeReason::Destroy);
    }

    #[test]
    fn goto_renders_as_location() {
        let dest = AfterGoto::new("default", "100", 1);
        assert_eq!(dest.to_string(), "default,100,1");
    }
}
