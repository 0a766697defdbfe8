//! Notifications and cooperative cancellation.
//!
//! Every notification goes through one [`EventSink`]. The reply decides what
//! the engine does next; most events only understand `Continue` and
//! `Cancel`.

use oxizip_core::error::ZipError;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An engine notification.
#[derive(Debug)]
pub enum ZipEvent<'a> {
    /// A save is starting.
    SaveStarted {
        /// Number of entries to write.
        entries: usize,
    },
    /// An entry is about to be written.
    SaveEntryStarted {
        /// Entry name.
        name: &'a str,
        /// Position in the save order.
        index: usize,
        /// Number of entries.
        total: usize,
    },
    /// Bytes of the current entry were consumed.
    SaveEntryProgress {
        /// Entry name.
        name: &'a str,
        /// Uncompressed bytes so far.
        bytes: u64,
        /// Uncompressed length, if known.
        total: Option<u64>,
    },
    /// An entry was written.
    SaveEntryCompleted {
        /// Entry name.
        name: &'a str,
    },
    /// The save finished.
    SaveCompleted,
    /// A central directory record was read.
    ReadEntry {
        /// Entry name.
        name: &'a str,
    },
    /// A batch extraction is starting.
    ExtractStarted {
        /// Number of entries.
        entries: usize,
    },
    /// An entry is about to be extracted.
    ExtractEntryStarted {
        /// Entry name.
        name: &'a str,
    },
    /// Bytes of the current entry were produced.
    ExtractEntryProgress {
        /// Entry name.
        name: &'a str,
        /// Bytes so far.
        bytes: u64,
        /// Expected length.
        total: u64,
    },
    /// An entry was extracted.
    ExtractEntryCompleted {
        /// Entry name.
        name: &'a str,
    },
    /// The batch extraction finished.
    ExtractCompleted,
    /// The extraction target exists. Reply `Overwrite`, `Skip` or `Throw`.
    ExtractExisting {
        /// Entry name.
        name: &'a str,
        /// Existing path.
        path: &'a Path,
    },
    /// Reading an entry's source failed during a save.
    /// Reply `Retry`, `Skip`, `Throw` or `Cancel`.
    SaveError {
        /// Entry name.
        name: &'a str,
        /// The failure.
        error: &'a ZipError,
    },
}

/// Reply to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reply {
    /// Go on.
    #[default]
    Continue,
    /// Cancel the whole operation.
    Cancel,
    /// Replace the existing target.
    Overwrite,
    /// Skip this entry.
    Skip,
    /// Try this entry again.
    Retry,
    /// Fail with the pending error.
    Throw,
}

/// Receives engine notifications.
pub trait EventSink {
    /// Handle one event.
    fn notify(&mut self, event: &ZipEvent<'_>) -> Reply;
}

impl<F> EventSink for F
where
    F: FnMut(&ZipEvent<'_>) -> Reply,
{
    fn notify(&mut self, event: &ZipEvent<'_>) -> Reply {
        self(event)
    }
}

/// Shared cancellation flag, polled once per I/O chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Optional sink plus cancellation, as the pipelines see them.
pub(crate) struct Notifier<'s> {
    sink: Option<&'s mut (dyn EventSink + Send)>,
    cancel: CancelToken,
}

impl<'s> Notifier<'s> {
    pub(crate) fn new(sink: Option<&'s mut (dyn EventSink + Send)>, cancel: CancelToken) -> Self {
        Self { sink, cancel }
    }

    pub(crate) fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Deliver an event. A `Cancel` reply trips the token.
    pub(crate) fn notify(&mut self, event: ZipEvent<'_>) -> Reply {
        let reply = match self.sink.as_deref_mut() {
            Some(sink) => sink.notify(&event),
            None => Reply::Continue,
        };
        if reply == Reply::Cancel {
            self.cancel.cancel();
        }
        reply
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink_and_cancel() {
        let mut seen = Vec::new();
        let mut sink = |event: &ZipEvent<'_>| {
            if let ZipEvent::SaveEntryStarted { name, .. } = event {
                seen.push(name.to_string());
                return Reply::Cancel;
            }
            Reply::Continue
        };
        let token = CancelToken::new();
        {
            let mut notifier = Notifier::new(Some(&mut sink), token.clone());
            assert_eq!(notifier.notify(ZipEvent::SaveCompleted), Reply::Continue);
            assert!(!notifier.cancelled());
            notifier.notify(ZipEvent::SaveEntryStarted {
                name: "a.txt",
                index: 0,
                total: 1,
            });
            assert!(notifier.cancelled());
        }
        assert!(token.is_cancelled());
        assert_eq!(seen, ["a.txt"]);

        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_no_sink_continues() {
        let mut notifier = Notifier::new(None, CancelToken::new());
        assert!(!notifier.has_sink());
        assert_eq!(
            notifier.notify(ZipEvent::ExtractStarted { entries: 3 }),
            Reply::Continue
        );
    }
}
