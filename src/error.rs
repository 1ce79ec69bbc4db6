//! Error taxonomy for the transactional kernel.
//!
//! These are kinds, not exception types: `Abort` covers every conflict a
//! caller is expected to retry, `Capacity` and `Invariant` are fatal and
//! indicate a misconfiguration or a bug in the kernel itself.

use std::fmt;

/// Failure produced by a transaction attempt or a kernel-internal check.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// A conflict was detected during the commit protocol (failed `cp_lock`,
    /// failed `cp_check`, a lost queue try-lock, or an empty-queue read on a
    /// queue whose version has since advanced). All transaction state has
    /// already been rolled back by the time this is returned; the caller
    /// decides whether to retry.
    Abort,
    /// A queue install found the ring full. This is a configuration error:
    /// the ring should be sized to the maximum number of in-flight items.
    Capacity,
    /// An internal inconsistency was detected (e.g. `find_visible` walked off
    /// the end of a chain). Implies a bug in the kernel; always fatal.
    Invariant(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Abort => write!(f, "transaction aborted"),
            Error::Capacity => write!(f, "queue ring buffer is full"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type used throughout the commit protocol and its adapters.
pub type TxResult<T> = Result<T, Error>;

/// Retries a transaction body against a [`crate::Runtime`] until it commits.
///
/// Mirrors the retry boundary spec.md §4.4 assumes callers provide: each
/// iteration begins a fresh [`crate::TransactionContext`], runs `$body`, and
/// calls `try_commit`. A body that itself returns `Err(Error::Abort)`
/// (e.g. a queue read on an empty queue) also triggers a retry.
#[macro_export]
macro_rules! retry {
    ($runtime:expr, |$txn:ident| $body:expr) => {{
        loop {
            let mut $txn = $crate::TransactionContext::begin($runtime);
            let result = (|| -> $crate::error::TxResult<_> { $body })();
            match result {
                Ok(value) => {
                    if $txn.try_commit() {
                        break value;
                    }
                }
                Err($crate::error::Error::Abort) => {
                    $txn.abort();
                }
                Err(other) => panic!("fatal transaction error: {other}"),
            }
        }
    }};
}
