//! Error taxonomy for the topology engine.
//!
//! One `error_chain!` invocation producing a paired `Error`/`ErrorKind`,
//! with `foreign_links` for the I/O errors the reference journal/allocator
//! collaborators can raise.

error_chain::error_chain! {
    foreign_links {
        Io(std::io::Error);
    }

    errors {
        /// Disk-space reservation could not be satisfied.
        NoSpace {
            description("no space left for disk reservation")
            display("no space left to reserve disk space for a topology update")
        }
        /// Journal pre-reservation could not be satisfied.
        JournalFull {
            description("journal pre-reservation exhausted")
            display("could not pre-reserve journal space")
        }
        /// The journal is in a fatal, unmount-pending error state.
        JournalError {
            description("journal is in error state")
            display("journal has entered a fatal error state; topology updates are short-circuited")
        }
        /// A resource is momentarily unavailable; retry after the supplied waiter fires.
        Again {
            description("resource momentarily unavailable")
            display("resource momentarily unavailable, retry after wake-up")
        }
        /// A lock was lost (or would have deadlocked); the caller must re-descend.
        Restart {
            description("lock ordering requires a restart")
            display("topology operation must restart from the root")
        }
        /// The node reserve pool could not supply enough preallocated nodes.
        ReserveExhausted {
            description("node reserve pool exhausted")
            display("node reserve pool could not supply the requested number of nodes")
        }
        /// An invariant was violated. Unrecoverable; the caller should abort.
        Fatal(msg: String) {
            description("invariant violated")
            display("fatal invariant violation: {}", msg)
        }
    }
}

impl Error {
    /// True if this error should be converted to [`ErrorKind::Restart`] when
    /// observed by a `NoUnlock` caller that cannot park on a waiter.
    pub fn is_again(&self) -> bool {
        matches!(self.kind(), ErrorKind::Again)
    }

    /// Convert an `Again` into a `Restart`, as required of `NoUnlock`
    /// callers that cannot park on a waiter. Leaves other errors untouched.
    pub fn again_to_restart(self) -> Error {
        if self.is_again() {
            ErrorKind::Restart.into()
        } else {
            self
        }
    }
}
