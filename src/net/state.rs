//! The socket channel's lifecycle flags, split into orthogonal sub-states.
//!
//! Rather than one wide bitmask, the state is a small struct of independent groups:
//! connectivity, read pipeline, write pipeline, rate limit. Illegal combinations are mostly
//! unrepresentable and the remaining cross-group invariants can be asserted in one place.

/// The connection-level phase of the channel. Moves forward except for the ClosePending ->
/// Closing hand-off once in-flight writes drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Freshly created, not yet dialed, bound or listening.
    Idle,
    /// Non-blocking connect issued, completion pending as write readiness.
    Connecting,
    Connected,
    Listening,
    /// Close requested while a write was in flight or bandwidth suspended; the close executes
    /// once the drain settles.
    ClosePending,
    /// Both halves are being shut down right now.
    Closing,
    Closed,
}

/// Read pipeline flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadPipeline {
    /// Read readiness interest is armed with the poller.
    pub watching: bool,
    pub shutdown: bool,
    pub shutting_down: bool,
    pub error: bool,
    /// Readiness goes to the built-in recv loop rather than a caller override.
    pub use_default: bool,
}

/// Write pipeline flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WritePipeline {
    /// Write readiness interest is armed with the poller.
    pub watching: bool,
    pub shutdown: bool,
    /// A write-half shutdown waits for the in-flight drain.
    pub shutdown_pending: bool,
    pub shutting_down: bool,
    pub error: bool,
    /// The drain loop is on the stack right now.
    pub writing: bool,
    pub use_default: bool,
    /// Reentrancy barrier for the inline fast-write drain.
    pub barrier: bool,
}

/// Bandwidth limit flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    /// The drain is suspended on an exhausted token budget.
    pub suspended: bool,
    /// The refill timer is armed.
    pub timer_armed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFlags {
    pub conn: Connectivity,
    pub read: ReadPipeline,
    pub write: WritePipeline,
    pub rate: RateLimit,
    /// The owning loop delivered its terminating notification.
    pub loop_terminating: bool,
}

impl ChannelFlags {
    pub fn new() -> ChannelFlags {
        ChannelFlags {
            conn: Connectivity::Idle,
            read: ReadPipeline::default(),
            write: WritePipeline::default(),
            rate: RateLimit::default(),
            loop_terminating: false,
        }
    }

    /// Whether an outbound drain is in flight in any form; close must defer while this holds.
    pub fn write_in_flight(&self) -> bool {
        self.write.writing || self.write.watching || self.rate.suspended
    }

    /// Cross-group invariants that hold at every steady state (between loop callbacks).
    pub fn check(&self) {
        // Bandwidth suspension means the drain resumes from the refill tick, never from
        // write readiness.
        debug_assert!(!(self.rate.suspended && self.write.watching));
        debug_assert!(!(self.rate.suspended && self.write.barrier));
        // A shut down half keeps no interest armed.
        debug_assert!(!(self.read.shutdown && self.read.watching));
        debug_assert!(!(self.write.shutdown && self.write.watching));
        if self.conn == Connectivity::Closed {
            debug_assert!(!self.read.watching && !self.write.watching);
        }
    }
}

impl Default for ChannelFlags {
    fn default() -> Self {
        ChannelFlags::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The combinations the channel state machine actually permits, one steady state per row.
    #[test]
    fn permitted_combinations_pass_the_invariant_check() {
        let mut cases: Vec<ChannelFlags> = Vec::new();

        // Fresh channel.
        cases.push(ChannelFlags::new());

        // Dialing, waiting on write readiness for completion.
        let mut dialing = ChannelFlags::new();
        dialing.conn = Connectivity::Connecting;
        dialing.write.watching = true;
        cases.push(dialing);

        // Connected, default read armed.
        let mut connected = ChannelFlags::new();
        connected.conn = Connectivity::Connected;
        connected.read.watching = true;
        connected.read.use_default = true;
        cases.push(connected);

        // Connected with a pending outbound queue watching write readiness.
        let mut writing = connected;
        writing.write.watching = true;
        writing.write.use_default = true;
        cases.push(writing);

        // Bandwidth suspended: no write interest, refill timer armed.
        let mut suspended = connected;
        suspended.rate.suspended = true;
        suspended.rate.timer_armed = true;
        cases.push(suspended);

        // Close deferred behind an in-flight write.
        let mut pending = writing;
        pending.conn = Connectivity::ClosePending;
        cases.push(pending);

        // Listener draining accepts.
        let mut listening = ChannelFlags::new();
        listening.conn = Connectivity::Listening;
        listening.read.watching = true;
        cases.push(listening);

        // Fully closed.
        let mut closed = ChannelFlags::new();
        closed.conn = Connectivity::Closed;
        closed.read.shutdown = true;
        closed.write.shutdown = true;
        cases.push(closed);

        // Forced abort from the terminating notification.
        let mut terminated = closed;
        terminated.loop_terminating = true;
        terminated.write.error = true;
        cases.push(terminated);

        for flags in cases {
            flags.check();
        }
    }

    #[test]
    fn write_in_flight_covers_all_three_forms() {
        let mut f = ChannelFlags::new();
        assert!(!f.write_in_flight());
        f.write.writing = true;
        assert!(f.write_in_flight());
        f.write.writing = false;
        f.write.watching = true;
        assert!(f.write_in_flight());
        f.write.watching = false;
        f.rate.suspended = true;
        assert!(f.write_in_flight());
    }
}
