//! Interrupt event configuration constants.

/// Maximum number of events that can be queued between two safe points.
pub const MAX_EVENTS: usize = 256;
