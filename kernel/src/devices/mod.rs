//! Device access used by the core itself.
//!
//! Only the serial port lives here: it is the sink for kernel logging and
//! for the report-and-halt path. Every other device is driven outside the
//! resource core.

pub mod serial;
