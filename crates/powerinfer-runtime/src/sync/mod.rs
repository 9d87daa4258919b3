//! Worker coordination primitives
//!
//! Workers only ever suspend in two places: at a [`SpinBarrier`] between
//! pipeline phases and on a [`ReadyEvent`] while a disk read is in flight.
//! Both poll according to a [`WaitStrategy`].

pub mod barrier;
pub mod event;

pub use crate::config::WaitStrategy;
pub use barrier::{SpinBarrier, TestAndSetGate};
pub use event::ReadyEvent;
