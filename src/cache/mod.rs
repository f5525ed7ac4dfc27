//! Expiring key-value storage backing the rate limiters.

mod aging;
mod clock;
mod sweeper;

pub use aging::{AgingCache, SweepStats, Touch, Update};
pub use clock::{Clock, MockClock, SystemClock};
pub use sweeper::{spawn_sweeper, SweepPolicy, SweeperHandle};
