mod clock;

pub use clock::{ClockSpeedController, ClockStats, CpuClock};
