pub mod config;
pub mod meter;
pub mod net;
pub mod power;
pub mod radio;
#[cfg(feature = "esp-hal-runtime")]
mod runtime;
pub mod sched;
pub(crate) mod telemetry;
#[cfg(test)]
pub(crate) mod testing;
pub(crate) mod timefmt;
pub mod types;
pub mod upload;

#[cfg(feature = "esp-hal-runtime")]
pub use runtime::run;
