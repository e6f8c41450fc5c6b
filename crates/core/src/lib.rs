#![forbid(unsafe_code)]

pub mod accuracy;
pub mod blocks;
pub mod model;
pub mod time;
pub mod tracking;

pub use time::Clock;
