//! CLI command implementations.

mod bench;
mod inspect;
mod pack;
mod unpack;

pub use bench::{bench, BenchArgs};
pub use inspect::{inspect, InspectArgs};
pub use pack::{pack, PackArgs};
pub use unpack::{unpack, UnpackArgs};
