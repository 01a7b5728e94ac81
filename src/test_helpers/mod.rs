//! Shared test fixtures: image builders, a scripted SUOTA device and temp dirs.

mod device;
mod fixtures;
mod temp;

pub use device::{Request, SyntheticDevice};
pub use fixtures::{EventLog, ImageBuilder, ManualClock};
pub use temp::TestContext;
