pub mod driver;

pub use driver::{run, RobustnessConfig, RunOutcome, Thresholds};
