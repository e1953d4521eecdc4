pub mod calculator;

pub use calculator::{PeriodBoundary, PeriodCalculator, ResetCadence};

/// Bounds used for plans whose quota never resets.
pub const NO_RESET_FLOOR_YEAR: i32 = 2000;
pub const NO_RESET_CEILING_YEAR: i32 = 2100;
