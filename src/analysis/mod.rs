//! The bloat estimation engine: enumeration, sampling, waste math,
//! exclusions, reporting and rebuild planning.

pub mod catalog;
pub mod exclusion;
pub mod rebuild;
pub mod report;
pub mod sampler;
pub mod scan;
pub mod units;
pub mod wasted;
