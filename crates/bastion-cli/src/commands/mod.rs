//! CLI command definitions.

pub mod audit;
pub mod check;
pub mod fetch;
pub mod policy;
pub mod read;
pub mod run;
pub mod write;
