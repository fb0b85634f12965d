
#[macro_use]
extern crate error_chain;

pub mod bounding;
pub mod components;
pub mod engine;
pub mod partition_selection;
pub mod transform;
pub mod utilities;
