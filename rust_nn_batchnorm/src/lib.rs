mod batch_utils;
pub mod config;
pub mod dropout;
pub mod layer;
pub mod optimizer;
pub mod stages;
