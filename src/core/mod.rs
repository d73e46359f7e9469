pub mod dsp;
pub mod engine;
pub mod stages;
