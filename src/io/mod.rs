pub mod encoder;
pub mod progress;
pub mod wav;
