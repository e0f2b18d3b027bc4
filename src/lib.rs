pub mod batch;
pub mod config;
pub mod describe;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod synth;
