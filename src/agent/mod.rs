//! Agent Core
//!
//! The cognitive loop and its supporting pieces: prompt assembly and the
//! tool registry/dispatcher.

pub mod cognitive;
pub mod prompt;
pub mod tools;

pub use cognitive::{review_window_size, CognitiveLoop, CognitiveLoopOptions};
