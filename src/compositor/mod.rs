//! Frame composition
//!
//! Merges a synchronized frame pair into one output frame under a selectable
//! layout:
//! - layout geometry and destination regions
//! - area-average scaling and the composition renderer

pub mod layout;
pub mod render;

pub use layout::{CompositionLayout, PipCorner, PipSize, Rect};
pub use render::{FrameCompositor, LatencyTracker};
