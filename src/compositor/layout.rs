//! Composition layouts
//!
//! The geometric arrangement used to merge two camera frames into one.
//! Layouts are immutable per composition call; geometry is resolved to pixel
//! regions once per frame.

use crate::frame::{CameraSource, Resolution};
use serde::{Deserialize, Serialize};

/// Width share of the primary stream in the primary/secondary layout
pub const PRIMARY_SHARE: f32 = 0.75;

/// Margin between a picture-in-picture inset and the frame edge, in pixels
pub const PIP_MARGIN: u32 = 16;

/// Border width drawn around the inset when effects are enabled, in pixels
pub const PIP_BORDER: u32 = 3;

/// Corner anchoring a picture-in-picture inset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipCorner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

/// Relative size of a picture-in-picture inset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipSize {
    Small,
    Medium,
    Large,
}

impl PipSize {
    /// Inset width as a fraction of the output width
    pub fn fraction(self) -> f32 {
        match self {
            PipSize::Small => 0.25,
            PipSize::Medium => 0.33,
            PipSize::Large => 0.40,
        }
    }
}

/// How the two camera streams are arranged in the composed output
///
/// In `PictureInPicture` the back camera fills the frame and the front
/// camera is the inset, the usual selfie-inset convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompositionLayout {
    SideBySide,
    PictureInPicture { corner: PipCorner, size: PipSize },
    PrimarySecondary { primary: CameraSource },
}

/// A pixel rectangle inside an output frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Grow outward by `amount` on every side, clamped to the target frame
    pub fn inflate(&self, amount: u32, target: Resolution) -> Rect {
        let x = self.x.saturating_sub(amount);
        let y = self.y.saturating_sub(amount);
        let right = (self.x + self.width + amount).min(target.width);
        let bottom = (self.y + self.height + amount).min(target.height);
        Rect::new(x, y, right - x, bottom - y)
    }
}

impl CompositionLayout {
    /// Destination regions `(front, back)` inside a target frame
    pub fn regions(&self, target: Resolution) -> (Rect, Rect) {
        match self {
            CompositionLayout::SideBySide => {
                let half = target.width / 2;
                (
                    Rect::new(0, 0, half, target.height),
                    Rect::new(half, 0, target.width - half, target.height),
                )
            }
            CompositionLayout::PictureInPicture { corner, size } => {
                let full = Rect::new(0, 0, target.width, target.height);
                let inset_w = ((target.width as f32 * size.fraction()) as u32).max(1);
                // Inset keeps the output aspect ratio.
                let inset_h = ((inset_w as u64 * target.height as u64
                    / target.width.max(1) as u64) as u32)
                    .max(1);
                let (x, y) = match corner {
                    PipCorner::TopLeft => (PIP_MARGIN, PIP_MARGIN),
                    PipCorner::TopRight => {
                        (target.width.saturating_sub(inset_w + PIP_MARGIN), PIP_MARGIN)
                    }
                    PipCorner::BottomLeft => {
                        (PIP_MARGIN, target.height.saturating_sub(inset_h + PIP_MARGIN))
                    }
                    PipCorner::BottomRight => (
                        target.width.saturating_sub(inset_w + PIP_MARGIN),
                        target.height.saturating_sub(inset_h + PIP_MARGIN),
                    ),
                };
                (Rect::new(x, y, inset_w, inset_h), full)
            }
            CompositionLayout::PrimarySecondary { primary } => {
                let primary_w = (target.width as f32 * PRIMARY_SHARE) as u32;
                let primary_rect = Rect::new(0, 0, primary_w, target.height);
                let secondary_rect =
                    Rect::new(primary_w, 0, target.width - primary_w, target.height);
                match primary {
                    CameraSource::Front => (primary_rect, secondary_rect),
                    CameraSource::Back => (secondary_rect, primary_rect),
                }
            }
        }
    }

    /// The source drawn on top of the other, if the layout overlaps
    pub fn inset_source(&self) -> Option<CameraSource> {
        match self {
            CompositionLayout::PictureInPicture { .. } => Some(CameraSource::Front),
            _ => None,
        }
    }
}
