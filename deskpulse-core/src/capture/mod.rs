//! Screen capture
//!
//! OS-level capture stays outside the crate: a [`CaptureSource`] hands back a
//! timestamped image blob or fails, and [`ImageNormalizer`] turns that blob
//! into a bounded-size [`Capture`](crate::types::Capture).
//!
//! The bundled [`CommandCaptureSource`] shells out to a screenshot tool:
//!
//! ```toml
//! [capture]
//! command = ["screencapture", "-x", "-t", "png", "{path}"]
//! ```

mod command;
mod normalize;

pub use command::CommandCaptureSource;
pub use normalize::ImageNormalizer;

use crate::error::Result;
use crate::types::RawCapture;

/// Something that can take a screenshot.
///
/// Implementations may block; the runner calls them from the blocking pool.
pub trait CaptureSource: Send + Sync + 'static {
    fn capture(&self) -> Result<RawCapture>;
}
