// Error taxonomy for the presentation core
//
// Recoverable presentation results (out of date, suboptimal, minimized
// surface) never show up here: they are absorbed by the swapchain manager
// and the frame scheduler. Everything in this file ends the render loop.

use ash::vk;
use thiserror::Error;

use crate::frame::FrameIndex;

/// Illegal frame state transitions. These are scheduling bugs in the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStateError {
    #[error("begin_frame called while a frame is already open")]
    FrameAlreadyOpen,

    #[error("no frame is open")]
    NoFrameOpen,

    /// A consumer handed back a recording target from another frame slot.
    #[error("recording target belongs to frame slot {found}, current slot is {expected}")]
    TargetMismatch {
        expected: FrameIndex,
        found: FrameIndex,
    },
}

/// Fatal renderer error.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("frame precondition violated: {0}")]
    Precondition(#[from] FrameStateError),

    /// Zero formats or zero present modes reported: the surface is gone.
    #[error("surface reports no formats or present modes")]
    SurfaceIncompatible,

    #[error("surface lost during {op}")]
    SurfaceLost { op: &'static str },

    /// The rebuilt swapchain no longer matches the render pass consumers
    /// were built against.
    #[error(
        "swapchain formats changed across rebuild: color {old_color:?} -> {new_color:?}, \
         depth {old_depth:?} -> {new_depth:?}"
    )]
    FormatChanged {
        old_color: vk::Format,
        new_color: vk::Format,
        old_depth: vk::Format,
        new_depth: vk::Format,
    },

    #[error("no supported depth attachment format")]
    NoDepthFormat,

    /// The backend handed out an image the swapchain doesn't have.
    #[error("image index {index} out of range for a swapchain of {image_count} images")]
    ImageIndexOutOfRange { index: u32, image_count: usize },

    #[error("{op} failed: {code}")]
    Backend { op: &'static str, code: vk::Result },
}

impl RenderError {
    /// The backend operation that failed, if this error came from one.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            RenderError::SurfaceLost { op } | RenderError::Backend { op, .. } => Some(op),
            _ => None,
        }
    }

    /// The backend result code, if this error came from one.
    pub fn code(&self) -> Option<vk::Result> {
        match self {
            RenderError::SurfaceLost { .. } => Some(vk::Result::ERROR_SURFACE_LOST_KHR),
            RenderError::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Attach the failing operation to a raw `VkResult`.
pub trait VkResultExt<T> {
    fn during(self, op: &'static str) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn during(self, op: &'static str) -> RenderResult<T> {
        self.map_err(|code| match code {
            vk::Result::ERROR_SURFACE_LOST_KHR => RenderError::SurfaceLost { op },
            code => RenderError::Backend { op, code },
        })
    }
}
