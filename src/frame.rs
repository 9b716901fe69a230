// Frame bookkeeping shared by the scheduler and its consumers
//
// Two index spaces live here and must never be mixed: FrameIndex selects one
// of the FRAMES_IN_FLIGHT sync slots, ImageIndex selects a swapchain image.

use ash::vk;
use std::fmt;
use std::time::Duration;

use crate::error::FrameStateError;
use crate::FRAMES_IN_FLIGHT;

/// Index of a frame slot, always in `0..FRAMES_IN_FLIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameIndex(usize);

impl FrameIndex {
    pub const FIRST: FrameIndex = FrameIndex(0);

    /// Returns `None` for indices outside `0..FRAMES_IN_FLIGHT`.
    pub fn new(index: usize) -> Option<Self> {
        (index < FRAMES_IN_FLIGHT).then_some(Self(index))
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }

    /// The slot used after this one.
    #[inline]
    pub fn next(self) -> Self {
        Self((self.0 + 1) % FRAMES_IN_FLIGHT)
    }

    pub fn all() -> impl Iterator<Item = FrameIndex> {
        (0..FRAMES_IN_FLIGHT).map(FrameIndex)
    }
}

impl fmt::Display for FrameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a swapchain image as returned by acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageIndex(u32);

impl ImageIndex {
    #[inline]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ImageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    FrameOpen { image_index: ImageIndex },
}

/// Frame state machine: `Idle -> FrameOpen -> Idle`, advancing the frame
/// slot on every close. Illegal transitions are rejected and leave the
/// state untouched.
#[derive(Debug, Clone)]
pub struct FrameState {
    frame_index: FrameIndex,
    phase: FramePhase,
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameState {
    pub fn new() -> Self {
        Self {
            frame_index: FrameIndex::FIRST,
            phase: FramePhase::Idle,
        }
    }

    #[inline]
    pub fn frame_index(&self) -> FrameIndex {
        self.frame_index
    }

    #[inline]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.phase, FramePhase::FrameOpen { .. })
    }

    /// Image acquired for the open frame.
    pub fn image_index(&self) -> Option<ImageIndex> {
        match self.phase {
            FramePhase::FrameOpen { image_index } => Some(image_index),
            FramePhase::Idle => None,
        }
    }

    pub fn ensure_idle(&self) -> Result<(), FrameStateError> {
        match self.phase {
            FramePhase::Idle => Ok(()),
            FramePhase::FrameOpen { .. } => Err(FrameStateError::FrameAlreadyOpen),
        }
    }

    pub fn ensure_open(&self) -> Result<ImageIndex, FrameStateError> {
        self.image_index().ok_or(FrameStateError::NoFrameOpen)
    }

    pub fn open(&mut self, image_index: ImageIndex) -> Result<(), FrameStateError> {
        self.ensure_idle()?;
        self.phase = FramePhase::FrameOpen { image_index };
        Ok(())
    }

    /// Close the open frame and rotate to the next slot.
    pub fn close(&mut self) -> Result<(), FrameStateError> {
        self.ensure_open()?;
        self.phase = FramePhase::Idle;
        self.frame_index = self.frame_index.next();
        Ok(())
    }
}

/// What a consumer gets for one open frame.
///
/// Valid only between `begin_frame` and `end_frame`; the command buffer is
/// reset and reused `FRAMES_IN_FLIGHT` frames later, so don't keep it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub command_buffer: vk::CommandBuffer,
    pub frame_index: FrameIndex,
    pub image_index: ImageIndex,
    pub extent: vk::Extent2D,
    /// Time since the previous frame was begun.
    pub frame_time: Duration,
}

impl FrameContext {
    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }
}
