use crate::types::{CaptureError, Frame};

/// Pull interface over an opened capture device.
///
/// A failed read is reported, never retried here; the caller decides when a run
/// of failures warrants reacquiring the device.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Release the underlying device. Further reads fail with [`CaptureError::Closed`].
    fn release(&mut self);
}

/// Opens (or reopens) a capture device.
pub trait CaptureOpener: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

impl<F> CaptureOpener for F
where
    F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError> + Send,
{
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError> {
        self()
    }
}
