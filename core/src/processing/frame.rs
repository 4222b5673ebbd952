use crate::prelude::{RideError, RideResult};
use crate::zones::ZoneRect;
use ndarray::{s, Array3};

pub const CHANNELS: usize = 4;

/// One decoded RGBA video frame, stored as `(height, width, channel)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pixels: Array3<u8>,
}

impl Frame {
    pub fn from_rgba(width: usize, height: usize, data: Vec<u8>) -> RideResult<Self> {
        let pixels = Array3::from_shape_vec((height, width, CHANNELS), data).map_err(|err| {
            RideError::InvalidInput(format!("frame {}x{} RGBA: {}", width, height, err))
        })?;
        Ok(Self { pixels })
    }

    pub fn filled(width: usize, height: usize, rgba: [u8; 4]) -> Self {
        let pixels = Array3::from_shape_fn((height, width, CHANNELS), |(_, _, c)| rgba[c]);
        Self { pixels }
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }

    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn pixels(&self) -> &Array3<u8> {
        &self.pixels
    }

    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.pixels.dim() == other.pixels.dim()
    }

    /// Paints a normalized rectangle with a solid color.
    pub fn fill_rect(&mut self, rect: &ZoneRect, rgba: [u8; 4]) {
        let (x0, y0, x1, y1) = rect.pixel_bounds(self.width(), self.height());
        let mut region = self.pixels.slice_mut(s![y0..y1, x0..x1, ..]);
        for ((_, _, c), value) in region.indexed_iter_mut() {
            *value = rgba[c];
        }
    }
}

/// Two-frame sliding window owned by the motion detector.
///
/// Pushing moves the current frame into the previous slot; pixel data is never
/// copied.
#[derive(Debug, Default)]
pub struct FrameWindow {
    current: Option<Frame>,
    previous: Option<Frame>,
}

impl FrameWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.previous = self.current.replace(frame);
    }

    /// `(current, previous)` once two frames have been seen.
    pub fn pair(&self) -> Option<(&Frame, &Frame)> {
        match (&self.current, &self.previous) {
            (Some(current), Some(previous)) => Some((current, previous)),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgba_rejects_short_buffers() {
        assert!(Frame::from_rgba(2, 2, vec![0; 15]).is_err());
        let frame = Frame::from_rgba(2, 3, vec![0; 24]).unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 3));
    }

    #[test]
    fn window_needs_two_frames() {
        let mut window = FrameWindow::new();
        window.push(Frame::filled(4, 4, [0, 0, 0, 255]));
        assert!(window.pair().is_none());
        window.push(Frame::filled(4, 4, [9, 9, 9, 255]));
        let (current, previous) = window.pair().unwrap();
        assert_eq!(current.pixels()[[0, 0, 0]], 9);
        assert_eq!(previous.pixels()[[0, 0, 0]], 0);
    }

    #[test]
    fn fill_rect_paints_only_the_region() {
        let mut frame = Frame::filled(10, 10, [0, 0, 0, 255]);
        frame.fill_rect(&ZoneRect::new(0.0, 0.0, 0.5, 0.5), [200, 100, 50, 255]);
        assert_eq!(frame.pixels()[[2, 2, 0]], 200);
        assert_eq!(frame.pixels()[[2, 2, 2]], 50);
        assert_eq!(frame.pixels()[[8, 8, 0]], 0);
    }
}
