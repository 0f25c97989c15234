//! The decoder seam.
//!
//! Decoding is delegated to a [`VideoDecoder`]: complete access units in,
//! zero or more images out. A decode error is not fatal; the pipeline counts
//! it, skips the unit, and carries on.
//!
//! [`PassthroughDecoder`] is the default. It validates each unit and emits
//! it unchanged as an [`PixelFormat::H264AnnexB`] frame, which is what
//! recorders and external decoders consume. Plug in a real decoder to get
//! raw pictures.

use bytes::Bytes;

use tello_core::error::{Error, Result};

use super::h264;

/// Layout of [`DecodedImage::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Undecoded Annex-B access unit.
    H264AnnexB,
    /// Planar YUV 4:2:0.
    Yuv420p,
    /// Packed 8-bit RGB.
    Rgb24,
}

/// One image produced by a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub data: Bytes,
}

/// Turns access units into images.
///
/// Runs on the video task; implementations may block briefly but should not
/// stall for longer than a frame interval.
pub trait VideoDecoder: Send + 'static {
    /// Decode one complete access unit.
    fn decode(&mut self, access_unit: &Bytes) -> Result<Vec<DecodedImage>>;
}

/// Emits each validated access unit as-is.
#[derive(Debug, Clone)]
pub struct PassthroughDecoder {
    width: u32,
    height: u32,
}

impl PassthroughDecoder {
    /// `width`/`height` describe the stream; the camera streams 960x720.
    pub fn new(width: u32, height: u32) -> Self {
        PassthroughDecoder { width, height }
    }
}

impl Default for PassthroughDecoder {
    fn default() -> Self {
        PassthroughDecoder::new(960, 720)
    }
}

impl VideoDecoder for PassthroughDecoder {
    fn decode(&mut self, access_unit: &Bytes) -> Result<Vec<DecodedImage>> {
        if h264::split_nal_units(access_unit).is_empty() {
            return Err(Error::Parse(format!(
                "access unit of {} bytes has no NAL units",
                access_unit.len()
            )));
        }
        Ok(vec![DecodedImage {
            width: self.width,
            height: self.height,
            pixel_format: PixelFormat::H264AnnexB,
            data: access_unit.clone(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_emits_unit_unchanged() {
        let mut decoder = PassthroughDecoder::default();
        let unit = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);
        let images = decoder.decode(&unit).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].pixel_format, PixelFormat::H264AnnexB);
        assert_eq!((images[0].width, images[0].height), (960, 720));
        assert_eq!(images[0].data, unit);
    }

    #[test]
    fn passthrough_rejects_garbage() {
        let mut decoder = PassthroughDecoder::default();
        let result = decoder.decode(&Bytes::from_static(&[0x12, 0x34]));
        assert!(matches!(result, Err(Error::Parse(_))));
    }
}
