use anyhow::{Context, Result, anyhow};
use fast_image_resize::{
    PixelType, Resizer,
    images::{Image, ImageRef},
};
use image::{Pixel, RgbaImage};

use super::EmbeddingExtractor;
use crate::types::{Embedding, Frame};

/// Downscaled grayscale thumbnail, mean-centred and L2-normalised.
pub struct ThumbnailExtractor {
    side: u32,
    resizer: Resizer,
}

impl ThumbnailExtractor {
    pub fn new(side: u32) -> Self {
        Self {
            side: side.max(1),
            resizer: Resizer::new(),
        }
    }

    fn thumbnail(&mut self, frame: &Frame) -> Result<RgbaImage> {
        if frame.is_empty() {
            return Err(anyhow!("frame has no pixels"));
        }
        let src = ImageRef::new(frame.width, frame.height, &frame.rgba, PixelType::U8x4)
            .context("frame buffer does not match its dimensions")?;
        let mut dst = Image::new(self.side, self.side, PixelType::U8x4);
        self.resizer
            .resize(&src, &mut dst, None)
            .context("failed to resize frame")?;
        RgbaImage::from_raw(self.side, self.side, dst.into_vec())
            .ok_or_else(|| anyhow!("resized buffer has unexpected length"))
    }
}

impl EmbeddingExtractor for ThumbnailExtractor {
    fn dim(&self) -> usize {
        (self.side * self.side) as usize
    }

    fn extract(&mut self, frame: &Frame) -> Result<Embedding> {
        let thumbnail = self.thumbnail(frame)?;
        let mut values: Vec<f32> = thumbnail
            .pixels()
            .map(|px| px.to_luma().0[0] as f32 / 255.0)
            .collect();

        let mean = values.iter().sum::<f32>() / values.len() as f32;
        values.iter_mut().for_each(|v| *v -= mean);
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(Embedding::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        Frame::from_image(RgbaImage::from_fn(width, height, |x, _| {
            let v = (x * 255 / width.max(1)) as u8;
            Rgba([v, v, v, 255])
        }))
    }

    #[test]
    fn output_matches_declared_dimension() {
        let mut extractor = ThumbnailExtractor::new(8);
        let embedding = extractor.extract(&gradient_frame(64, 48)).unwrap();
        assert_eq!(embedding.len(), extractor.dim());
        assert_eq!(extractor.dim(), 64);

        let norm: f32 = embedding.as_slice().iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
    }

    #[test]
    fn same_frame_gives_same_embedding() {
        let mut extractor = ThumbnailExtractor::new(4);
        let frame = gradient_frame(20, 10);
        let first = extractor.extract(&frame).unwrap();
        let second = extractor.extract(&frame).unwrap();
        assert_eq!(first, second);

        let flipped = Frame::from_image(RgbaImage::from_fn(20, 10, |x, _| {
            let v = 255 - (x * 255 / 20) as u8;
            Rgba([v, v, v, 255])
        }));
        assert_ne!(extractor.extract(&flipped).unwrap(), first);
    }

    #[test]
    fn inconsistent_frame_is_an_error() {
        let mut extractor = ThumbnailExtractor::new(4);
        let mut frame = gradient_frame(10, 10);
        frame.rgba.truncate(12);
        assert!(extractor.extract(&frame).is_err());
    }
}
