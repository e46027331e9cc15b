use clap::ValueEnum;
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;

use super::error::EngineError;

/// Side length the classifier was trained on. Feeding any other size does not
/// fail, it just produces wrong predictions, so this is not configurable.
pub const INPUT_SIZE: u32 = 256;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel transform applied to RGB pixel values before the forward pass.
/// Must match what the model saw during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Normalization {
    /// Raw `0..=255` values. EfficientNet graphs rescale internally.
    #[default]
    Passthrough,
    /// `x / 255`
    UnitScale,
    /// `x / 127.5 - 1`
    Symmetric,
    /// `(x / 255 - mean) / std` with the ImageNet statistics
    Imagenet,
}

impl Normalization {
    #[inline]
    fn apply(self, value: u8, channel: usize) -> f32 {
        let x = f32::from(value);
        match self {
            Self::Passthrough => x,
            Self::UnitScale => x / 255.0,
            Self::Symmetric => x / 127.5 - 1.0,
            Self::Imagenet => (x / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TensorLayout {
    /// `[1, height, width, 3]` (Keras exports)
    #[default]
    Nhwc,
    /// `[1, 3, height, width]` (PyTorch exports)
    Nchw,
}

/// Turns encoded image bytes into the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePreprocessor {
    pub normalization: Normalization,
    pub layout: TensorLayout,
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(Normalization::default(), TensorLayout::default())
    }
}

impl ImagePreprocessor {
    pub fn new(normalization: Normalization, layout: TensorLayout) -> Self {
        Self { normalization, layout }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
        if bytes.is_empty() {
            return Err(EngineError::ImageDecodeError("Image data is empty".into()));
        }
        Ok(image::load_from_memory(bytes)?)
    }

    /// Resizes to `INPUT_SIZE` square with nearest-neighbour sampling and
    /// normalizes into a batch of one.
    pub fn to_tensor(&self, image: &DynamicImage) -> Array4<f32> {
        let size = INPUT_SIZE as usize;
        let rgb = image
            .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Nearest)
            .to_rgb8();

        let shape = match self.layout {
            TensorLayout::Nhwc => (1, size, size, 3),
            TensorLayout::Nchw => (1, 3, size, size),
        };
        let mut tensor = Array4::<f32>::zeros(shape);
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let value = self.normalization.apply(pixel[c], c);
                match self.layout {
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                }
            }
        }
        tensor
    }

    pub fn prepare(&self, bytes: &[u8]) -> Result<Array4<f32>, EngineError> {
        let image = self.decode(bytes)?;
        Ok(self.to_tensor(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_resizes_to_fixed_input() {
        let pre = ImagePreprocessor::default();
        let tensor = pre.prepare(&png_bytes(40, 17, [10, 20, 30])).unwrap();
        assert_eq!(tensor.shape(), &[1, 256, 256, 3]);
        assert_eq!(tensor[[0, 100, 200, 0]], 10.0);
        assert_eq!(tensor[[0, 100, 200, 2]], 30.0);
    }

    #[test]
    fn test_nchw_layout() {
        let pre = ImagePreprocessor::new(Normalization::UnitScale, TensorLayout::Nchw);
        let tensor = pre.prepare(&png_bytes(8, 8, [255, 0, 51])).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 256, 256]);
        assert_eq!(tensor[[0, 0, 5, 5]], 1.0);
        assert_eq!(tensor[[0, 1, 5, 5]], 0.0);
        assert!((tensor[[0, 2, 5, 5]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_symmetric_normalization_range() {
        assert_eq!(Normalization::Symmetric.apply(0, 0), -1.0);
        assert_eq!(Normalization::Symmetric.apply(255, 0), 1.0);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let pre = ImagePreprocessor::default();
        assert!(matches!(
            pre.prepare(b"definitely not an image"),
            Err(EngineError::ImageDecodeError(_))
        ));
        assert!(matches!(pre.prepare(&[]), Err(EngineError::ImageDecodeError(_))));
    }
}
