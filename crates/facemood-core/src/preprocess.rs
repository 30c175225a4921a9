//! Resize + per-channel normalisation shared by training and inference,
//! plus the train-only augmentations.

use crate::config::{Settings, IMAGENET_MEAN, IMAGENET_STD};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use rand::Rng;

/// Brightness/contrast jitter range (±).
const JITTER: f32 = 0.2;
const FLIP_PROBABILITY: f64 = 0.5;

/// Converts RGB crops into the `3 × S × S` network input.
///
/// Training and inference must use the same value, otherwise scores are meaningless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Preprocess {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.image_size)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Resize (bilinear) and normalise into a CHW tensor.
    pub fn tensor(&self, image: &RgbImage) -> Array3<f32> {
        let s = self.size as usize;
        let resized;
        let src = if image.dimensions() == (self.size, self.size) {
            image
        } else {
            resized = imageops::resize(image, self.size, self.size, FilterType::Triangle);
            &resized
        };

        let mut tensor = Array3::<f32>::zeros((3, s, s));
        for (x, y, pixel) in src.enumerate_pixels() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                tensor[[c, y as usize, x as usize]] = (v - self.mean[c]) / self.std[c];
            }
        }
        tensor
    }
}

/// Random horizontal flip and brightness/contrast jitter, training samples only.
pub fn augment<R: Rng + ?Sized>(image: RgbImage, rng: &mut R) -> RgbImage {
    let mut image = if rng.gen_bool(FLIP_PROBABILITY) {
        imageops::flip_horizontal(&image)
    } else {
        image
    };

    let brightness = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
    let contrast = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
    jitter(&mut image, brightness, contrast);
    image
}

fn jitter(image: &mut RgbImage, brightness: f32, contrast: f32) {
    let n = (image.width() * image.height()) as f32;
    if n == 0.0 {
        return;
    }
    let mean = image
        .pixels()
        .map(|p| (p[0] as f32 + p[1] as f32 + p[2] as f32) / 3.0)
        .sum::<f32>()
        / n;

    for pixel in image.pixels_mut() {
        for c in 0..3 {
            let v = pixel[c] as f32;
            let v = ((v - mean) * contrast + mean) * brightness;
            pixel[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}
