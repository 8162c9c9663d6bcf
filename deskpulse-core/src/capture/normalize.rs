//! Screenshot normalization: downscale, re-encode as JPEG under a byte cap,
//! and fingerprint.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use image_hasher::{HashAlg, HasherConfig};
use uuid::Uuid;

use crate::config::CaptureConfig;
use crate::error::{Error, Result};
use crate::types::{Capture, RawCapture};

/// Quality steps tried after the configured quality overshoots the cap.
const QUALITY_LADDER: [u8; 3] = [70, 50, 30];

const JPEG_MIME: &str = "image/jpeg";

/// Pure transform from a raw screenshot to a bounded-size [`Capture`].
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    max_dimension: u32,
    quality: u8,
    max_payload_bytes: usize,
}

impl ImageNormalizer {
    pub fn new(max_dimension: u32, quality: u8, max_payload_bytes: usize) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
            quality: quality.clamp(1, 100),
            max_payload_bytes,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.max_dimension,
            config.jpeg_quality,
            config.max_payload_bytes,
        )
    }

    pub fn normalize(&self, raw: RawCapture) -> Result<Capture> {
        let img = image::load_from_memory(&raw.bytes)?;

        let img = if img.width() > self.max_dimension || img.height() > self.max_dimension {
            img.resize(self.max_dimension, self.max_dimension, FilterType::Triangle)
        } else {
            img
        };

        let fingerprint = fingerprint_image(&img);
        let payload = self.encode_bounded(&img)?;

        Ok(Capture {
            id: Uuid::new_v4(),
            captured_at: raw.captured_at,
            payload,
            mime_type: JPEG_MIME.to_string(),
            fingerprint,
            duplicate: false,
        })
    }

    /// Encode at the configured quality, stepping down the ladder until the
    /// payload fits.
    fn encode_bounded(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        let rgb = img.to_rgb8();
        let qualities = std::iter::once(self.quality)
            .chain(QUALITY_LADDER.into_iter().filter(|q| *q < self.quality));

        let mut smallest = usize::MAX;
        for quality in qualities {
            let mut buf = Vec::new();
            let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buf), quality);
            rgb.write_with_encoder(encoder)?;

            if buf.len() <= self.max_payload_bytes {
                if quality != self.quality {
                    tracing::debug!(quality, bytes = buf.len(), "Reduced JPEG quality to fit cap");
                }
                return Ok(buf);
            }
            smallest = smallest.min(buf.len());
        }

        Err(Error::Capture(format!(
            "encoded capture is {} bytes at lowest quality, cap is {}",
            smallest, self.max_payload_bytes
        )))
    }
}

fn fingerprint_image(img: &DynamicImage) -> String {
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();

    hasher.hash_image(img).to_base64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use image::{ImageBuffer, ImageFormat, Rgb};

    fn png(width: u32, height: u32, pixel: impl Fn(u32, u32) -> Rgb<u8>) -> Vec<u8> {
        let buf = ImageBuffer::from_fn(width, height, pixel);
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buf)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn split_vertical(x: u32, _y: u32) -> Rgb<u8> {
        if x < 100 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    }

    fn split_horizontal(_x: u32, y: u32) -> Rgb<u8> {
        if y < 100 {
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    }

    fn raw(bytes: Vec<u8>) -> RawCapture {
        RawCapture {
            captured_at: Utc::now(),
            bytes,
        }
    }

    #[test]
    fn test_normalize_downscales_and_encodes_jpeg() {
        let normalizer = ImageNormalizer::new(64, 85, 4_000_000);
        let capture = normalizer.normalize(raw(png(200, 200, split_vertical))).unwrap();

        assert_eq!(capture.mime_type, "image/jpeg");
        assert_eq!(&capture.payload[..2], &[0xFF, 0xD8]);
        assert!(!capture.duplicate);

        let decoded = image::load_from_memory(&capture.payload).unwrap();
        assert!(decoded.width() <= 64 && decoded.height() <= 64);
    }

    #[test]
    fn test_fingerprint_is_stable_and_discriminating() {
        let normalizer = ImageNormalizer::new(1920, 85, 4_000_000);
        let a1 = normalizer.normalize(raw(png(200, 200, split_vertical))).unwrap();
        let a2 = normalizer.normalize(raw(png(200, 200, split_vertical))).unwrap();
        let b = normalizer.normalize(raw(png(200, 200, split_horizontal))).unwrap();

        assert_eq!(a1.fingerprint, a2.fingerprint);
        assert_ne!(a1.id, a2.id);
        assert_ne!(a1.fingerprint, b.fingerprint);
        assert!(!a1.fingerprint.is_empty());
    }

    #[test]
    fn test_payload_over_cap_is_rejected() {
        let normalizer = ImageNormalizer::new(1920, 85, 16);
        let result = normalizer.normalize(raw(png(200, 200, split_vertical)));
        assert!(matches!(result, Err(Error::Capture(_))));
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let normalizer = ImageNormalizer::new(1920, 85, 4_000_000);
        let result = normalizer.normalize(raw(b"not an image".to_vec()));
        assert!(matches!(result, Err(Error::Image(_))));
    }
}
