//! Preview rendering: overlay, mirror, JPEG.

use anyhow::{Result, anyhow};
use gesture_core::HandObservation;
use image::{RgbImage, codecs::jpeg::JpegEncoder, imageops};
use video_ingest::Frame;

use crate::thumb::{annotation, config::PreviewOptions};

/// Render one captured frame into the JPEG served to viewers.
///
/// Landmarks are drawn before mirroring so they stay aligned with the image;
/// the status text is drawn after so it reads left to right.
pub(crate) fn render_preview(
    frame: &Frame,
    hands: &[HandObservation],
    status: Option<&str>,
    options: &PreviewOptions,
) -> Result<Vec<u8>> {
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    if options.annotate {
        annotation::draw_hands(&mut image, hands);
    }
    if options.mirror {
        imageops::flip_horizontal_in_place(&mut image);
    }
    if options.annotate {
        if let Some(text) = status {
            annotation::draw_status(&mut image, text);
        }
    }

    let mut buffer = Vec::new();
    let quality = options.jpeg_quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use video_ingest::FrameFormat;

    use super::*;

    fn frame(width: u32, height: u32) -> Frame {
        let mut data = vec![0u8; (width * height * 3) as usize];
        // Left half bright, right half dark.
        for y in 0..height {
            for x in 0..width / 2 {
                let idx = ((y * width + x) * 3) as usize;
                data[idx..idx + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        Frame {
            data,
            width,
            height,
            timestamp_ms: 0,
            format: FrameFormat::Rgb8,
        }
    }

    fn decode(jpeg: &[u8]) -> RgbImage {
        image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8()
    }

    #[test]
    fn produces_jpeg_of_frame_size() {
        let jpeg = render_preview(&frame(64, 32), &[], None, &PreviewOptions::default()).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(decode(&jpeg).dimensions(), (64, 32));
    }

    #[test]
    fn mirror_flips_horizontally() {
        let options = PreviewOptions {
            annotate: false,
            ..PreviewOptions::default()
        };
        let mirrored = decode(&render_preview(&frame(64, 32), &[], None, &options).unwrap());
        assert!(mirrored.get_pixel(60, 16)[0] > 200);
        assert!(mirrored.get_pixel(4, 16)[0] < 50);

        let options = PreviewOptions {
            mirror: false,
            annotate: false,
            ..PreviewOptions::default()
        };
        let plain = decode(&render_preview(&frame(64, 32), &[], None, &options).unwrap());
        assert!(plain.get_pixel(4, 16)[0] > 200);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut bad = frame(8, 8);
        bad.data.truncate(10);
        assert!(render_preview(&bad, &[], None, &PreviewOptions::default()).is_err());
    }
}
