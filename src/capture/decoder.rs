//! Still decode: compressed capture bytes to packed RGB565

use jpeg_decoder::{Decoder, PixelFormat as JpegLayout};

use super::frame::{PixelFormat, Size};
use crate::error::DecodeError;

/// Bytes per RGB565 pixel.
pub const RGB565_BYTES: usize = 2;

/// Decoded pixels with their real dimensions.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pixels: Vec<u8>,
    pub size: Size,
}

/// Decode `data` in `format` into RGB565. `size` is required for raw RGB
/// sources and ignored for JPEG, which carries its own dimensions.
pub fn decode_frame(data: &[u8], format: PixelFormat, size: Option<Size>) -> Result<DecodedFrame, DecodeError> {
    match format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let size = size.ok_or_else(|| DecodeError::UnsupportedLayout("raw RGB without dimensions".into()))?;
            if data.len() < size.pixels() as usize * 3 {
                return Err(DecodeError::UnsupportedLayout(format!(
                    "{} bytes is too short for {size} RGB",
                    data.len()
                )));
            }
            let bgr = format == PixelFormat::Bgr24;
            let pixels = pack_rgb565(data[..size.pixels() as usize * 3].chunks_exact(3).map(|px| {
                if bgr {
                    [px[2], px[1], px[0]]
                } else {
                    [px[0], px[1], px[2]]
                }
            }));
            Ok(DecodedFrame { pixels, size })
        }
        PixelFormat::Rgb565 => {
            let size = size.ok_or_else(|| DecodeError::UnsupportedLayout("raw RGB565 without dimensions".into()))?;
            let len = size.pixels() as usize * RGB565_BYTES;
            if data.len() < len {
                return Err(DecodeError::UnsupportedLayout(format!(
                    "{} bytes is too short for {size} RGB565",
                    data.len()
                )));
            }
            Ok(DecodedFrame {
                pixels: data[..len].to_vec(),
                size,
            })
        }
        other => Err(DecodeError::UnsupportedLayout(format!("{other:?} stills"))),
    }
}

fn decode_jpeg(data: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let mut decoder = Decoder::new(data);
    let raw = decoder.decode()?;
    let info = decoder
        .info()
        .ok_or_else(|| DecodeError::UnsupportedLayout("jpeg without frame header".into()))?;

    let (width, height) = (u32::from(info.width), u32::from(info.height));
    let size = Size::try_new(width, height).map_err(|_| DecodeError::InvalidDimensions { width, height })?;

    let pixels = match info.pixel_format {
        JpegLayout::RGB24 => pack_rgb565(raw.chunks_exact(3).map(|px| [px[0], px[1], px[2]])),
        JpegLayout::L8 => pack_rgb565(raw.iter().map(|&l| [l, l, l])),
        // Big-endian 16-bit luma; keep the high byte.
        JpegLayout::L16 => pack_rgb565(raw.chunks_exact(2).map(|l| [l[0], l[0], l[0]])),
        JpegLayout::CMYK32 => return Err(DecodeError::UnsupportedLayout("CMYK jpeg".into())),
    };

    Ok(DecodedFrame { pixels, size })
}

/// Pack one RGB888 pixel into RGB565.
pub const fn rgb_to_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

fn pack_rgb565(pixels: impl Iterator<Item = [u8; 3]>) -> Vec<u8> {
    let (lower, _) = pixels.size_hint();
    let mut out = Vec::with_capacity(lower * RGB565_BYTES);
    for [r, g, b] in pixels {
        out.extend_from_slice(&rgb_to_rgb565(r, g, b).to_le_bytes());
    }
    out
}

/// Expand RGB565 back to RGB888, e.g. for writing a decoded still to disk.
pub fn rgb565_to_rgb24(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / RGB565_BYTES * 3);
    for px in data.chunks_exact(RGB565_BYTES) {
        let v = u16::from_le_bytes([px[0], px[1]]);
        let r = ((v >> 11) & 0x1f) as u8;
        let g = ((v >> 5) & 0x3f) as u8;
        let b = (v & 0x1f) as u8;
        out.extend_from_slice(&[(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]);
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    use super::*;

    pub(crate) fn solid_jpeg(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(rgb));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn packs_primaries() {
        assert_eq!(rgb_to_rgb565(255, 0, 0), 0xf800);
        assert_eq!(rgb_to_rgb565(0, 255, 0), 0x07e0);
        assert_eq!(rgb_to_rgb565(0, 0, 255), 0x001f);
        assert_eq!(rgb_to_rgb565(255, 255, 255), 0xffff);
    }

    #[test]
    fn decodes_jpeg_to_rgb565() {
        let jpeg = solid_jpeg(64, 48, [250, 10, 10]);
        let decoded = decode_frame(&jpeg, PixelFormat::Mjpeg, None).unwrap();
        assert_eq!(decoded.size, Size::new(64, 48));
        assert_eq!(decoded.pixels.len(), 64 * 48 * RGB565_BYTES);

        let v = u16::from_le_bytes([decoded.pixels[0], decoded.pixels[1]]);
        assert!((v >> 11) >= 28, "red channel lost: {v:#06x}");
        assert!(((v >> 5) & 0x3f) <= 6, "green channel too high: {v:#06x}");
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_frame(&[0xde, 0xad, 0xbe, 0xef], PixelFormat::Mjpeg, None),
            Err(DecodeError::Jpeg(_))
        ));
        assert!(decode_frame(&[0; 16], PixelFormat::Nv21, Some(Size::new(4, 4))).is_err());
    }

    #[test]
    fn converts_raw_bgr() {
        let decoded = decode_frame(&[0, 0, 255, 255, 0, 0], PixelFormat::Bgr24, Some(Size::new(2, 1))).unwrap();
        assert_eq!(&decoded.pixels, &[0x00, 0xf8, 0x1f, 0x00]);
        assert_eq!(rgb565_to_rgb24(&decoded.pixels), vec![255, 0, 0, 0, 0, 255]);
    }
}
