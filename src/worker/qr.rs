//! QR-code rendering for pairing payloads.
//!
//! Uses the `qrcode` crate to produce the QR matrix and the `image` crate
//! to render it as a PNG, published to the control plane as a
//! `data:image/png;base64,…` URL. The raw pairing payload itself is never
//! logged.

use crate::worker::error::{WorkerError, WorkerResult};
use image::{GrayImage, Luma};
use qrcode::QrCode;

/// Module size in pixels (each QR "module" becomes this many px wide).
const MODULE_PX: u32 = 8;
/// Quiet-zone border in modules.
const QUIET_ZONE: u32 = 4;

/// Render a raw pairing payload as PNG bytes.
pub fn to_png(payload: &str) -> WorkerResult<Vec<u8>> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| WorkerError::internal(format!("QR encode error: {}", e)))?;

    let matrix = code.to_colors();
    let width = code.width() as u32;
    let img_size = (width + QUIET_ZONE * 2) * MODULE_PX;

    let mut img = GrayImage::from_pixel(img_size, img_size, Luma([255u8]));

    for y in 0..width {
        for x in 0..width {
            let color = matrix[(y * width + x) as usize];
            if color == qrcode::Color::Dark {
                let px_x = (x + QUIET_ZONE) * MODULE_PX;
                let px_y = (y + QUIET_ZONE) * MODULE_PX;
                for dy in 0..MODULE_PX {
                    for dx in 0..MODULE_PX {
                        img.put_pixel(px_x + dx, px_y + dy, Luma([0u8]));
                    }
                }
            }
        }
    }

    let mut buf = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut buf);
    image::ImageEncoder::write_image(
        encoder,
        img.as_raw(),
        img_size,
        img_size,
        image::ExtendedColorType::L8,
    )
    .map_err(|e| WorkerError::internal(format!("PNG encode error: {}", e)))?;

    Ok(buf)
}

/// Render a raw pairing payload as a `data:image/png;base64,…` URL.
pub fn to_data_url(payload: &str) -> WorkerResult<String> {
    use base64::Engine;
    let png = to_png(payload)?;
    let b64 = base64::engine::general_purpose::STANDARD.encode(png);
    Ok(format!("data:image/png;base64,{}", b64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_png_is_valid_png() {
        let png = to_png("2@AbCdEf0123456789,deviceref,keyref").unwrap();
        assert!(png.len() > 8);
        assert_eq!(&png[..4], b"\x89PNG");
    }

    #[test]
    fn qr_data_url_format() {
        let url = to_data_url("2@pairing-payload").unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn qr_long_payload() {
        let payload = "2@".to_string() + &"a".repeat(400);
        let png = to_png(&payload).unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
