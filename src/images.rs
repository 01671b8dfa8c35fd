//! Loading, decoding and embedding of background and field images.

use std::io::Cursor;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{ColorType, ImageDecoder, ImageFormat, ImageReader};
use pdf_writer::{Filter, Pdf, Ref};

use crate::error::Error;
use crate::markup::ImageRef;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

enum Pixels {
    /// JPEG bytes passed through untouched.
    Jpeg { data: Vec<u8>, gray: bool },
    Raw { rgb: Vec<u8>, alpha: Option<Vec<u8>> },
}

pub(crate) struct PreparedImage {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pixels: Pixels,
}

/// Payload of a data URI, or the whole string when it is bare base64.
fn decode_base64(payload: &str) -> Result<Vec<u8>, Error> {
    let encoded = match payload.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| Error::Image("malformed data URI".into()))?,
        None => payload,
    };
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned)
        .map_err(|e| Error::Image(format!("base64 decode error: {e}")))
}

fn fetch(url: &str) -> Result<Vec<u8>, Error> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::Image(format!("HTTP client: {e}")))?;
    let response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Image(format!("GET {url}: {e}")))?;
    let bytes = response
        .bytes()
        .map_err(|e| Error::Image(format!("GET {url}: {e}")))?;
    Ok(bytes.to_vec())
}

pub(crate) fn load_bytes(source: &ImageRef, remote_images: bool) -> Result<Vec<u8>, Error> {
    match source {
        ImageRef::Embedded(payload) => decode_base64(payload),
        ImageRef::Url(url) if remote_images => fetch(url),
        ImageRef::Url(url) => Err(Error::Image(format!("remote images disabled: {url}"))),
        ImageRef::File(path) => std::fs::read(path)
            .map_err(|e| Error::Image(format!("{}: {e}", path.display()))),
    }
}

/// Decodes `bytes`, shrinking anything larger than `max_px` pixels. JPEGs
/// within bounds keep their original encoding.
pub(crate) fn prepare(bytes: &[u8], max_px: (u32, u32)) -> Result<PreparedImage, Error> {
    let format = image::guess_format(bytes)?;
    let (max_w, max_h) = (max_px.0.max(1), max_px.1.max(1));

    if format == ImageFormat::Jpeg {
        let decoder = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg).into_decoder()?;
        let (width, height) = decoder.dimensions();
        let gray = match decoder.color_type() {
            ColorType::L8 => Some(true),
            ColorType::Rgb8 => Some(false),
            _ => None,
        };
        if let Some(gray) = gray
            && width <= max_w
            && height <= max_h
        {
            return Ok(PreparedImage {
                width,
                height,
                pixels: Pixels::Jpeg {
                    data: bytes.to_vec(),
                    gray,
                },
            });
        }
    }

    let mut decoded = image::load_from_memory_with_format(bytes, format)?;
    if decoded.width() > max_w || decoded.height() > max_h {
        log::debug!(
            "Downsampling image {}x{} to fit {max_w}x{max_h}",
            decoded.width(),
            decoded.height()
        );
        decoded = decoded.resize(max_w, max_h, image::imageops::FilterType::Triangle);
    }

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let has_alpha = rgba.pixels().any(|p| p.0[3] < 255);
    let rgb: Vec<u8> = rgba
        .pixels()
        .flat_map(|p| [p.0[0], p.0[1], p.0[2]])
        .collect();
    let alpha = has_alpha.then(|| rgba.pixels().map(|p| p.0[3]).collect());

    Ok(PreparedImage {
        width,
        height,
        pixels: Pixels::Raw { rgb, alpha },
    })
}

/// Pixel bounds for an area of `w_pt` x `h_pt` at `dpi`.
pub(crate) fn pixel_bounds(w_pt: f32, h_pt: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / 72.0;
    (
        (w_pt * scale).ceil().max(1.0) as u32,
        (h_pt * scale).ceil().max(1.0) as u32,
    )
}

pub(crate) fn embed(pdf: &mut Pdf, xobj_ref: Ref, img: &PreparedImage, alloc: &mut impl FnMut() -> Ref) {
    let (w, h) = (img.width as i32, img.height as i32);
    match &img.pixels {
        Pixels::Jpeg { data, gray } => {
            let mut xobj = pdf.image_xobject(xobj_ref, data);
            xobj.filter(Filter::DctDecode);
            xobj.width(w);
            xobj.height(h);
            if *gray {
                xobj.color_space().device_gray();
            } else {
                xobj.color_space().device_rgb();
            }
            xobj.bits_per_component(8);
        }
        Pixels::Raw { rgb, alpha } => {
            let smask_ref = alpha.as_ref().map(|alpha| {
                let compressed = miniz_oxide::deflate::compress_to_vec_zlib(alpha, 6);
                let mask_ref = alloc();
                let mut mask = pdf.image_xobject(mask_ref, &compressed);
                mask.filter(Filter::FlateDecode);
                mask.width(w);
                mask.height(h);
                mask.color_space().device_gray();
                mask.bits_per_component(8);
                mask_ref
            });

            let compressed = miniz_oxide::deflate::compress_to_vec_zlib(rgb, 6);
            let mut xobj = pdf.image_xobject(xobj_ref, &compressed);
            xobj.filter(Filter::FlateDecode);
            xobj.width(w);
            xobj.height(h);
            xobj.color_space().device_rgb();
            xobj.bits_per_component(8);
            if let Some(mask_ref) = smask_ref {
                xobj.s_mask(mask_ref);
            }
        }
    }
}
