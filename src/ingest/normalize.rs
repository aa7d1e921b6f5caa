use anyhow::{anyhow, Result};

/// Native pixel layout a backend hands over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr24,
    Rgb24,
    Nv12,
}

/// Bring a capture into packed BGR, validating its length on the way.
pub(crate) fn normalize_to_bgr(
    mut pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Bgr24 => {
            check_packed_len(&pixels, width, height, "BGR")?;
            Ok(pixels)
        }
        PixelFormat::Rgb24 => {
            check_packed_len(&pixels, width, height, "RGB")?;
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(pixels)
        }
        PixelFormat::Nv12 => nv12_to_bgr(&pixels, width, height),
    }
}

fn check_packed_len(pixels: &[u8], width: u32, height: u32, label: &str) -> Result<()> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(3))
        .ok_or_else(|| anyhow!("{} frame {}x{} is too large", label, width, height))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            label,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

/// NV12: full-resolution Y plane, then interleaved U/V at half resolution.
/// BT.601 full-range with 8.8 fixed-point coefficients.
fn nv12_to_bgr(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    if w == 0 || h == 0 {
        return Err(anyhow!("NV12 frame has zero dimension ({}x{})", width, height));
    }
    let chroma_w = w.div_ceil(2) * 2;
    let luma_len = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame {}x{} is too large", width, height))?;
    let expected = luma_len + chroma_w * h.div_ceil(2);
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }
    let (luma, chroma) = pixels.split_at(luma_len);

    let mut bgr = Vec::with_capacity(luma_len * 3);
    for (row, luma_row) in luma.chunks_exact(w).enumerate() {
        let chroma_row = &chroma[(row / 2) * chroma_w..][..chroma_w];
        for (col, &y) in luma_row.iter().enumerate() {
            let pair = (col / 2) * 2;
            let u = i32::from(chroma_row[pair]) - 128;
            let v = i32::from(chroma_row[pair + 1]) - 128;
            let y = i32::from(y);
            bgr.push(saturate(y + ((454 * u) >> 8)));
            bgr.push(saturate(y - ((88 * u + 183 * v) >> 8)));
            bgr.push(saturate(y + ((359 * v) >> 8)));
        }
    }
    Ok(bgr)
}

fn saturate(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
