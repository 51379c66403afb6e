//! Source-atop compositing on straight-alpha RGBA8.
//!
//! The overlay shows where it has coverage, weighted by its own alpha, but
//! only inside the destination's coverage. Result alpha is always the
//! destination alpha.

use image::RgbaImage;

use overlaykit_common::error::{OverlayKitError, OverlayKitResult};

pub type Rgba8 = [u8; 4];

fn mul_div255(x: u16, y: u16) -> u16 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u16
}

/// Blend one overlay pixel atop one destination pixel.
pub fn source_atop(dst: Rgba8, src: Rgba8) -> Rgba8 {
    let sa = u16::from(src[3]);
    let da = u16::from(dst[3]);
    if sa == 0 || da == 0 {
        return dst;
    }

    let inv_sa = 255 - sa;
    let mut out = [0u8; 4];
    for i in 0..3 {
        let ps = mul_div255(u16::from(src[i]), sa);
        let pd = mul_div255(u16::from(dst[i]), da);
        let premul = u32::from(mul_div255(ps, da)) + u32::from(mul_div255(pd, inv_sa));
        let straight = (premul * 255 + u32::from(da) / 2) / u32::from(da);
        out[i] = straight.min(255) as u8;
    }
    out[3] = dst[3];
    out
}

/// Blend `overlay` atop `dst` pixel by pixel. Sizes must match.
pub fn source_atop_in_place(dst: &mut RgbaImage, overlay: &RgbaImage) -> OverlayKitResult<()> {
    if dst.dimensions() != overlay.dimensions() {
        return Err(OverlayKitError::output_image(format!(
            "overlay is {}x{} but frame is {}x{}",
            overlay.width(),
            overlay.height(),
            dst.width(),
            dst.height()
        )));
    }
    for (d, s) in dst.pixels_mut().zip(overlay.pixels()) {
        d.0 = source_atop(d.0, s.0);
    }
    Ok(())
}
