//! Synthetic rasters for matcher and workflow tests.

use image::{GrayImage, Luma};

/// A smooth, non-periodic "map": a gentle gradient with a field of gaussian
/// blobs at pseudo-random positions. Smooth content keeps correlation high
/// after resampling while the blob layout keeps every window distinct.
pub(crate) fn patterned_map(width: u32, height: u32) -> GrayImage {
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        (seed % 10_000) as f64 / 10_000.0
    };

    let blobs: Vec<(f64, f64, f64, f64)> = (0..(width * height / 300).max(8))
        .map(|_| {
            let cx = next() * width as f64;
            let cy = next() * height as f64;
            let sigma = 3.0 + next() * 7.0;
            let amp = if next() > 0.5 { 70.0 } else { -70.0 };
            (cx, cy, sigma, amp)
        })
        .collect();

    GrayImage::from_fn(width, height, |x, y| {
        let (fx, fy) = (x as f64, y as f64);
        let mut v = 100.0 + 0.3 * fx + 0.2 * fy;
        for &(cx, cy, sigma, amp) in &blobs {
            let d2 = (fx - cx).powi(2) + (fy - cy).powi(2);
            v += amp * (-d2 / (2.0 * sigma * sigma)).exp();
        }
        Luma([v.clamp(0.0, 255.0) as u8])
    })
}

/// Intersection over union of two half-open pixel rectangles.
pub(crate) fn iou(a_tl: (u32, u32), a_br: (u32, u32), b_tl: (u32, u32), b_br: (u32, u32)) -> f64 {
    let ix = a_br.0.min(b_br.0).saturating_sub(a_tl.0.max(b_tl.0)) as f64;
    let iy = a_br.1.min(b_br.1).saturating_sub(a_tl.1.max(b_tl.1)) as f64;
    let inter = ix * iy;
    let area = |tl: (u32, u32), br: (u32, u32)| ((br.0 - tl.0) * (br.1 - tl.1)) as f64;
    inter / (area(a_tl, a_br) + area(b_tl, b_br) - inter)
}
