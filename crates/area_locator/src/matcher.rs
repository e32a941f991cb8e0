//! Multi-scale template search.
//!
//! The area photo is resized over a fixed ladder of scales and each resized
//! copy is slid across the reference raster, scoring every position with the
//! mean-subtracted normalized cross-correlation. The correlation is
//! independent of template size, so the best score across all scales picks
//! both the scale and the location.
//!
//! Direct correlation costs `positions * template pixels` per scale, which is
//! quartic in the image side. References larger than
//! [`MatcherConfig::coarse_side`] are therefore searched coarse-to-fine: every
//! scale is scored on a downsampled copy of the reference, and only the best
//! few scales are re-scored at full resolution inside a small window around
//! their coarse peak.

use crate::error::LocateError;
use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use std::ops::RangeInclusive;
use std::time::Instant;

/// Coarse templates are never shrunk below this many pixels per side.
const MIN_COARSE_TEMPLATE: u32 = 3;

/// Tuning knobs for [`MultiScaleMatcher`].
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Smallest scale factor applied to the area image.
    pub scale_min: f64,
    /// Largest scale factor applied to the area image.
    pub scale_max: f64,
    /// Number of evenly spaced scales between `scale_min` and `scale_max`, inclusive.
    pub scale_steps: usize,
    /// Resized templates narrower or shorter than this are skipped.
    pub min_dimension: u32,
    /// A match must score strictly above this to be accepted.
    pub min_score: f64,
    /// Longest side of the reference searched exhaustively. Larger references
    /// are downsampled to this size for the coarse pass.
    pub coarse_side: u32,
    /// Scales re-scored at full resolution after the coarse pass.
    pub refine_candidates: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            scale_min: 0.2,
            scale_max: 1.0,
            scale_steps: 50,
            min_dimension: 10,
            min_score: 0.2,
            coarse_side: 128,
            refine_candidates: 3,
        }
    }
}

/// Where the area image was found in the reference raster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub scale: f64,
    pub top_left: (u32, u32),
    /// Exclusive corner: `top_left + resized template size`.
    pub bottom_right: (u32, u32),
    pub score: f64,
}

impl MatchResult {
    pub fn width(&self) -> u32 {
        self.bottom_right.0 - self.top_left.0
    }

    pub fn height(&self) -> u32 {
        self.bottom_right.1 - self.top_left.1
    }
}

/// Best coarse position for one candidate scale.
#[derive(Debug, Clone, Copy)]
struct CoarseHit {
    index: usize,
    scale: f64,
    size: (u32, u32),
    coarse_size: (u32, u32),
    position: (u32, u32),
    score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct MultiScaleMatcher {
    config: MatcherConfig,
}

impl MultiScaleMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Scales, ascending, whose resized query fits strictly inside the reference
    /// and is at least `min_dimension` pixels on both axes.
    pub fn candidate_scales(&self, reference: (u32, u32), query: (u32, u32)) -> Vec<(f64, u32, u32)> {
        let cfg = &self.config;
        let steps = cfg.scale_steps.max(1);

        (0..steps)
            .map(|i| {
                if steps == 1 {
                    cfg.scale_min
                } else {
                    cfg.scale_min + (cfg.scale_max - cfg.scale_min) * i as f64 / (steps - 1) as f64
                }
            })
            .filter_map(|scale| {
                let w = (query.0 as f64 * scale) as u32;
                let h = (query.1 as f64 * scale) as u32;
                let fits = w < reference.0 && h < reference.1;
                let large_enough = w >= cfg.min_dimension && h >= cfg.min_dimension;
                (fits && large_enough).then_some((scale, w, h))
            })
            .collect()
    }

    /// Finds `query` inside `reference`.
    ///
    /// Ties are resolved towards the smallest scale, then the first position
    /// in row-major order, so the result is reproducible.
    pub fn locate(&self, reference: &GrayImage, query: &GrayImage) -> Result<MatchResult, LocateError> {
        let scales = self.candidate_scales(reference.dimensions(), query.dimensions());
        if scales.is_empty() {
            tracing::debug!(
                reference = ?reference.dimensions(),
                query = ?query.dimensions(),
                "No candidate scale fits the reference"
            );
            return Err(LocateError::NoMatchFound);
        }

        let started = Instant::now();
        let plane = Plane::new(reference);
        let longest = reference.width().max(reference.height());
        let best = if longest <= self.config.coarse_side.max(1) {
            self.search_exhaustive(&plane, query, &scales)
        } else {
            self.search_coarse_to_fine(&plane, reference, query, &scales)
        };
        tracing::debug!(
            scales = scales.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Template search finished"
        );

        match best {
            Some(m) if m.score > self.config.min_score => Ok(m),
            _ => Err(LocateError::NoMatchFound),
        }
    }

    fn search_exhaustive(&self, plane: &Plane, query: &GrayImage, scales: &[(f64, u32, u32)]) -> Option<MatchResult> {
        let per_scale: Vec<Option<MatchResult>> = scales
            .par_iter()
            .map(|&(scale, w, h)| {
                let resized = imageops::resize(query, w, h, FilterType::Triangle);
                plane
                    .best_in(&resized, plane.x_range(w), plane.y_range(h))
                    .map(|(score, x, y)| MatchResult {
                        scale,
                        top_left: (x, y),
                        bottom_right: (x + w, y + h),
                        score,
                    })
            })
            .collect();
        first_best(per_scale.into_iter().flatten())
    }

    fn search_coarse_to_fine(
        &self,
        plane: &Plane,
        reference: &GrayImage,
        query: &GrayImage,
        scales: &[(f64, u32, u32)],
    ) -> Option<MatchResult> {
        let (rw, rh) = reference.dimensions();
        let shrink = rw.max(rh) as f64 / self.config.coarse_side.max(1) as f64;
        let cw = ((rw as f64 / shrink).round() as u32).max(1);
        let ch = ((rh as f64 / shrink).round() as u32).max(1);
        let coarse = Plane::new(&imageops::resize(reference, cw, ch, FilterType::Triangle));
        // Per-axis ratio between full and coarse pixels.
        let (fx, fy) = (rw as f64 / cw as f64, rh as f64 / ch as f64);

        let hits: Vec<Option<CoarseHit>> = scales
            .par_iter()
            .enumerate()
            .map(|(index, &(scale, w, h))| {
                let tw = ((w as f64 / fx).round() as u32)
                    .max(MIN_COARSE_TEMPLATE)
                    .min(cw.saturating_sub(1));
                let th = ((h as f64 / fy).round() as u32)
                    .max(MIN_COARSE_TEMPLATE)
                    .min(ch.saturating_sub(1));
                let template = imageops::resize(query, tw.max(1), th.max(1), FilterType::Triangle);
                coarse
                    .best_in(&template, coarse.x_range(tw), coarse.y_range(th))
                    .map(|(score, x, y)| CoarseHit {
                        index,
                        scale,
                        size: (w, h),
                        coarse_size: (tw, th),
                        position: (x, y),
                        score,
                    })
            })
            .collect();

        let mut shortlist: Vec<CoarseHit> = hits.into_iter().flatten().collect();
        shortlist.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        shortlist.truncate(self.config.refine_candidates.max(1));
        shortlist.sort_by_key(|hit| hit.index);
        tracing::trace!(shortlist = ?shortlist, shrink, "Coarse pass finished");

        let refined: Vec<Option<MatchResult>> = shortlist
            .par_iter()
            .map(|hit| {
                let (w, h) = hit.size;
                let template = imageops::resize(query, w, h, FilterType::Triangle);
                let xs = refine_window(hit.position.0, fx, hit.coarse_size.0, w, rw);
                let ys = refine_window(hit.position.1, fy, hit.coarse_size.1, h, rh);
                plane.best_in(&template, xs, ys).map(|(score, x, y)| MatchResult {
                    scale: hit.scale,
                    top_left: (x, y),
                    bottom_right: (x + w, y + h),
                    score,
                })
            })
            .collect();
        first_best(refined.into_iter().flatten())
    }
}

/// Highest score wins; on equal scores the earlier candidate is kept.
fn first_best(candidates: impl Iterator<Item = MatchResult>) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for candidate in candidates {
        tracing::trace!(scale = candidate.scale, score = candidate.score, "Scale scored");
        if best.map_or(true, |b| candidate.score > b.score) {
            best = Some(candidate);
        }
    }
    best
}

/// Full-resolution start positions around a coarse peak along one axis.
///
/// The radius covers one coarse pixel of quantization plus half of any
/// growth forced on the coarse template by [`MIN_COARSE_TEMPLATE`].
fn refine_window(coarse_pos: u32, ratio: f64, coarse_len: u32, len: u32, reference_len: u32) -> RangeInclusive<u32> {
    let last = reference_len.saturating_sub(len);
    let center = ((coarse_pos as f64 * ratio).round() as u32).min(last);
    let inflated = (coarse_len as f64 * ratio - len as f64).max(0.0) / 2.0;
    let radius = ratio.ceil() as u32 + 1 + inflated.ceil() as u32;
    center.saturating_sub(radius)..=(center + radius).min(last)
}

/// Reference raster as floats plus summed-area tables for windowed mean/variance.
struct Plane {
    width: usize,
    height: usize,
    pixels: Vec<f64>,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Plane {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let pixels: Vec<f64> = image.as_raw().iter().map(|&v| v as f64).collect();

        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = pixels[y * w + x];
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }

        Self {
            width: w,
            height: h,
            pixels,
            sum,
            sum_sq,
        }
    }

    /// Every horizontal start position for a template `tw` pixels wide.
    fn x_range(&self, tw: u32) -> RangeInclusive<u32> {
        0..=(self.width as u32).saturating_sub(tw)
    }

    fn y_range(&self, th: u32) -> RangeInclusive<u32> {
        0..=(self.height as u32).saturating_sub(th)
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let stride = self.width + 1;
        table[(y + h) * stride + x + w] - table[y * stride + x + w] - table[(y + h) * stride + x]
            + table[y * stride + x]
    }

    /// Best `(score, x, y)` for `template` with its top-left corner inside
    /// `xs` x `ys`, or `None` if the template is flat or does not fit.
    fn best_in(&self, template: &GrayImage, xs: RangeInclusive<u32>, ys: RangeInclusive<u32>) -> Option<(f64, u32, u32)> {
        let (tw, th) = (template.width() as usize, template.height() as usize);
        if tw == 0 || th == 0 || tw > self.width || th > self.height {
            return None;
        }
        let x_end = (*xs.end() as usize).min(self.width - tw);
        let y_end = (*ys.end() as usize).min(self.height - th);
        let (x_start, y_start) = (*xs.start() as usize, *ys.start() as usize);
        if x_start > x_end || y_start > y_end {
            return None;
        }

        let n = (tw * th) as f64;
        let raw: Vec<f64> = template.as_raw().iter().map(|&v| v as f64).collect();
        let mean = raw.iter().sum::<f64>() / n;
        let centered: Vec<f64> = raw.iter().map(|v| v - mean).collect();
        let t_norm = centered.iter().map(|v| v * v).sum::<f64>();
        if t_norm <= f64::EPSILON {
            return None;
        }

        let rows: Vec<Option<(f64, usize, usize)>> = (y_start..=y_end)
            .into_par_iter()
            .map(|y| {
                let mut row_best: Option<(f64, usize, usize)> = None;
                for x in x_start..=x_end {
                    let score = self.score_at(&centered, t_norm, n, tw, th, x, y);
                    if row_best.map_or(true, |(s, _, _)| score > s) {
                        row_best = Some((score, x, y));
                    }
                }
                row_best
            })
            .collect();

        let mut best: Option<(f64, u32, u32)> = None;
        for (score, x, y) in rows.into_iter().flatten() {
            if best.map_or(true, |(s, _, _)| score > s) {
                best = Some((score, x as u32, y as u32));
            }
        }
        best
    }

    #[allow(clippy::too_many_arguments)]
    fn score_at(&self, centered: &[f64], t_norm: f64, n: f64, tw: usize, th: usize, x: usize, y: usize) -> f64 {
        let window_sum = self.window(&self.sum, x, y, tw, th);
        let window_sq = self.window(&self.sum_sq, x, y, tw, th);
        let variance = window_sq - window_sum * window_sum / n;
        if variance <= 1e-9 {
            return 0.0;
        }

        // The template is zero-mean, so the window mean drops out of the numerator.
        let mut dot = 0.0;
        for j in 0..th {
            let src = &self.pixels[(y + j) * self.width + x..][..tw];
            let tpl = &centered[j * tw..][..tw];
            dot += src.iter().zip(tpl).map(|(a, b)| a * b).sum::<f64>();
        }
        dot / (t_norm * variance).sqrt()
    }
}
