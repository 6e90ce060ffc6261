//! Forward-backward Lucas-Kanade pyramidal optical flow — the `fb_tracking`
//! external kernel of `spec.md` §6, implemented directly on top of
//! `opencv::video` the way the rest of this workspace leans on `opencv` for
//! every other image-domain operation (feature detection in
//! `frame_point_generator.rs`).

use anyhow::Result;
use opencv::core::{Point2f, Size, TermCriteria, TermCriteria_Type, Vector};
use opencv::prelude::*;
use opencv::video::calc_optical_flow_pyr_lk;

#[derive(Debug, Clone, Copy)]
pub struct KltParams {
    pub window_size: i32,
    pub pyramid_levels: i32,
    pub max_ktl_distance: f64,
}

impl Default for KltParams {
    fn default() -> Self {
        Self {
            window_size: 21,
            pyramid_levels: 3,
            max_ktl_distance: 1.0,
        }
    }
}

/// Result of tracking one batch of prior pixel positions from `prev_img` to
/// `cur_img`: the new pixel for each input (meaningless when `status` is
/// `false`) and a per-point success flag combining the forward optical-flow
/// status with the backward forward-backward consistency check.
pub struct TrackingResult {
    pub new_pixels: Vec<Point2f>,
    pub status: Vec<bool>,
}

/// `fb_tracking(prev_img, cur_img, prior_pixels, params) -> (new_pixels, status_flags)`.
pub fn fb_tracking(
    prev_img: &Mat,
    cur_img: &Mat,
    prior_pixels: &[Point2f],
    params: &KltParams,
) -> Result<TrackingResult> {
    if prior_pixels.is_empty() {
        return Ok(TrackingResult { new_pixels: vec![], status: vec![] });
    }

    let win_size = Size::new(params.window_size, params.window_size);
    let criteria = TermCriteria::new(
        (TermCriteria_Type::COUNT as i32) | (TermCriteria_Type::EPS as i32),
        30,
        0.01,
    )?;

    let prev_pts: Vector<Point2f> = prior_pixels.iter().copied().collect();

    let mut forward_pts: Vector<Point2f> = Vector::new();
    let mut forward_status: Vector<u8> = Vector::new();
    let mut forward_err: Vector<f32> = Vector::new();
    calc_optical_flow_pyr_lk(
        prev_img,
        cur_img,
        &prev_pts,
        &mut forward_pts,
        &mut forward_status,
        &mut forward_err,
        win_size,
        params.pyramid_levels,
        criteria,
        0,
        1e-4,
    )?;

    let mut backward_pts: Vector<Point2f> = Vector::new();
    let mut backward_status: Vector<u8> = Vector::new();
    let mut backward_err: Vector<f32> = Vector::new();
    calc_optical_flow_pyr_lk(
        cur_img,
        prev_img,
        &forward_pts,
        &mut backward_pts,
        &mut backward_status,
        &mut backward_err,
        win_size,
        params.pyramid_levels,
        criteria,
        0,
        1e-4,
    )?;

    let mut new_pixels = Vec::with_capacity(prior_pixels.len());
    let mut status = Vec::with_capacity(prior_pixels.len());
    for i in 0..prior_pixels.len() {
        let forward_ok = forward_status.get(i).unwrap_or(0) != 0;
        let backward_ok = backward_status.get(i).unwrap_or(0) != 0;
        let new_pt = forward_pts.get(i).unwrap_or(prior_pixels[i]);
        let round_trip = backward_pts.get(i).unwrap_or(prior_pixels[i]);
        let drift = ((round_trip.x - prior_pixels[i].x).powi(2)
            + (round_trip.y - prior_pixels[i].y).powi(2))
        .sqrt() as f64;
        let ok = forward_ok && backward_ok && drift <= params.max_ktl_distance;
        new_pixels.push(new_pt);
        status.push(ok);
    }

    Ok(TrackingResult { new_pixels, status })
}
