//! Tick planning: turning a load curve into concrete fire-at offsets.
//!
//! The planner is a pure function from `(iteration_count, duration, shape)`
//! to a monotonic sequence of relative timestamps. Band counts are rounded
//! with a running-remainder carry so the output length is always exactly the
//! requested iteration count, whatever the shape.

use std::time::Duration;

use crate::plan::{Bucket, LoadShape};

/// Sine period divisor for the waved shape: one full wave per `D/8` seconds.
const WAVE_PERIOD_DIVISOR: u64 = 8;
/// Waved band counts oscillate between 25% and 175% of the mean.
const WAVE_AMPLITUDE: f64 = 0.75;

/// Produce the fire-at offsets for a plan.
///
/// `manual_buckets`, when non-empty, overrides the shape entirely: each
/// bucket contributes `count` evenly spread iterations over its duration,
/// concatenated in order.
pub fn plan_ticks(
    iteration_count: u64,
    duration_secs: u64,
    shape: LoadShape,
    manual_buckets: &[Bucket],
) -> Vec<Duration> {
    if !manual_buckets.is_empty() {
        return manual(manual_buckets);
    }
    if iteration_count == 0 || duration_secs == 0 {
        return Vec::new();
    }
    match shape {
        LoadShape::Linear => linear(iteration_count, duration_secs),
        LoadShape::Incremental => banded(iteration_count, duration_secs, incremental_weights),
        LoadShape::Waved => banded(iteration_count, duration_secs, waved_weights),
    }
}

/// `t_i = (i - 0.5) * D / N`.
fn linear(n: u64, d: u64) -> Vec<Duration> {
    let mut ticks = Vec::with_capacity(n as usize);
    spread(n, 0.0, d as f64, &mut ticks);
    ticks
}

fn incremental_weights(bands: u64) -> Vec<f64> {
    // Band k carries weight proportional to k; the 2N k / (B (B+1)) formula
    // falls out of normalizing by sum(1..=B).
    (1..=bands).map(|k| k as f64).collect()
}

fn waved_weights(bands: u64) -> Vec<f64> {
    let period = (bands / WAVE_PERIOD_DIVISOR).max(1) as f64;
    (0..bands)
        .map(|s| 1.0 + WAVE_AMPLITUDE * (2.0 * std::f64::consts::PI * s as f64 / period).sin())
        .collect()
}

/// Shared banded planner: split the duration into equal bands, weight them,
/// round counts with carry, and spread each band's share evenly inside it.
fn banded(n: u64, d: u64, weights_for: fn(u64) -> Vec<f64>) -> Vec<Duration> {
    let bands = n.min(d);
    let weights = weights_for(bands);
    let counts = carry_rounded_counts(&weights, n);

    let band_len = d as f64 / bands as f64;
    let mut ticks = Vec::with_capacity(n as usize);
    for (k, &count) in counts.iter().enumerate() {
        spread(count, k as f64 * band_len, band_len, &mut ticks);
    }
    ticks
}

fn manual(buckets: &[Bucket]) -> Vec<Duration> {
    let total: u64 = buckets.iter().map(|b| b.count).sum();
    let mut ticks = Vec::with_capacity(total as usize);
    let mut offset = 0.0;
    for bucket in buckets {
        spread(bucket.count, offset, bucket.duration_secs as f64, &mut ticks);
        offset += bucket.duration_secs as f64;
    }
    ticks
}

/// Append `count` evenly spaced offsets covering `[start, start + len)`.
fn spread(count: u64, start_secs: f64, len_secs: f64, out: &mut Vec<Duration>) {
    for i in 1..=count {
        let t = start_secs + (i as f64 - 0.5) * len_secs / count as f64;
        out.push(Duration::from_secs_f64(t));
    }
}

/// Distribute `total` across bands proportionally to `weights`, rounding with
/// a running remainder so the counts sum to exactly `total`.
fn carry_rounded_counts(weights: &[f64], total: u64) -> Vec<u64> {
    let weight_sum: f64 = weights.iter().sum();
    if weight_sum <= 0.0 {
        return vec![0; weights.len()];
    }

    let mut counts = Vec::with_capacity(weights.len());
    let mut exact_acc = 0.0;
    let mut assigned: u64 = 0;
    for w in weights {
        exact_acc += total as f64 * w / weight_sum;
        let target = exact_acc.round() as u64;
        counts.push(target - assigned);
        assigned = target;
    }
    // Floating-point drift in the last band is absorbed here.
    if assigned != total {
        if let Some(last) = counts.last_mut() {
            *last = last.wrapping_add(total.wrapping_sub(assigned));
        }
    }
    counts
}
