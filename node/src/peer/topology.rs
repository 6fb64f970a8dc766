//! Neighbour selection with power-law preferential attachment.
//!
//! The neighbour count comes from a Pareto distribution, so the overlay grows
//! a heavy-tailed degree distribution with short paths. Candidates are
//! weighted by `degree + 1`; the +1 keeps newly joined peers from starving at
//! weight zero.

use rand::Rng;

use crate::network::message::PeerEntry;
use crate::network::Endpoint;

const PARETO_ALPHA: f64 = 2.5;

pub(crate) fn select_neighbours<R: Rng>(
    rng: &mut R,
    candidates: &[PeerEntry],
    own: &Endpoint,
) -> Vec<Endpoint> {
    let pool: Vec<PeerEntry> = candidates
        .iter()
        .filter(|entry| entry.endpoint() != *own)
        .cloned()
        .collect();
    if pool.is_empty() {
        return Vec::new();
    }
    let k = degree_count(rng, pool.len());
    select_k_distinct(rng, &pool, k)
}

/// Neighbour count drawn from Pareto(alpha), clamped to [1, n].
pub(crate) fn degree_count<R: Rng>(rng: &mut R, n: usize) -> usize {
    let u: f64 = 1.0 - rng.gen::<f64>();
    let draw = 1.0 / u.powf(1.0 / PARETO_ALPHA);
    (draw as usize).clamp(1, n)
}

/// `k` distinct candidates by inverse-CDF draws without replacement.
///
/// Each step renormalises the remaining weights, draws a uniform and takes
/// the first index whose cumulative probability reaches it. If floating-point
/// drift lets the cumulative fall short, the last remaining index is taken.
pub(crate) fn select_k_distinct<R: Rng>(
    rng: &mut R,
    pool: &[PeerEntry],
    k: usize,
) -> Vec<Endpoint> {
    let mut remaining: Vec<usize> = (0..pool.len()).collect();
    let total: f64 = pool.iter().map(|entry| f64::from(entry.degree) + 1.0).sum();
    let mut probs: Vec<f64> = pool
        .iter()
        .map(|entry| (f64::from(entry.degree) + 1.0) / total)
        .collect();

    let mut chosen = Vec::new();
    for _ in 0..k {
        if remaining.is_empty() {
            break;
        }
        let draw: f64 = rng.gen();
        let mut cumulative = 0.0;
        let mut picked = remaining.len() - 1;
        for (i, prob) in probs.iter().enumerate() {
            cumulative += prob;
            if draw <= cumulative {
                picked = i;
                break;
            }
        }

        let original = remaining[picked];
        chosen.push(pool[original].endpoint());
        remaining.remove(picked);
        probs.remove(picked);

        let rest: f64 = probs.iter().sum();
        let rest = if rest > 0.0 { rest } else { 1.0 };
        for prob in probs.iter_mut() {
            *prob /= rest;
        }
    }
    chosen
}
