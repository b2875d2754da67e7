//! Reputation-weighted proposer committee election.
//!
//! In election, a certain number of candidates (referred to as *seats*) are
//! elected to be proposers according to their reputation value. Two
//! principles shape the algorithm:
//!
//! - A node with higher reputation has a higher chance to be elected;
//! - Each term of proposers has a certain number of representatives from
//!   nodes with low reputation.
//!
//! Candidates are therefore divided into a low-reputation and a
//! high-reputation partition, each with its own number of available seats,
//! and within a partition the probability mass for a node is proportional
//! to its score.
//!
//! Determinism is a first-class contract: every honest node fed the same
//! reputation list and seed must produce the identical committee in the
//! identical order. The PRNG is a [`ChaCha8Rng`] seeded from the election
//! seed, and candidates sort by `(score, address)` so equal scores cannot
//! reorder between nodes.

use dpor_types::{Address, RptEntry};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Elect an ordered committee of `total_seats` addresses.
///
/// The reputation list is sorted ascending and split at `low_rpt_count`
/// into a low partition and a high partition. `low_rpt_seats` seats are
/// filled from the low partition, the remainder from the high partition,
/// and the low winners come first in the result.
///
/// Any precondition violation yields an empty committee, not an error:
/// `low_rpt_count ≤ |rpts|`, `low_rpt_seats ≤ total_seats`,
/// `total_seats ≤ |rpts|`, `low_rpt_count ≥ low_rpt_seats`, and each
/// partition must hold at least as many candidates as the seats it owes.
pub fn elect(
    rpts: &[RptEntry],
    seed: u64,
    total_seats: usize,
    low_rpt_count: usize,
    low_rpt_seats: usize,
) -> Vec<Address> {
    if low_rpt_count > rpts.len()
        || low_rpt_seats > total_seats
        || total_seats > rpts.len()
        || low_rpt_count < low_rpt_seats
        // The high partition must be able to fill its seats, or sampling
        // without replacement cannot finish.
        || total_seats - low_rpt_seats > rpts.len() - low_rpt_count
    {
        debug!(
            candidates = rpts.len(),
            total_seats,
            low_rpt_count,
            low_rpt_seats,
            "election preconditions violated, returning empty committee"
        );
        return Vec::new();
    }

    let mut sorted = rpts.to_vec();
    sorted.sort();

    let (low, high) = sorted.split_at(low_rpt_count);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut committee = select_weighted(low, &mut rng, low_rpt_seats);
    committee.extend(select_weighted(high, &mut rng, total_seats - low_rpt_seats));

    debug!(seed, elected = committee.len(), "committee elected");
    committee
}

/// Sampling mass of a candidate.
///
/// Non-positive scores are clamped to one so every candidate stays
/// reachable and the redraw loop terminates.
fn mass(entry: &RptEntry) -> i64 {
    entry.score.max(1)
}

/// Weighted sampling without replacement over one sorted partition.
///
/// Draws uniformly over the prefix-sum range; a draw landing in the i-th
/// prefix interval selects candidate i. Draws hitting an already-selected
/// candidate are redrawn.
fn select_weighted(partition: &[RptEntry], rng: &mut ChaCha8Rng, seats: usize) -> Vec<Address> {
    if seats == 0 {
        return Vec::new();
    }

    let mut sums = Vec::with_capacity(partition.len());
    let mut total: i64 = 0;
    for entry in partition {
        total += mass(entry);
        sums.push(total);
    }

    let mut selected = vec![false; partition.len()];
    let mut result = Vec::with_capacity(seats);
    let mut remaining = seats;

    while remaining > 0 {
        let r = rng.gen_range(0..total);
        let idx = sums
            .iter()
            .position(|&s| r < s)
            .unwrap_or(partition.len() - 1);

        if selected[idx] {
            continue;
        }

        selected[idx] = true;
        result.push(partition[idx].address);
        remaining -= 1;
    }

    result
}
