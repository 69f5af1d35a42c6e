// boreas_core/src/rng.rs

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

// ChaCha streams let one seed drive several provably independent sequences.
// Truth generation and filtering must never share a stream: the filter is
// not allowed to "see" the truth through correlated noise.
const TRUTH_STREAM: u64 = 0;
const FILTER_STREAM: u64 = 1;
// Instance `i` filters on stream `BASE + i`, so instance 0 is the plain
// filter stream and parallel instances never collide with the truth draw.
const INSTANCE_STREAM_BASE: u64 = 1;

/// The deterministic pseudo-random number generator for a run.
///
/// Fixing the seed reproduces every draw bit-for-bit; distinct stream ids
/// yield independent sequences from the same seed.
pub fn truth_stream(seed: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(TRUTH_STREAM);
    rng
}

pub fn filter_stream(seed: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(FILTER_STREAM);
    rng
}

/// Independent stream for the `instance_id`-th experiment of a batch.
/// Parallel instances seeded this way are uncorrelated by construction.
pub fn instance_stream(seed: u64, instance_id: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(INSTANCE_STREAM_BASE + instance_id);
    rng
}
