//! Deterministic mixing-plan generation.
//!
//! A plan splits the mixed amount into standard-denomination chunks, samples
//! an exponentially distributed delay per chunk, and assigns each chunk a
//! multi-hop route and a destination address. Given the same request and
//! seed, the plan is identical; all randomness flows from one seeded ChaCha8
//! stream.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tumbler_types::amount::{percentage_of, Amount};
use tumbler_types::mix::MixRequest;
use tumbler_types::Hash;

use crate::EngineError;

/// Delays never drop below half an hour, whatever the exponential draw says.
const MIN_DELAY_SECS: u64 = 1800;

/// Chunk jitter bound: +/-5% of the chunk.
const JITTER_FRACTION: f64 = 0.05;

/// One planned payout chunk.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub amount: Amount,
    pub delay_secs: u64,
    /// Mixer identities for each intermediate hop.
    pub route: Vec<Hash>,
    pub to_address: String,
}

/// The full mixing plan of a request.
#[derive(Debug, Clone)]
pub struct MixingPlan {
    pub chunks: Vec<PlannedChunk>,
    pub fee: Amount,
}

impl MixingPlan {
    pub fn total_distributed(&self) -> Amount {
        self.chunks.iter().map(|c| c.amount).sum()
    }
}

/// Derive the plan RNG from the request identity and an external seed.
fn plan_rng(request: &MixRequest, seed: u64) -> ChaCha8Rng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"TUMBLER_PLAN_SEED");
    hasher.update(request.id.0.as_bytes());
    hasher.update(&seed.to_le_bytes());
    ChaCha8Rng::from_seed(*hasher.finalize().as_bytes())
}

/// Generate the mixing plan for a request. Deterministic in
/// `(request.id, seed)`.
pub fn generate_plan(request: &MixRequest, seed: u64) -> Result<MixingPlan, EngineError> {
    let mut rng = plan_rng(request, seed);
    let currency = request.currency;
    let distributable = request.input_amount;
    let dust = currency.dust_limit();

    let amounts = split_chunks(distributable, currency.denominations(), dust, &mut rng);
    if amounts.is_empty() {
        return Err(EngineError::Internal(format!(
            "chunking produced no chunks for {}",
            distributable
        )));
    }

    let mut delays = sample_delays(amounts.len(), request.delay_window_secs, &mut rng);
    delays.sort_unstable();

    let routes: Vec<Vec<Hash>> = (0..amounts.len()).map(|_| sample_route(&mut rng)).collect();

    let destinations = assign_destinations(request, &amounts);

    let chunks = amounts
        .into_iter()
        .zip(delays)
        .zip(routes)
        .zip(destinations)
        .map(|(((amount, delay_secs), route), to_address)| PlannedChunk {
            amount,
            delay_secs,
            route,
            to_address,
        })
        .collect();

    Ok(MixingPlan {
        chunks,
        fee: request.fee_amount(),
    })
}

/// Greedy denomination split with per-chunk jitter. Every chunk except the
/// last is jittered by up to +/-5%; the last chunk is the exact remainder,
/// so the chunks always sum to `total`. All chunks stay above dust.
fn split_chunks(total: Amount, denominations: &[u64], dust: Amount, rng: &mut ChaCha8Rng) -> Vec<Amount> {
    let smallest = denominations[0];

    // Pick denominations until the remainder is sub-denomination.
    let mut picks: Vec<u64> = Vec::new();
    let mut remaining = total;
    while remaining >= smallest {
        let eligible: Vec<u64> = denominations
            .iter()
            .copied()
            .filter(|d| *d <= remaining)
            .collect();
        let pick = eligible[rng.gen_range(0..eligible.len())];
        picks.push(pick);
        remaining -= pick;
    }
    if picks.is_empty() {
        // Below the smallest denomination: a single chunk of everything.
        return if total > 0 { vec![total] } else { vec![] };
    }
    if remaining > 0 {
        // Fold the sub-denomination residue into the final pick.
        *picks.last_mut().unwrap() += remaining;
    }

    // Jitter all but the final chunk, which absorbs the drift.
    let n = picks.len();
    let mut amounts: Vec<Amount> = Vec::with_capacity(n);
    let mut allocated: Amount = 0;
    for (idx, base) in picks.iter().enumerate() {
        if idx == n - 1 {
            break;
        }
        let factor = 1.0 + rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let mut amount = ((*base as f64) * factor).round() as Amount;
        // Leave room for the remaining chunks to stay above dust.
        let reserve = dust * (n - idx - 1) as u64;
        let ceiling = (total - allocated).saturating_sub(reserve);
        amount = amount.clamp(dust.min(ceiling), ceiling.max(dust));
        amounts.push(amount);
        allocated += amount;
    }
    let last = total - allocated;
    if last < dust && !amounts.is_empty() {
        // Merge an under-dust remainder into the previous chunk.
        *amounts.last_mut().unwrap() += last;
    } else {
        amounts.push(last);
    }
    amounts
}

/// Exponential delay per chunk: `-ln(1-u) * (max_delay/3)`, clamped to
/// `[0.5h, max_delay]`.
fn sample_delays(count: usize, max_delay_secs: u64, rng: &mut ChaCha8Rng) -> Vec<u64> {
    let mean = max_delay_secs as f64 / 3.0;
    let floor = MIN_DELAY_SECS.min(max_delay_secs);
    (0..count)
        .map(|_| {
            let u: f64 = rng.gen();
            let raw = -(1.0 - u).ln() * mean;
            (raw as u64).clamp(floor, max_delay_secs)
        })
        .collect()
}

/// A route of 2..=4 intermediate mixer identities.
fn sample_route(rng: &mut ChaCha8Rng) -> Vec<Hash> {
    let hops = rng.gen_range(2..=4usize);
    (0..hops)
        .map(|_| {
            let mut id = [0u8; 32];
            rng.fill(&mut id[..]);
            id
        })
        .collect()
}

/// Assign each chunk to the output address with the largest remaining
/// deficit, so realized amounts track the requested percentages.
fn assign_destinations(request: &MixRequest, amounts: &[Amount]) -> Vec<String> {
    let mut deficits: Vec<(String, i128)> = request
        .output_addresses
        .iter()
        .map(|o| {
            (
                o.address.clone(),
                percentage_of(request.input_amount, o.percentage) as i128,
            )
        })
        .collect();

    amounts
        .iter()
        .map(|amount| {
            let (idx, _) = deficits
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, deficit))| *deficit)
                .expect("at least one output address");
            deficits[idx].1 -= *amount as i128;
            deficits[idx].0.clone()
        })
        .collect()
}
