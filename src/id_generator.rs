//! Random trace and span ID generation.
//!
//! IDs prefer the operating system's cryptographically strong source. If
//! that source fails the failure is logged once per process and generation
//! falls back to a statistical PRNG; span IDs do not require cryptographic
//! integrity, only a vanishing collision probability.

use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::{OsRng, SmallRng};
use rand::{Rng, RngCore, SeedableRng};

use crate::trace_context::TraceId;

static OS_RNG_WARN: Once = Once::new();

thread_local! {
    /// Statistical fallback generator, one per thread.
    static FALLBACK_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(fallback_seed()));
}

// Seeds the fallback without touching the OS entropy source (which is
// exactly what just failed when the fallback gets used): hasher keys are
// randomized per process, the clock varies per thread creation.
fn fallback_seed() -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    RandomState::new().build_hasher().finish() ^ clock
}

/// Returns a new nonzero span ID. You are never expected to call this
/// directly; [`Span::new_trace`] and [`Span::new_sub_span`] do.
///
/// Eight random bytes are read from the OS source. If that read fails, the
/// failure is logged (once across the process lifetime) and `previous` plus
/// a statistical random value is used instead, redrawn until nonzero.
///
/// [`Span::new_trace`]: crate::Span::new_trace
/// [`Span::new_sub_span`]: crate::Span::new_sub_span
pub fn new_span_id(previous: u64) -> u64 {
    let mut bytes = [0u8; 8];
    let mut id = match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(err) => {
            OS_RNG_WARN.call_once(|| {
                tracing::warn!(
                    error = %err,
                    "error reading random bytes for new trace/span id"
                );
            });
            0
        }
    };
    while id == 0 {
        id = previous.wrapping_add(FALLBACK_RNG.with(|rng| rng.borrow_mut().gen::<u64>()));
    }
    id
}

/// Returns a new trace ID usable with Cloud Trace: a random sequence of 32
/// hex digits, never all zero.
///
/// If `previous` holds a valid trace ID its halves are additively mixed
/// into the new ID for extra randomness (which also guarantees the same ID
/// is not returned).
pub fn new_trace_id(previous: Option<TraceId>) -> TraceId {
    let mut hi = new_span_id(0);
    let mut lo = new_span_id(0);
    if let Some(prev) = previous.filter(|t| t.is_valid()) {
        let (add_hi, add_lo) = prev.halves();
        hi = hi.wrapping_add(add_hi);
        lo = lo.wrapping_add(add_lo);
        if hi == 0 && lo == 0 {
            lo = lo.wrapping_sub(add_lo);
        }
    }
    TraceId::from_halves(hi, lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_ids_are_nonzero_and_spread() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = new_span_id(0);
            assert_ne!(id, 0);
            seen.insert(id);
        }
        // Collisions in 1000 draws from a 64-bit space would point at a
        // broken generator, not bad luck.
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn trace_ids_render_as_32_lowercase_hex() {
        for _ in 0..100 {
            let id = new_trace_id(None);
            assert!(id.is_valid());
            let hex = id.to_string();
            assert_eq!(hex.len(), 32);
            assert!(hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }
    }

    #[test]
    fn trace_id_mixes_previous() {
        let prev = TraceId::from_hex("0123456789abcdef0123456789abcdef").unwrap();
        for _ in 0..100 {
            let id = new_trace_id(Some(prev));
            assert!(id.is_valid());
            assert_ne!(id, prev);
        }
    }
}
