use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use rand::Rng;

/// Upper bound (exclusive) for a run's base seed.
pub const SEED_RANGE: u32 = 1000;

/// Offset applied to Pro seeds so they do not collide with Free runs.
pub const PRO_SEED_OFFSET: u32 = 100;

/// `{base}/seed/{seed}/{width}/{height}`
pub fn placeholder_url(base: &str, seed: u32, width: u32, height: u32) -> String {
    format!(
        "{}/seed/{seed}/{width}/{height}",
        base.trim().trim_end_matches('/')
    )
}

pub trait SeedSource: Send + Sync {
    /// A base seed in `[0, SEED_RANGE)`.
    fn next_base(&self) -> u32;
}

/// Uniform random bases that never repeat back to back, so two
/// consecutive runs never share image addresses.
#[derive(Debug, Default)]
pub struct RandomSeeds {
    last: Mutex<Option<u32>>,
}

impl RandomSeeds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeedSource for RandomSeeds {
    fn next_base(&self) -> u32 {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(0..SEED_RANGE);
            if *last != Some(candidate) {
                *last = Some(candidate);
                return candidate;
            }
        }
    }
}

/// Replays a fixed sequence of bases, cycling when exhausted.
#[derive(Debug)]
pub struct FixedSeeds {
    values: Vec<u32>,
    cursor: AtomicUsize,
}

impl FixedSeeds {
    pub fn new(values: impl Into<Vec<u32>>) -> Self {
        let mut values = values.into();
        if values.is_empty() {
            values.push(0);
        }
        for value in &mut values {
            *value %= SEED_RANGE;
        }
        Self {
            values,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl SeedSource for FixedSeeds {
    fn next_base(&self) -> u32 {
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        self.values[idx % self.values.len()]
    }
}
