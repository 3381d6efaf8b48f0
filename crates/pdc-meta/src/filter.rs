//! Counting bloom filter guarding each metadata bucket against duplicate inserts.
//!
//! A negative probe proves the key was never added (or was removed). A positive
//! probe only means "maybe": the caller must confirm with a scan. Counters are
//! eight bits wide and saturate; a saturated counter is never decremented, so
//! removal can never introduce a false negative.

/// Counter value that is treated as "stuck" and never decremented.
const SATURATED: u8 = u8::MAX;

/// Probabilistic set of canonical metadata keys.
#[derive(Debug, Clone)]
pub struct DuplicateFilter {
    counters: Vec<u8>,
    num_hashes: u32,
    items: usize,
}

impl DuplicateFilter {
    /// Sizes a filter for `capacity` keys at the target false-positive rate.
    pub fn new(capacity: usize, error_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = error_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(8.0);
        let k = ((m / n) * ln2).round().clamp(1.0, 16.0);
        Self::with_params(m as usize, k as u32)
    }

    /// Builds a filter with an explicit counter count and hash count.
    pub fn with_params(num_counters: usize, num_hashes: u32) -> Self {
        Self {
            counters: vec![0; num_counters.max(1)],
            num_hashes: num_hashes.max(1),
            items: 0,
        }
    }

    /// Number of counters.
    pub fn num_counters(&self) -> usize {
        self.counters.len()
    }

    /// Number of hash probes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of keys currently accounted for.
    pub fn len(&self) -> usize {
        self.items
    }

    /// Returns true if no keys are accounted for.
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Adds a key.
    pub fn add(&mut self, key: &str) {
        for idx in self.indices(key) {
            let c = &mut self.counters[idx];
            *c = c.saturating_add(1);
        }
        self.items += 1;
    }

    /// Returns false only if the key is definitely absent.
    pub fn contains(&self, key: &str) -> bool {
        self.indices(key).all(|idx| self.counters[idx] > 0)
    }

    /// Removes a key previously added. Returns false if the key was definitely absent.
    pub fn remove(&mut self, key: &str) -> bool {
        let indices: Vec<usize> = self.indices(key).collect();
        if indices.iter().any(|&idx| self.counters[idx] == 0) {
            return false;
        }
        for idx in indices {
            let c = &mut self.counters[idx];
            if *c != SATURATED {
                *c -= 1;
            }
        }
        self.items = self.items.saturating_sub(1);
        true
    }

    /// Fraction of counters that are non-zero.
    pub fn fill_ratio(&self) -> f64 {
        let used = self.counters.iter().filter(|&&c| c > 0).count();
        used as f64 / self.counters.len() as f64
    }

    // Double hashing over one blake3 digest: idx_i = h1 + i * h2.
    fn indices(&self, key: &str) -> impl Iterator<Item = usize> {
        let digest = blake3::hash(key.as_bytes());
        let bytes = digest.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[0..8]);
        hi.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(lo);
        let h2 = u64::from_le_bytes(hi) | 1;
        let m = self.counters.len() as u64;
        (0..self.num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}
