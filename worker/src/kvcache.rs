use std::time::{Duration, Instant};

use dashmap::DashMap;

use sdk::layout::{align_offset, KV_CAP_ALIGN};

/// One head-sharded KV buffer: head-major `[heads, cap, dim]` storage in
/// f32 with a current length. Capacity grows geometrically, aligned to
/// [`KV_CAP_ALIGN`] positions.
pub struct KvCache {
    pub heads: usize,
    pub dim: usize,
    pub cap: usize,
    pub len: usize,
    data: Vec<f32>,
    pub last_flush: Instant,
}

impl KvCache {
    pub fn new(heads: usize, dim: usize) -> Self {
        Self {
            heads,
            dim,
            cap: 0,
            len: 0,
            data: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    /// Contiguous `[cap, dim]` storage of one local head.
    pub fn head(&self, h: usize) -> &[f32] {
        &self.data[h * self.cap * self.dim..(h + 1) * self.cap * self.dim]
    }

    fn grow(&mut self, need: usize) {
        let new_cap = align_offset((2 * self.cap).max(need), KV_CAP_ALIGN);
        let mut new_data = vec![0f32; self.heads * new_cap * self.dim];
        for h in 0..self.heads {
            let src = &self.data[h * self.cap * self.dim..h * self.cap * self.dim + self.len * self.dim];
            new_data[h * new_cap * self.dim..h * new_cap * self.dim + self.len * self.dim]
                .copy_from_slice(src);
        }
        self.cap = new_cap;
        self.data = new_data;
    }

    /// Append `new_len` positions; `src` is head-major
    /// `[heads, new_len, dim]` over this worker's local heads.
    pub fn append(&mut self, new_len: usize, src: &[f32]) {
        debug_assert_eq!(src.len(), self.heads * new_len * self.dim);
        if self.cap - self.len < new_len {
            self.grow(self.len + new_len);
        }
        for h in 0..self.heads {
            let dst_base = h * self.cap * self.dim + self.len * self.dim;
            let src_base = h * new_len * self.dim;
            self.data[dst_base..dst_base + new_len * self.dim]
                .copy_from_slice(&src[src_base..src_base + new_len * self.dim]);
        }
        self.len += new_len;
        self.last_flush = Instant::now();
    }
}

/// Registry of caches keyed by the 64-bit cache id. Caches idle for longer
/// than the configured threshold are swept before a new id allocates.
pub struct KvStore {
    caches: DashMap<u64, KvCache>,
    idle_threshold: Duration,
}

impl KvStore {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            caches: DashMap::new(),
            idle_threshold,
        }
    }

    pub fn contains(&self, uid: u64) -> bool {
        self.caches.contains_key(&uid)
    }

    pub fn get(&self, uid: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, KvCache>> {
        self.caches.get(&uid)
    }

    /// Look up `uid`, sweeping idle caches and allocating a fresh one when
    /// it is unknown.
    pub fn get_or_create(
        &self,
        uid: u64,
        heads: usize,
        dim: usize,
    ) -> dashmap::mapref::one::RefMut<'_, u64, KvCache> {
        if !self.caches.contains_key(&uid) {
            self.sweep();
            log::debug!("allocating kv cache {} ({} heads, dim {})", uid, heads, dim);
        }
        self.caches.entry(uid).or_insert_with(|| KvCache::new(heads, dim))
    }

    /// Drop caches idle for longer than the threshold.
    pub fn sweep(&self) {
        let threshold = self.idle_threshold;
        self.caches.retain(|uid, cache| {
            let keep = cache.last_flush.elapsed() <= threshold;
            if !keep {
                log::info!("sweeping idle kv cache {}", uid);
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_monotonic_growth() {
        let mut cache = KvCache::new(2, 4);
        let mut prev_len = 0;
        for step in 1..=5 {
            let src = vec![step as f32; 2 * step * 4];
            cache.append(step, &src);
            assert!(cache.len > prev_len);
            assert!(cache.cap >= cache.len);
            assert_eq!(cache.cap % KV_CAP_ALIGN, 0);
            prev_len = cache.len;
        }
    }

    #[test]
    fn test_growth_is_geometric() {
        let mut cache = KvCache::new(1, 1);
        let mut caps = Vec::new();
        for _ in 0..600 {
            cache.append(1, &[1.0]);
            if caps.last() != Some(&cache.cap) {
                caps.push(cache.cap);
            }
        }
        for pair in caps.windows(2) {
            assert!(pair[1] >= 2 * pair[0], "capacity steps {:?}", caps);
        }
    }

    #[test]
    fn test_append_preserves_prior_positions() {
        let mut cache = KvCache::new(2, 2);
        cache.append(2, &[1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0]);
        cache.append(1, &[5.0, 6.0, 50.0, 60.0]);
        assert_eq!(cache.len, 3);
        assert_eq!(&cache.head(0)[..6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(&cache.head(1)[..6], &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
    }

    #[test]
    fn test_sweep_drops_idle() {
        let store = KvStore::new(Duration::from_secs(0));
        store.get_or_create(1, 1, 4).append(1, &[0.0; 4]);
        std::thread::sleep(Duration::from_millis(5));
        store.sweep();
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_id_allocates() {
        let store = KvStore::new(Duration::from_secs(120));
        assert!(!store.contains(9));
        store.get_or_create(9, 2, 8);
        assert!(store.contains(9));
    }
}
