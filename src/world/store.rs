//! Authoritative map of loaded chunks and their subscribers.
//!
//! Lock order is always `in_flight` before `chunks`. Neither lock is held
//! while a chunk is generated or read from the archive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::core::{Chunk, ChunkCoord, ClientId};
use crate::error::GenerationError;
use crate::events::{ChunkLoadEvent, Listeners, LoadOrigin};
use crate::world::archive::ChunkArchive;
use crate::world::generator::ChunkSource;
use crate::world::loader::GenerationPool;

type Outcome = Result<Arc<Chunk>, GenerationError>;

struct StoredChunk {
    chunk: Arc<Chunk>,
    subscribers: FxHashSet<ClientId>,
    idle_since: Option<Instant>,
}

/// A generation in progress; followers park on `ready` until the leader
/// publishes the outcome.
#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl InFlight {
    fn publish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            self.ready.wait(&mut outcome);
        }
        outcome.clone().unwrap_or(Err(GenerationError::WorkerUnavailable))
    }
}

enum Claim {
    Loaded(Arc<Chunk>),
    Leader(Arc<InFlight>),
    Follower(Arc<InFlight>),
}

pub struct ChunkStore {
    source: Arc<dyn ChunkSource>,
    pool: Option<GenerationPool>,
    archive: Option<ChunkArchive>,
    grace_period: Duration,
    chunks: Mutex<FxHashMap<ChunkCoord, StoredChunk>>,
    in_flight: Mutex<FxHashMap<ChunkCoord, Arc<InFlight>>>,
    load_listeners: Listeners<ChunkLoadEvent>,
    generated: AtomicU64,
}

impl ChunkStore {
    pub fn new(source: Arc<dyn ChunkSource>, grace_period: Duration) -> Self {
        Self {
            source,
            pool: None,
            archive: None,
            grace_period,
            chunks: Mutex::new(FxHashMap::default()),
            in_flight: Mutex::new(FxHashMap::default()),
            load_listeners: Listeners::new(),
            generated: AtomicU64::new(0),
        }
    }

    /// Generate batch misses on `pool` instead of the calling thread.
    pub fn with_pool(mut self, pool: GenerationPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Write evicted chunks to `archive` and restore them on later misses.
    pub fn with_archive(mut self, archive: ChunkArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn chunk_size(&self) -> u16 {
        self.source.chunk_size()
    }

    pub fn seed(&self) -> u64 {
        self.source.seed()
    }

    pub fn subscribe_load_events(&self, capacity: usize) -> Receiver<ChunkLoadEvent> {
        self.load_listeners.subscribe(capacity)
    }

    /// Subscribe `client` to the chunk, generating it first if absent.
    pub fn acquire(&self, chunk_x: i32, chunk_y: i32, client: ClientId) -> Outcome {
        let coord = ChunkCoord::new(chunk_x, chunk_y);
        match self.claim(coord, client) {
            Claim::Loaded(chunk) => Ok(chunk),
            Claim::Leader(slot) => {
                let (result, origin) = self.load_or_generate(coord);
                self.finish(coord, client, &slot, result, origin)
            }
            Claim::Follower(slot) => self.follow(coord, client, &slot),
        }
    }

    /// Batch form of [`acquire`](Self::acquire). Misses are generated in
    /// parallel when a pool is attached; outcomes keep the order of `coords`.
    pub fn acquire_many(
        &self,
        coords: &[ChunkCoord],
        client: ClientId,
    ) -> Vec<(ChunkCoord, Outcome)> {
        let mut outcomes: Vec<Option<Outcome>> = vec![None; coords.len()];
        let mut leaders = Vec::new();
        let mut followers = Vec::new();

        for (i, &coord) in coords.iter().enumerate() {
            match self.claim(coord, client) {
                Claim::Loaded(chunk) => outcomes[i] = Some(Ok(chunk)),
                Claim::Leader(slot) => leaders.push((i, coord, slot)),
                Claim::Follower(slot) => followers.push((i, coord, slot)),
            }
        }

        // Archive hits skip generation entirely
        let mut to_generate = Vec::new();
        for (i, coord, slot) in leaders {
            match self.restore(coord) {
                Some(chunk) => {
                    outcomes[i] = Some(self.finish(coord, client, &slot, Ok(chunk), LoadOrigin::Archive));
                }
                None => to_generate.push((i, coord, slot)),
            }
        }

        let generated: Vec<Result<Chunk, GenerationError>> = match &self.pool {
            Some(pool) if to_generate.len() > 1 => {
                let batch: Vec<ChunkCoord> = to_generate.iter().map(|(_, c, _)| *c).collect();
                self.generated
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                pool.generate_batch(&batch)
                    .into_iter()
                    .map(|outcome| outcome.result)
                    .collect()
            }
            _ => to_generate
                .iter()
                .map(|(_, coord, _)| self.generate(*coord))
                .collect(),
        };

        for ((i, coord, slot), result) in to_generate.into_iter().zip(generated) {
            outcomes[i] = Some(self.finish(coord, client, &slot, result, LoadOrigin::Generated));
        }

        // Our own leaders are published by now, so waiting cannot deadlock
        for (i, coord, slot) in followers {
            outcomes[i] = Some(self.follow(coord, client, &slot));
        }

        coords
            .iter()
            .zip(outcomes)
            .map(|(&coord, outcome)| {
                (
                    coord,
                    outcome.unwrap_or(Err(GenerationError::WorkerUnavailable)),
                )
            })
            .collect()
    }

    /// Remove `client` from the chunk's subscribers. Returns whether it was
    /// subscribed; repeated releases are no-ops.
    pub fn release(&self, chunk_x: i32, chunk_y: i32, client: ClientId) -> bool {
        let coord = ChunkCoord::new(chunk_x, chunk_y);
        let mut chunks = self.chunks.lock();
        let Some(stored) = chunks.get_mut(&coord) else {
            return false;
        };
        let removed = stored.subscribers.remove(&client);
        if removed && stored.subscribers.is_empty() {
            stored.idle_since = Some(Instant::now());
            debug!(%coord, "chunk idle");
        }
        removed
    }

    /// Release every chunk that lists `client`. Returns how many were released.
    pub fn release_all(&self, client: ClientId) -> usize {
        let now = Instant::now();
        let mut released = 0;
        let mut chunks = self.chunks.lock();
        for stored in chunks.values_mut() {
            if stored.subscribers.remove(&client) {
                released += 1;
                if stored.subscribers.is_empty() {
                    stored.idle_since = Some(now);
                }
            }
        }
        released
    }

    /// Drop chunks that have had no subscribers for at least the grace
    /// period. Returns the evicted coordinates.
    pub fn evict_idle(&self, now: Instant) -> Vec<ChunkCoord> {
        let grace = self.grace_period;
        let mut evicted = Vec::new();
        {
            let mut chunks = self.chunks.lock();
            chunks.retain(|coord, stored| {
                let expired = stored.subscribers.is_empty()
                    && stored
                        .idle_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= grace);
                if expired {
                    evicted.push((*coord, Arc::clone(&stored.chunk)));
                }
                !expired
            });
        }

        if let Some(archive) = &self.archive {
            for (coord, chunk) in &evicted {
                if let Err(e) = archive.store(chunk) {
                    warn!(%coord, error = %e, "failed to archive evicted chunk");
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted idle chunks");
        }
        evicted.into_iter().map(|(coord, _)| coord).collect()
    }

    /// Write every loaded chunk to the archive, if one is attached.
    pub fn flush_archive(&self) -> usize {
        let Some(archive) = &self.archive else {
            return 0;
        };
        let snapshot: Vec<Arc<Chunk>> = self
            .chunks
            .lock()
            .values()
            .map(|stored| Arc::clone(&stored.chunk))
            .collect();

        let mut written = 0;
        for chunk in snapshot {
            match archive.store(&chunk) {
                Ok(()) => written += 1,
                Err(e) => warn!(coord = %chunk.coord(), error = %e, "failed to archive chunk"),
            }
        }
        info!(written, dir = %archive.dir().display(), "archived loaded chunks");
        written
    }

    pub fn get(&self, chunk_x: i32, chunk_y: i32) -> Option<Arc<Chunk>> {
        self.chunks
            .lock()
            .get(&ChunkCoord::new(chunk_x, chunk_y))
            .map(|stored| Arc::clone(&stored.chunk))
    }

    pub fn is_loaded(&self, chunk_x: i32, chunk_y: i32) -> bool {
        self.chunks
            .lock()
            .contains_key(&ChunkCoord::new(chunk_x, chunk_y))
    }

    pub fn loaded_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn subscriber_count(&self, chunk_x: i32, chunk_y: i32) -> usize {
        self.chunks
            .lock()
            .get(&ChunkCoord::new(chunk_x, chunk_y))
            .map_or(0, |stored| stored.subscribers.len())
    }

    pub fn subscribers(&self, chunk_x: i32, chunk_y: i32) -> Vec<ClientId> {
        let mut subscribers: Vec<ClientId> = self
            .chunks
            .lock()
            .get(&ChunkCoord::new(chunk_x, chunk_y))
            .map(|stored| stored.subscribers.iter().copied().collect())
            .unwrap_or_default();
        subscribers.sort_unstable();
        subscribers
    }

    /// Coordinates of every loaded chunk that lists `client`.
    pub fn subscriptions_of(&self, client: ClientId) -> Vec<ChunkCoord> {
        self.chunks
            .lock()
            .iter()
            .filter(|(_, stored)| stored.subscribers.contains(&client))
            .map(|(coord, _)| *coord)
            .collect()
    }

    /// Number of times the source has been asked to generate a chunk.
    pub fn generation_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    fn claim(&self, coord: ChunkCoord, client: ClientId) -> Claim {
        let mut in_flight = self.in_flight.lock();
        {
            let mut chunks = self.chunks.lock();
            if let Some(stored) = chunks.get_mut(&coord) {
                stored.subscribers.insert(client);
                stored.idle_since = None;
                return Claim::Loaded(Arc::clone(&stored.chunk));
            }
        }
        if let Some(slot) = in_flight.get(&coord) {
            return Claim::Follower(Arc::clone(slot));
        }
        let slot = Arc::new(InFlight::default());
        in_flight.insert(coord, Arc::clone(&slot));
        Claim::Leader(slot)
    }

    fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError> {
        self.generated.fetch_add(1, Ordering::Relaxed);
        self.source.generate(coord)
    }

    fn restore(&self, coord: ChunkCoord) -> Option<Chunk> {
        let archive = self.archive.as_ref()?;
        match archive.load(coord) {
            Ok(Some(chunk)) if chunk.size() == self.source.chunk_size() => Some(chunk),
            Ok(Some(_)) => {
                warn!(%coord, "archived chunk has a different size, regenerating");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%coord, error = %e, "unreadable archived chunk, regenerating");
                None
            }
        }
    }

    fn load_or_generate(&self, coord: ChunkCoord) -> (Result<Chunk, GenerationError>, LoadOrigin) {
        match self.restore(coord) {
            Some(chunk) => (Ok(chunk), LoadOrigin::Archive),
            None => (self.generate(coord), LoadOrigin::Generated),
        }
    }

    /// Leader side: install the chunk, retire the in-flight entry, wake
    /// followers and notify listeners.
    fn finish(
        &self,
        coord: ChunkCoord,
        client: ClientId,
        slot: &InFlight,
        result: Result<Chunk, GenerationError>,
        origin: LoadOrigin,
    ) -> Outcome {
        let outcome = result.map(Arc::new);
        {
            let mut in_flight = self.in_flight.lock();
            if let Ok(chunk) = &outcome {
                let mut subscribers = FxHashSet::default();
                subscribers.insert(client);
                self.chunks.lock().insert(
                    coord,
                    StoredChunk {
                        chunk: Arc::clone(chunk),
                        subscribers,
                        idle_since: None,
                    },
                );
            }
            in_flight.remove(&coord);
        }
        slot.publish(outcome.clone());

        match &outcome {
            Ok(_) => {
                debug!(%coord, ?origin, "chunk loaded");
                self.load_listeners.publish(&ChunkLoadEvent {
                    chunk_x: coord.x,
                    chunk_y: coord.y,
                    origin,
                });
            }
            Err(e) => warn!(%coord, error = %e, "chunk generation failed"),
        }
        outcome
    }

    /// Follower side: wait for the leader, then subscribe to its result.
    fn follow(&self, coord: ChunkCoord, client: ClientId, slot: &InFlight) -> Outcome {
        let chunk = slot.wait()?;
        let mut chunks = self.chunks.lock();
        let stored = chunks.entry(coord).or_insert_with(|| StoredChunk {
            // evicted between publish and now; reinstall the same data
            chunk: Arc::clone(&chunk),
            subscribers: FxHashSet::default(),
            idle_since: None,
        });
        stored.subscribers.insert(client);
        stored.idle_since = None;
        Ok(Arc::clone(&stored.chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use crate::config::default_biomes;
    use crate::core::BiomeRegistry;
    use crate::world::biome_field::BiomeField;
    use crate::world::generator::ChunkGenerator;

    /// Wraps the real generator, counting calls and slowing each one down so
    /// concurrent callers overlap.
    struct Counting {
        inner: ChunkGenerator,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ChunkSource for Counting {
        fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.inner.generate(coord)
        }

        fn seed(&self) -> u64 {
            self.inner.seed()
        }

        fn chunk_size(&self) -> u16 {
            self.inner.chunk_size()
        }
    }

    fn counting(seed: u64, delay: Duration) -> Arc<Counting> {
        let registry = Arc::new(BiomeRegistry::from_table(&default_biomes()).unwrap());
        let mut field = BiomeField::new(registry, 4);
        field.init_with_seed(seed);
        Arc::new(Counting {
            inner: ChunkGenerator::new(Arc::new(field), 16).unwrap(),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn store(source: Arc<Counting>, grace: Duration) -> ChunkStore {
        ChunkStore::new(source, grace)
    }

    #[test]
    fn test_acquire_generates_once_and_emits_event() {
        let source = counting(42, Duration::ZERO);
        let store = store(source.clone(), Duration::from_secs(30));
        let events = store.subscribe_load_events(8);

        let a = store.acquire(0, 0, 1).unwrap();
        let b = store.acquire(0, 0, 2).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscribers(0, 0), vec![1, 2]);
        let event = events.try_recv().unwrap();
        assert_eq!(event.coord(), ChunkCoord::new(0, 0));
        assert_eq!(event.origin, LoadOrigin::Generated);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_acquire_collapses_to_one_generation() {
        const CALLERS: usize = 8;
        let source = counting(42, Duration::from_millis(50));
        let store = store(source.clone(), Duration::from_secs(30));
        let barrier = Barrier::new(CALLERS);

        let results: Vec<Arc<Chunk>> = thread::scope(|s| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|i| {
                    let store = &store;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        store.acquire(5, 5, i as ClientId).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.subscriber_count(5, 5), CALLERS);
        for chunk in &results {
            assert_eq!(chunk.tiles(), results[0].tiles());
        }
    }

    #[test]
    fn test_two_clients_same_chunk_before_it_exists() {
        let source = counting(42, Duration::from_millis(20));
        let store = store(source.clone(), Duration::from_secs(30));

        let (a, b) = thread::scope(|s| {
            let first = s.spawn(|| store.acquire(5, 5, 1).unwrap());
            let second = s.spawn(|| store.acquire(5, 5, 2).unwrap());
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_eq!(a.tiles(), b.tiles());
        assert_eq!(store.subscriber_count(5, 5), 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_release_never_goes_negative() {
        let store = store(counting(1, Duration::ZERO), Duration::from_secs(30));
        store.acquire(0, 0, 1).unwrap();
        store.acquire(0, 0, 2).unwrap();

        assert!(store.release(0, 0, 1));
        assert!(!store.release(0, 0, 1));
        assert!(!store.release(0, 0, 99));
        assert!(!store.release(7, 7, 1));
        assert_eq!(store.subscriber_count(0, 0), 1);

        assert!(store.release(0, 0, 2));
        assert!(!store.release(0, 0, 2));
        assert_eq!(store.subscriber_count(0, 0), 0);
        assert!(store.is_loaded(0, 0));
    }

    #[test]
    fn test_eviction_respects_grace_period() {
        let grace = Duration::from_secs(30);
        let store = store(counting(1, Duration::ZERO), grace);
        store.acquire(1, 1, 1).unwrap();
        store.acquire(2, 2, 1).unwrap();
        store.release(1, 1, 1);

        let released_at = Instant::now();
        assert!(store.evict_idle(released_at).is_empty());
        assert!(store.evict_idle(released_at + grace / 2).is_empty());

        // Idle for exactly the grace period is enough
        assert_eq!(
            store.evict_idle(released_at + grace),
            vec![ChunkCoord::new(1, 1)]
        );
        assert!(!store.is_loaded(1, 1));

        // Subscribed chunks survive no matter how old
        assert!(store.evict_idle(released_at + grace * 1000).is_empty());
        assert!(store.is_loaded(2, 2));
    }

    #[test]
    fn test_reacquire_cancels_idle_clock() {
        let grace = Duration::from_secs(5);
        let source = counting(1, Duration::ZERO);
        let store = store(source.clone(), grace);
        store.acquire(0, 0, 1).unwrap();
        store.release(0, 0, 1);
        store.acquire(0, 0, 2).unwrap();

        assert!(store.evict_idle(Instant::now() + grace * 10).is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_all() {
        let store = store(counting(1, Duration::ZERO), Duration::from_secs(1));
        for x in 0..3 {
            store.acquire(x, 0, 7).unwrap();
        }
        store.acquire(0, 0, 8).unwrap();

        assert_eq!(store.release_all(7), 3);
        assert!(store.subscriptions_of(7).is_empty());
        assert_eq!(store.subscriptions_of(8), vec![ChunkCoord::new(0, 0)]);
        assert_eq!(store.release_all(7), 0);
    }

    #[test]
    fn test_acquire_many_with_pool() {
        let source = counting(42, Duration::from_millis(5));
        let pool = GenerationPool::with_worker_count(4, source.clone()).unwrap();
        let store = ChunkStore::new(source.clone(), Duration::from_secs(30)).with_pool(pool);
        let coords = ChunkCoord::new(0, 0).neighborhood(1);

        let first = store.acquire_many(&coords, 1);
        let second = store.acquire_many(&coords, 2);

        assert_eq!(source.calls.load(Ordering::SeqCst), 9);
        assert_eq!(store.generation_count(), 9);
        for ((coord, a), (_, b)) in first.iter().zip(&second) {
            let (a, b) = (a.as_ref().unwrap(), b.as_ref().unwrap());
            assert_eq!(a.coord(), *coord);
            assert!(Arc::ptr_eq(a, b));
            assert_eq!(store.subscriber_count(coord.x, coord.y), 2);
        }
    }

    #[test]
    fn test_matches_direct_generation() {
        let source = counting(42, Duration::ZERO);
        let store = store(source.clone(), Duration::from_secs(30));
        let stored = store.acquire(-3, 8, 1).unwrap();
        let direct = source.inner.generate_chunk(-3, 8).unwrap();
        assert_eq!(stored.tiles(), direct.tiles());
    }

    #[test]
    fn test_archive_restores_evicted_chunks() {
        let dir = std::env::temp_dir().join(format!("tileworld-store-{}", std::process::id()));
        let source = counting(42, Duration::ZERO);
        let archive = ChunkArchive::open(&dir, 42).unwrap();
        let store = ChunkStore::new(source.clone(), Duration::ZERO).with_archive(archive);
        let events = store.subscribe_load_events(8);

        let original = store.acquire(4, 4, 1).unwrap();
        store.release(4, 4, 1);
        assert_eq!(store.evict_idle(Instant::now()), vec![ChunkCoord::new(4, 4)]);

        let restored = store.acquire(4, 4, 1).unwrap();
        assert_eq!(original.tiles(), restored.tiles());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.try_recv().unwrap().origin, LoadOrigin::Generated);
        assert_eq!(events.try_recv().unwrap().origin, LoadOrigin::Archive);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_corrupt_archive_file_is_regenerated() {
        let dir = std::env::temp_dir().join(format!("tileworld-corrupt-{}", std::process::id()));
        let source = counting(42, Duration::ZERO);
        let archive = ChunkArchive::open(&dir, 42).unwrap();
        let mut header = b"TWCH".to_vec();
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        std::fs::write(dir.join("c.0.0.chunk"), header).unwrap();
        let store = ChunkStore::new(source.clone(), Duration::ZERO).with_archive(archive);

        let chunk = store.acquire(0, 0, 1).unwrap();
        assert_eq!(chunk.tiles(), source.inner.generate_chunk(0, 0).unwrap().tiles());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
