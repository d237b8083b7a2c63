//! Background chunk generation worker pool
//!
//! Generation is pure and keyed only by coordinates, so a batch of misses can
//! be spread over worker threads. Uses crossbeam channels for the job queue
//! and for each batch's replies.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use tracing::{debug, warn};

use crate::constants::GENERATION_QUEUE_CAPACITY;
use crate::core::{Chunk, ChunkCoord};
use crate::error::GenerationError;
use crate::world::generator::ChunkSource;

struct GenerationJob {
    coord: ChunkCoord,
    reply: Sender<GenerationOutcome>,
}

/// Result of background chunk generation
pub struct GenerationOutcome {
    pub coord: ChunkCoord,
    pub result: Result<Chunk, GenerationError>,
}

/// Fixed set of worker threads sharing one [`ChunkSource`].
pub struct GenerationPool {
    request_tx: Option<Sender<GenerationJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl GenerationPool {
    /// One worker per CPU.
    pub fn new(source: Arc<dyn ChunkSource>) -> io::Result<Self> {
        Self::with_worker_count(num_cpus::get().max(1), source)
    }

    pub fn with_worker_count(num_workers: usize, source: Arc<dyn ChunkSource>) -> io::Result<Self> {
        // Bounded channel keeps a burst of requests from growing memory
        let (request_tx, request_rx) = bounded::<GenerationJob>(GENERATION_QUEUE_CAPACITY);
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers.max(1) {
            let rx = request_rx.clone();
            let source = Arc::clone(&source);

            let handle = thread::Builder::new()
                .name(format!("chunk-gen-{}", worker_id))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let result = source.generate(job.coord);
                        // The requester may have given up; nothing to do then
                        let _ = job.reply.send(GenerationOutcome {
                            coord: job.coord,
                            result,
                        });
                    }
                    debug!(worker_id, "chunk generation worker exiting");
                })?;
            workers.push(handle);
        }

        Ok(GenerationPool {
            request_tx: Some(request_tx),
            workers,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Generate every coordinate in parallel and block until all finish.
    /// Outcomes come back in request order; `coords` must not repeat.
    pub fn generate_batch(&self, coords: &[ChunkCoord]) -> Vec<GenerationOutcome> {
        let (reply_tx, reply_rx) = bounded(coords.len().max(1));
        let mut submitted = 0;

        if let Some(request_tx) = &self.request_tx {
            for &coord in coords {
                let job = GenerationJob {
                    coord,
                    reply: reply_tx.clone(),
                };
                if request_tx.send(job).is_err() {
                    break;
                }
                submitted += 1;
            }
        }
        // Only the workers hold reply senders from here on
        drop(reply_tx);

        let mut finished: HashMap<ChunkCoord, Result<Chunk, GenerationError>> =
            HashMap::with_capacity(submitted);
        for _ in 0..submitted {
            match reply_rx.recv() {
                Ok(outcome) => {
                    finished.insert(outcome.coord, outcome.result);
                }
                Err(_) => {
                    warn!("generation workers stopped before finishing a batch");
                    break;
                }
            }
        }

        coords
            .iter()
            .map(|&coord| GenerationOutcome {
                coord,
                result: finished
                    .remove(&coord)
                    .unwrap_or(Err(GenerationError::WorkerUnavailable)),
            })
            .collect()
    }
}

impl Drop for GenerationPool {
    fn drop(&mut self) {
        // Closing the queue lets every worker fall out of its loop
        self.request_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flat {
        calls: AtomicUsize,
    }

    impl ChunkSource for Flat {
        fn generate(&self, coord: ChunkCoord) -> Result<Chunk, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if coord.x == i32::MIN {
                return Err(GenerationError::UnknownBiome(0));
            }
            let mut chunk = Chunk::new(coord, 2);
            chunk.set_tile(0, 0, coord.x as u16);
            Ok(chunk)
        }

        fn seed(&self) -> u64 {
            0
        }

        fn chunk_size(&self) -> u16 {
            2
        }
    }

    #[test]
    fn test_batch_preserves_request_order() {
        let source = Arc::new(Flat {
            calls: AtomicUsize::new(0),
        });
        let pool = GenerationPool::with_worker_count(3, source.clone()).unwrap();
        let coords: Vec<ChunkCoord> = (0..20).map(|x| ChunkCoord::new(x, 1)).collect();

        let outcomes = pool.generate_batch(&coords);

        assert_eq!(pool.worker_count(), 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 20);
        for (outcome, coord) in outcomes.iter().zip(&coords) {
            assert_eq!(outcome.coord, *coord);
            let chunk = outcome.result.as_ref().unwrap();
            assert_eq!(chunk.get_tile(0, 0), Some(coord.x as u16));
        }
    }

    #[test]
    fn test_failures_stay_per_coordinate() {
        let source = Arc::new(Flat {
            calls: AtomicUsize::new(0),
        });
        let pool = GenerationPool::with_worker_count(2, source).unwrap();
        let coords = [ChunkCoord::new(1, 0), ChunkCoord::new(i32::MIN, 0)];

        let outcomes = pool.generate_batch(&coords);

        assert!(outcomes[0].result.is_ok());
        assert_eq!(
            outcomes[1].result.as_ref().err(),
            Some(&GenerationError::UnknownBiome(0))
        );
    }

    #[test]
    fn test_empty_batch() {
        let source = Arc::new(Flat {
            calls: AtomicUsize::new(0),
        });
        let pool = GenerationPool::with_worker_count(1, source).unwrap();
        assert!(pool.generate_batch(&[]).is_empty());
    }
}
