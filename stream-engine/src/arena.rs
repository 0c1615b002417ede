//! Generational stream storage owned by one worker.
//!
//! Streams live in slots and are addressed by [`StreamKey`]s.  A key names
//! its worker, its slot and the slot's generation at allocation time, so a
//! key that outlives its stream (or crosses to another worker) is rejected
//! instead of reaching a recycled stream.  Released slots keep their
//! [`Stream`] allocation and are handed out again by the next
//! [`Arena::allocate`].

use std::fmt;

use crate::error::StreamError;
use crate::stream::Stream;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u16);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Handle to a stream inside one worker's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    worker: WorkerId,
    slot: u32,
    generation: u32,
}

impl StreamKey {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Key of a stream that has not been placed in an arena.  No arena
    /// resolves it.
    pub(crate) fn unbound() -> Self {
        Self {
            worker: WorkerId(u16::MAX),
            slot: u32::MAX,
            generation: u32::MAX,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(slot: u32) -> Self {
        Self {
            worker: WorkerId(0),
            slot,
            generation: 0,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.worker, self.slot, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    generation: u32,
    live: bool,
    stream: Stream,
}

#[derive(Debug)]
pub struct Arena {
    worker: WorkerId,
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
    limit: usize,
}

impl Arena {
    pub fn new(worker: WorkerId, limit: usize) -> Self {
        Self {
            worker,
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
        }
    }

    /// Claim a slot, reusing a pooled stream when one is available.
    ///
    /// The returned stream is in its pooled state; `make` builds a fresh one
    /// only when the pool is empty.
    pub fn allocate(
        &mut self,
        make: impl FnOnce() -> Stream,
    ) -> Result<(StreamKey, &mut Stream), StreamError> {
        if self.live >= self.limit {
            return Err(StreamError::TooManyStreams(self.limit));
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.entries.len())
                    .map_err(|_| StreamError::TooManyStreams(self.limit))?;
                self.entries.push(Entry {
                    generation: 0,
                    live: false,
                    stream: make(),
                });
                slot
            }
        };
        let entry = &mut self.entries[slot as usize];
        entry.live = true;
        self.live += 1;
        let key = StreamKey {
            worker: self.worker,
            slot,
            generation: entry.generation,
        };
        Ok((key, &mut entry.stream))
    }

    pub fn get(&self, key: StreamKey) -> Result<&Stream, StreamError> {
        self.check_worker(key)?;
        match self.entries.get(key.slot as usize) {
            Some(e) if e.live && e.generation == key.generation => Ok(&e.stream),
            _ => Err(StreamError::StaleStream),
        }
    }

    pub fn get_mut(&mut self, key: StreamKey) -> Result<&mut Stream, StreamError> {
        self.check_worker(key)?;
        match self.entries.get_mut(key.slot as usize) {
            Some(e) if e.live && e.generation == key.generation => Ok(&mut e.stream),
            _ => Err(StreamError::StaleStream),
        }
    }

    /// Return the slot to the pool.  The caller resets the stream first.
    pub fn release(&mut self, key: StreamKey) -> Result<(), StreamError> {
        self.check_worker(key)?;
        match self.entries.get_mut(key.slot as usize) {
            Some(e) if e.live && e.generation == key.generation => {
                e.live = false;
                e.generation = e.generation.wrapping_add(1);
                self.free.push(key.slot);
                self.live -= 1;
                Ok(())
            }
            _ => Err(StreamError::StaleStream),
        }
    }

    /// Keys of every live stream, in slot order.
    pub fn keys(&self) -> Vec<StreamKey> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(slot, e)| StreamKey {
                worker: self.worker,
                slot: slot as u32,
                generation: e.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Streams held for reuse.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    fn check_worker(&self, key: StreamKey) -> Result<(), StreamError> {
        if key.worker == self.worker {
            Ok(())
        } else {
            Err(StreamError::WrongWorker {
                owner: key.worker,
                worker: self.worker,
            })
        }
    }
}
