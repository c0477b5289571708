//! FrameCache actor - fixed pool of reusable frame blocks
//!
//! Blocks live in an arena indexed by slot and are allocated once. A block
//! holds `block_size` consecutive frames sharing a base sequence number and
//! cycles `Empty -> Fetching -> InUse/Cache -> (reclaimed) -> Fetching`.
//!
//! Invariants (all state is owned by the cache thread):
//! - a block is evictable iff `usage == 0` and it is not fetching
//! - at most one block maps to a base (`index`)
//! - replies leave in request order: a hit never overtakes a queued miss
//!
//! Eviction takes the front of `evictable`, an `IndexSet` kept in release
//! order. Equal release instants resolve by insertion order.
//!
//! The fetcher decodes one block at a time, so fetches are dispatched one at
//! a time from `backlog`. A request from a newer epoch supersedes older ones:
//! their queued requests give their usage back and their undispatched
//! fetches are cancelled, so abandoned windows never pin the pool.
//!
//! Frames leave the cache as [`CachedFrame`] leases. Dropping a lease sends
//! its usage units back as [`Recycle`]; the generation in the token makes
//! recycles for a reclaimed block harmless.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{debug, info, trace, warn};

use super::actor::{Actor, Context, Recipient};
use super::fetcher::{FetchFrames, FetchedBlock};
use crate::config::EngineConfig;
use crate::entities::Frame;
use crate::error::{EngineError, Result};

/// Cache sizing
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub block_size: usize,
    pub n_blocks: usize,
    /// Below this many evictable blocks, opportunistic misses are benched
    pub min_reserve: usize,
    /// Benched request is retried once this many blocks are evictable
    pub max_reserve: usize,
    pub idle: Duration,
}

impl From<&EngineConfig> for CacheConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            block_size: config.block_size,
            n_blocks: config.n_cache_blocks,
            min_reserve: config.cache_min_reserve,
            max_reserve: config.cache_max_reserve,
            idle: Duration::from_millis(config.cache_idle_ms),
        }
    }
}

/// Request for the frame at `seq`
pub struct FrameRequest {
    pub seq: u64,
    /// Usage units the reply carries
    pub usage: u32,
    /// May be deferred instead of forcing an eviction
    pub opportunistic: bool,
    /// Echoed in the reply
    pub epoch: u64,
    pub reply: Recipient<CachedFrame>,
}

impl fmt::Debug for FrameRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRequest")
            .field("seq", &self.seq)
            .field("usage", &self.usage)
            .field("opportunistic", &self.opportunistic)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Identifies one incarnation of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockToken {
    pub slot: usize,
    pub generation: u64,
}

/// Return `units` of usage to a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recycle {
    pub token: BlockToken,
    pub units: u32,
}

struct Lease {
    token: BlockToken,
    units: u32,
    recycler: Recipient<Recycle>,
}

/// A frame on loan from the cache.
///
/// Holds `units` of its block's usage. Dropping it returns them. The frame
/// `Arc` is released before the recycle is sent so the cache can refill
/// the buffer in place once the block is reclaimed.
pub struct CachedFrame {
    pub seq: u64,
    pub epoch: u64,
    frame: Option<Arc<Frame>>,
    lease: Option<Lease>,
}

impl CachedFrame {
    /// Frame outside any cache (tests, still images)
    pub fn detached(seq: u64, epoch: u64, frame: Arc<Frame>) -> Self {
        Self { seq, epoch, frame: Some(frame), lease: None }
    }

    pub fn frame(&self) -> &Frame {
        // Only `Drop` takes the Arc
        self.frame.as_deref().unwrap_or(&EMPTY_FRAME)
    }

    pub fn units(&self) -> u32 {
        self.lease.as_ref().map_or(0, |l| l.units)
    }

    /// Split one usage unit off into a second lease.
    ///
    /// With fewer than two units the copy carries none and only keeps the
    /// frame alive.
    pub fn share(&mut self) -> CachedFrame {
        let lease = match self.lease.as_mut() {
            Some(lease) if lease.units >= 2 => {
                lease.units -= 1;
                Some(Lease { token: lease.token, units: 1, recycler: lease.recycler.clone() })
            }
            _ => None,
        };
        CachedFrame { seq: self.seq, epoch: self.epoch, frame: self.frame.clone(), lease }
    }

    /// Give the usage back now
    pub fn recycle(self) {}
}

static EMPTY_FRAME: Frame = Frame {
    seq: 0,
    timestamp_ms: 0,
    end_of_media: false,
    audio: Vec::new(),
    picture: crate::entities::Picture { width: 0, height: 0, pixels: Vec::new() },
};

impl Drop for CachedFrame {
    fn drop(&mut self) {
        drop(self.frame.take());
        if let Some(lease) = self.lease.take()
            && lease.units > 0
        {
            lease.recycler.send(Recycle { token: lease.token, units: lease.units });
        }
    }
}

impl fmt::Debug for CachedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFrame")
            .field("seq", &self.seq)
            .field("epoch", &self.epoch)
            .field("units", &self.units())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Fetching,
    Cache,
    InUse,
}

struct CacheBlock {
    base: Option<u64>,
    state: BlockState,
    usage: u32,
    generation: u64,
    released_at: Option<Instant>,
    /// Empty while the buffers are lent to the fetcher
    frames: Vec<Arc<Frame>>,
}

impl CacheBlock {
    fn is_ready(&self) -> bool {
        matches!(self.state, BlockState::Cache | BlockState::InUse)
    }

    /// Take the buffers back for a refill, reusing unshared allocations
    fn take_buffers(&mut self, block_size: usize, spares: &mut Vec<Frame>) -> Vec<Frame> {
        let mut buffers: Vec<Frame> = self
            .frames
            .drain(..)
            .map(|arc| {
                Arc::try_unwrap(arc).unwrap_or_else(|_| {
                    debug!("Reclaimed frame still shared, allocating a new buffer");
                    Frame::empty()
                })
            })
            .collect();
        while buffers.len() < block_size {
            buffers.push(spares.pop().unwrap_or_default());
        }
        buffers
    }
}

/// Hit/miss counters, logged when the cache stops
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub benched: u64,
    pub evictions: u64,
    /// Fetches dropped before dispatch because their requests went stale
    pub cancelled: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

pub enum CacheMsg {
    Request(FrameRequest),
    Fetched(FetchedBlock),
    Recycle(Recycle),
    /// Requests older than this epoch are no longer wanted
    Supersede(u64),
}

/// Where the cache sends things
pub struct CacheLinks {
    /// Fetch commands (the fetcher's mailbox)
    pub fetch: Recipient<FetchFrames>,
    /// Fetch replies (own mailbox)
    pub fetched: Recipient<FetchedBlock>,
    /// Lease returns (own mailbox)
    pub recycler: Recipient<Recycle>,
    /// Buffers handed back at teardown for the next load
    pub spares_out: Option<Recipient<Vec<Frame>>>,
}

pub struct FrameCache {
    config: CacheConfig,
    blocks: Vec<CacheBlock>,
    index: HashMap<u64, usize>,
    /// Evictable slots, least recently released first
    evictable: IndexSet<usize>,
    pending: VecDeque<FrameRequest>,
    bench: Option<FrameRequest>,
    /// Fetching slots not yet sent to the fetcher
    backlog: VecDeque<usize>,
    in_flight: Option<usize>,
    /// Newest request epoch seen
    epoch: u64,
    /// Base the fetcher continues at without seeking
    next_fetch_base: Option<u64>,
    spares: Vec<Frame>,
    links: CacheLinks,
    stats: CacheStats,
}

impl FrameCache {
    pub fn new(config: CacheConfig, spares: Vec<Frame>, links: CacheLinks) -> Self {
        let blocks = (0..config.n_blocks)
            .map(|_| CacheBlock {
                base: None,
                state: BlockState::Empty,
                usage: 0,
                generation: 0,
                released_at: None,
                frames: Vec::new(),
            })
            .collect();
        debug!(
            "FrameCache created: {} blocks x {} frames, reserve {}..{}, {} spare buffers",
            config.n_blocks,
            config.block_size,
            config.min_reserve,
            config.max_reserve,
            spares.len()
        );
        Self {
            evictable: (0..config.n_blocks).collect(),
            blocks,
            index: HashMap::with_capacity(config.n_blocks),
            pending: VecDeque::new(),
            bench: None,
            backlog: VecDeque::new(),
            in_flight: None,
            epoch: 0,
            next_fetch_base: None,
            spares,
            links,
            stats: CacheStats::default(),
            config,
        }
    }

    fn base_of(&self, seq: u64) -> u64 {
        seq - seq % self.config.block_size as u64
    }

    /// Evictable or free blocks
    pub fn headroom(&self) -> usize {
        self.evictable.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn block_state(&self, base: u64) -> Option<(BlockState, u32)> {
        self.index.get(&base).map(|&slot| (self.blocks[slot].state, self.blocks[slot].usage))
    }

    pub fn is_evictable(&self, base: u64) -> bool {
        self.index.get(&base).is_some_and(|slot| self.evictable.contains(slot))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_bench(&self) -> bool {
        self.bench.is_some()
    }

    /// Blocks reclaimed and waiting for the fetcher
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn handle_request(&mut self, req: FrameRequest) -> Result<()> {
        if req.epoch < self.epoch {
            trace!("Request for seq {} from stale epoch {} dropped", req.seq, req.epoch);
            return Ok(());
        }
        self.supersede(req.epoch);

        let base = self.base_of(req.seq);
        trace!("Request seq {} (block {}, usage {}, opp {})", req.seq, base, req.usage, req.opportunistic);

        if let Some(&slot) = self.index.get(&base) {
            let block = &mut self.blocks[slot];
            block.usage += req.usage;
            if block.state == BlockState::Cache && block.usage > 0 {
                self.evictable.shift_remove(&slot);
                block.state = BlockState::InUse;
            }
            if block.is_ready() {
                self.stats.hits += 1;
            }
            if block.state == BlockState::Fetching || !self.pending.is_empty() {
                self.pending.push_back(req);
            } else {
                self.reply(slot, req);
            }
            return Ok(());
        }

        if req.opportunistic && self.headroom() < self.config.min_reserve {
            self.stats.benched += 1;
            if let Some(stale) = self.bench.replace(req) {
                trace!("Bench: seq {} replaced by newer request", stale.seq);
            }
            return Ok(());
        }

        self.stats.misses += 1;
        let slot = self.start_fetch(base, req.seq)?;
        self.blocks[slot].usage = req.usage;
        self.pending.push_back(req);
        Ok(())
    }

    /// Forget requests older than `epoch`.
    ///
    /// Their usage is returned, and reclaimed blocks nobody wants any more
    /// go back to the pool without being fetched.
    pub fn supersede(&mut self, epoch: u64) {
        if epoch <= self.epoch {
            return;
        }
        self.epoch = epoch;

        let (stale, current): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|req| req.epoch < epoch);
        self.pending = current;
        for req in &stale {
            if let Some(&slot) = self.index.get(&self.base_of(req.seq)) {
                self.release(slot, req.usage);
            }
        }
        if self.bench.as_ref().is_some_and(|req| req.epoch < epoch) {
            self.bench = None;
        }

        let blocks = &self.blocks;
        let mut unwanted = Vec::new();
        self.backlog.retain(|&slot| {
            let keep = blocks[slot].usage > 0;
            if !keep {
                unwanted.push(slot);
            }
            keep
        });
        for slot in unwanted {
            self.cancel_fetch(slot);
        }
        if !stale.is_empty() {
            debug!("Epoch {}: dropped {} stale requests", epoch, stale.len());
        }
        self.drain_pending();
    }

    /// Undo the reclaim of a block that was never sent to the fetcher
    fn cancel_fetch(&mut self, slot: usize) {
        let block = &mut self.blocks[slot];
        if let Some(base) = block.base.take() {
            self.index.remove(&base);
            trace!("Fetch of block {} cancelled", base);
        }
        block.state = BlockState::Empty;
        block.usage = 0;
        block.released_at = Some(Instant::now());
        // Free blocks go first
        self.evictable.shift_insert(0, slot);
        self.stats.cancelled += 1;
    }

    /// Reclaim the least recently released block and queue it for the fetcher
    fn start_fetch(&mut self, base: u64, requested_seq: u64) -> Result<usize> {
        let Some(slot) = self.evictable.shift_remove_index(0) else {
            return Err(EngineError::CacheExhausted { blocks: self.blocks.len(), requested_seq });
        };

        let block = &mut self.blocks[slot];
        if let Some(old) = block.base.take() {
            self.index.remove(&old);
            self.stats.evictions += 1;
            trace!("Evict block {} from slot {}", old, slot);
        }
        block.generation += 1;
        block.state = BlockState::Fetching;
        block.usage = 0;
        block.released_at = None;
        block.base = Some(base);
        self.index.insert(base, slot);

        self.backlog.push_back(slot);
        self.dispatch_fetch();
        Ok(slot)
    }

    /// Send the next queued block to the fetcher unless one is in flight
    fn dispatch_fetch(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        while let Some(slot) = self.backlog.pop_front() {
            let block = &mut self.blocks[slot];
            let (BlockState::Fetching, Some(base)) = (block.state, block.base) else {
                continue;
            };
            let buffers = block.take_buffers(self.config.block_size, &mut self.spares);

            let start = if self.next_fetch_base == Some(base) { None } else { Some(base) };
            self.next_fetch_base = Some(base + self.config.block_size as u64);

            debug!("Fetch block {} into slot {} (seek: {})", base, slot, start.is_some());
            self.in_flight = Some(slot);
            self.links.fetch.send(FetchFrames {
                slot,
                base,
                start,
                buffers,
                reply: self.links.fetched.clone(),
            });
            return;
        }
    }

    pub fn handle_fetched(&mut self, fetched: FetchedBlock) {
        let FetchedBlock { slot, base, buffers, ok } = fetched;
        if self.in_flight == Some(slot) {
            self.in_flight = None;
        }
        self.complete_fetch(slot, base, buffers, ok);
        self.dispatch_fetch();
    }

    fn complete_fetch(&mut self, slot: usize, base: u64, buffers: Vec<Frame>, ok: bool) {
        let Some(block) = self.blocks.get_mut(slot) else {
            warn!("Fetched block for unknown slot {}", slot);
            return;
        };
        if block.state != BlockState::Fetching || block.base != Some(base) {
            warn!("Unexpected fetch reply for block {} in slot {} ({:?})", base, slot, block.state);
            self.spares.extend(buffers);
            return;
        }

        block.frames = buffers.into_iter().map(Arc::new).collect();

        if !ok {
            warn!("Fetch of block {} failed, dropping its requests", base);
            block.state = BlockState::Empty;
            block.base = None;
            block.usage = 0;
            block.released_at = Some(Instant::now());
            self.index.remove(&base);
            self.evictable.insert(slot);
            self.next_fetch_base = None;

            let block_size = self.config.block_size as u64;
            self.pending.retain(|req| req.seq - req.seq % block_size != base);
        } else if block.usage == 0 {
            block.state = BlockState::Cache;
            block.released_at = Some(Instant::now());
            self.evictable.insert(slot);
        } else {
            block.state = BlockState::InUse;
        }

        self.drain_pending();
    }

    /// Reply to queued requests in order, stopping at the first not ready
    fn drain_pending(&mut self) {
        while let Some(req) = self.pending.front() {
            let base = self.base_of(req.seq);
            match self.index.get(&base) {
                Some(&slot) if self.blocks[slot].is_ready() => {
                    if let Some(req) = self.pending.pop_front() {
                        self.reply(slot, req);
                    }
                }
                Some(_) => break,
                None => {
                    warn!("Pending request for seq {} lost its block", req.seq);
                    self.pending.pop_front();
                }
            }
        }
    }

    fn reply(&mut self, slot: usize, req: FrameRequest) {
        let block = &self.blocks[slot];
        let base = block.base.unwrap_or_default();
        let offset = (req.seq - base) as usize;
        let Some(frame) = block.frames.get(offset) else {
            warn!("Block {} has no frame at offset {}", base, offset);
            return;
        };

        let lease = Lease {
            token: BlockToken { slot, generation: block.generation },
            units: req.usage,
            recycler: self.links.recycler.clone(),
        };
        let cached = CachedFrame {
            seq: req.seq,
            epoch: req.epoch,
            frame: Some(Arc::clone(frame)),
            lease: Some(lease),
        };
        trace!("Reply seq {} to {}", req.seq, req.reply.name());
        // An undeliverable reply drops the lease, which recycles itself
        req.reply.send(cached);
    }

    pub fn handle_recycle(&mut self, recycle: Recycle) {
        let Recycle { token, units } = recycle;
        let Some(block) = self.blocks.get_mut(token.slot) else {
            warn!("Recycle for unknown slot {}", token.slot);
            return;
        };
        if block.generation != token.generation {
            trace!("Recycle for reclaimed slot {} ignored", token.slot);
            return;
        }
        self.release(token.slot, units);
    }

    /// Return usage; a block nobody uses becomes evictable
    fn release(&mut self, slot: usize, units: u32) {
        let block = &mut self.blocks[slot];
        if units > block.usage {
            warn!(
                "Recycle of {} units exceeds usage {} of block {:?}",
                units, block.usage, block.base
            );
            block.usage = 0;
        } else {
            block.usage -= units;
        }
        if block.usage == 0 && block.state == BlockState::InUse {
            block.state = BlockState::Cache;
            block.released_at = Some(Instant::now());
            self.evictable.insert(slot);
        }
    }

    /// Retry the benched request once headroom has recovered
    pub fn admit_bench(&mut self) -> Result<()> {
        if self.bench.is_some() && self.headroom() >= self.config.max_reserve {
            if let Some(mut req) = self.bench.take() {
                debug!("Retrying benched request for seq {}", req.seq);
                req.opportunistic = false;
                return self.handle_request(req);
            }
        }
        Ok(())
    }

    /// Uniquely owned buffers for reuse by the next load
    fn collect_spares(&mut self) -> Vec<Frame> {
        let mut spares = std::mem::take(&mut self.spares);
        for block in &mut self.blocks {
            spares.extend(block.frames.drain(..).filter_map(|arc| Arc::try_unwrap(arc).ok()));
        }
        spares
    }
}

impl Actor for FrameCache {
    type Msg = CacheMsg;

    fn handle(&mut self, msg: CacheMsg, _ctx: &mut Context<CacheMsg>) -> Result<()> {
        match msg {
            CacheMsg::Request(req) => self.handle_request(req),
            CacheMsg::Fetched(fetched) => {
                self.handle_fetched(fetched);
                Ok(())
            }
            CacheMsg::Recycle(recycle) => {
                self.handle_recycle(recycle);
                Ok(())
            }
            CacheMsg::Supersede(epoch) => {
                self.supersede(epoch);
                Ok(())
            }
        }
    }

    fn idle_timeout(&self) -> Option<Duration> {
        Some(self.config.idle)
    }

    fn idle(&mut self, _ctx: &mut Context<CacheMsg>) -> Result<()> {
        self.admit_bench()
    }

    fn stopped(&mut self) {
        self.pending.clear();
        self.bench = None;
        self.backlog.clear();
        let spares = self.collect_spares();
        info!(
            "FrameCache stopped: {} hits, {} misses ({:.1}% hit rate), {} evictions, {} benched, {} cancelled",
            self.stats.hits,
            self.stats.misses,
            self.stats.hit_rate() * 100.0,
            self.stats.evictions,
            self.stats.benched,
            self.stats.cancelled
        );
        if let Some(out) = self.links.spares_out.take()
            && !spares.is_empty()
        {
            debug!("Returning {} frame buffers", spares.len());
            out.send(spares);
        }
    }
}
