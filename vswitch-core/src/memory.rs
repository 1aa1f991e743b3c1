use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::packet::{Mbuf, PKTMBUF_HEADROOM};
use crate::Result;

pub const MEMPOOL_NAME_MAX_LEN: usize = 32;

const DEFAULT_MBUF_SIZE: u32 = 2048 + PKTMBUF_HEADROOM as u32;
const DEFAULT_NB_MBUFS: u32 = 8192;
const DEFAULT_CACHE_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub nb_mbufs: u32,
    pub mbuf_sz: u32,
    pub cache_sz: u32,
    pub numa_node: i32,
}

impl PoolConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nb_mbufs: DEFAULT_NB_MBUFS,
            mbuf_sz: DEFAULT_MBUF_SIZE,
            cache_sz: DEFAULT_CACHE_SIZE,
            numa_node: 0,
        }
    }
}

/// A bounded pool of packet buffers.
///
/// Handles are cheap to clone and may be shared between cores; every
/// [`Mbuf`] keeps its pool alive and returns its buffer on drop.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Vec<u8>>,
    in_use: u32,
}

impl MemoryPool {
    pub fn create(config: PoolConfig) -> Result<Self> {
        if config.name.is_empty() || config.name.len() >= MEMPOOL_NAME_MAX_LEN {
            return Err(Error::invalid(format!("mempool name '{}'", config.name)));
        }
        if config.nb_mbufs == 0 || config.mbuf_sz as usize <= PKTMBUF_HEADROOM {
            return Err(Error::invalid(config.name));
        }
        // packet offsets and lengths are 16 bits wide
        if config.mbuf_sz > u16::MAX as u32 {
            return Err(Error::invalid(format!(
                "mbuf size {} of {}",
                config.mbuf_sz, config.name
            )));
        }

        log::debug!(
            "created memory pool: {} ({} x {} bytes)",
            config.name,
            config.nb_mbufs,
            config.mbuf_sz
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    #[inline(always)]
    pub fn alloc(&self) -> Option<Mbuf> {
        let mut state = self.inner.state.lock();
        if state.in_use == self.inner.config.nb_mbufs {
            return None;
        }

        let buf = state
            .free
            .pop()
            .unwrap_or_else(|| vec![0; self.inner.config.mbuf_sz as usize]);
        state.in_use += 1;
        drop(state);

        Some(Mbuf::new(buf, self.inner.clone()))
    }

    /// Allocate up to `n` buffers, returning how many were appended.
    pub fn alloc_many(&self, n: usize, out: &mut Vec<Mbuf>) -> usize {
        let mut count = 0;
        while count < n {
            match self.alloc() {
                Some(m) => out.push(m),
                None => break,
            }
            count += 1;
        }
        count
    }

    pub fn in_use(&self) -> u32 {
        self.inner.state.lock().in_use
    }

    pub fn available(&self) -> u32 {
        self.inner.config.nb_mbufs - self.in_use()
    }
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn put(&self, buf: Vec<u8>) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        state.free.push(buf);
    }
}

/// Named buffer pools, in creation order.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Vec<MemoryPool>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, config: PoolConfig) -> Result<&MemoryPool> {
        if self.get(&config.name).is_some() {
            return Err(Error::exists(config.name));
        }

        let pool = MemoryPool::create(config)?;
        let idx = self.pools.len();
        self.pools.push(pool);

        Ok(&self.pools[idx])
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self
            .pools
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| Error::not_found(name))?;

        // Buffers still in flight keep the pool's storage alive.
        self.pools.remove(idx);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MemoryPool> {
        self.pools.iter().find(|p| p.name() == name)
    }

    pub fn lookup(&self, name: &str) -> Result<MemoryPool> {
        self.get(name).cloned().ok_or_else(|| Error::not_found(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryPool> {
        self.pools.iter()
    }
}
