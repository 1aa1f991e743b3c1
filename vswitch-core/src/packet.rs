use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::eventdev::EventTag;
use crate::memory::PoolInner;
use crate::Result;

pub const PKTMBUF_HEADROOM: usize = 128;

/// A packet buffer borrowed from a [`MemoryPool`](crate::memory::MemoryPool).
///
/// `port` and `queue` record where the packet entered the switch and are
/// what the forward and dispatcher nodes key on. `event` is set while the
/// packet travels as an event between stages.
pub struct Mbuf {
    buf: Vec<u8>,
    data_off: u16,
    data_len: u16,

    pub port: u16,
    pub queue: u16,
    pub hash: u32,
    pub event: Option<EventTag>,

    pool: Arc<PoolInner>,
}

impl Mbuf {
    pub(crate) fn new(buf: Vec<u8>, pool: Arc<PoolInner>) -> Self {
        Self {
            buf,
            data_off: PKTMBUF_HEADROOM as _,
            data_len: 0,
            port: 0,
            queue: 0,
            hash: 0,
            event: None,
            pool,
        }
    }

    pub fn len(&self) -> usize {
        self.data_len as _
    }

    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    pub fn data(&self) -> &[u8] {
        let off = self.data_off as usize;
        &self.buf[off..off + self.data_len as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let off = self.data_off as usize;
        &mut self.buf[off..off + self.data_len as usize]
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.data_off as usize - self.data_len as usize
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.tailroom() {
            return Err(Error::exhausted(format!(
                "mbuf of pool {}",
                self.pool.name()
            )));
        }

        let end = self.data_off as usize + self.data_len as usize;
        self.buf[end..end + bytes.len()].copy_from_slice(bytes);
        self.data_len += bytes.len() as u16;

        Ok(())
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("len", &self.data_len)
            .field("port", &self.port)
            .field("queue", &self.queue)
            .field("hash", &self.hash)
            .field("event", &self.event)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::memory::{MemoryPool, PoolConfig};

    #[test]
    fn test_append_and_read_back() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut m = pool.alloc().unwrap();

        assert!(m.is_empty());
        m.append(&[1, 2, 3]).unwrap();
        m.append(&[4]).unwrap();
        assert_eq!(m.data(), &[1, 2, 3, 4]);

        m.data_mut()[0] = 9;
        assert_eq!(m.data()[0], 9);
    }

    #[test]
    fn test_append_beyond_tailroom() {
        let pool = MemoryPool::create(PoolConfig {
            mbuf_sz: 256,
            ..PoolConfig::new("mp0")
        })
        .unwrap();
        let mut m = pool.alloc().unwrap();

        assert_eq!(m.tailroom(), 128);
        assert!(m.append(&[0; 129]).is_err());
        assert!(m.append(&[0; 128]).is_ok());
        assert_eq!(m.tailroom(), 0);
    }
}
