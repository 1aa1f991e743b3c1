//! Ethernet device layer.
//!
//! [`EthDevice`] covers what the link registry and the link RX/TX nodes need
//! from a NIC driver. [`SoftEthDevice`] implements it with in-memory rings.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Error, EINVAL, ENODEV};
use crate::eventdev::EBUSY;
use crate::memory::MemoryPool;
use crate::packet::Mbuf;
use crate::Result;

pub const SOCKET_ID_ANY: i32 = -1;

pub const RX_DESC_DEFAULT: u16 = 1024;
pub const TX_DESC_DEFAULT: u16 = 1024;

pub const ETHER_HDR_LEN: u16 = 14;
pub const ETHER_CRC_LEN: u16 = 4;
pub const MTU_MIN: u16 = 68;
pub const MTU_MAX: u16 = 9000;
pub const MTU_DEFAULT: u16 = MTU_MAX - ETHER_HDR_LEN - ETHER_CRC_LEN;

const MAX_QUEUES_PER_PORT: u16 = 16;

pub const DEFAULT_RSS_KEY: [u8; 40] = [
    0xd1, 0x81, 0xc6, 0x2c, 0xf7, 0xf4, 0xdb, 0x5b, 0x19, 0x83, 0xa2, 0xfc, 0x94, 0x3e, 0x1a, 0xdb,
    0xd9, 0x38, 0x9e, 0x6b, 0xd1, 0x03, 0x9c, 0x2c, 0xa7, 0x44, 0x99, 0xad, 0x59, 0x3d, 0x56, 0xd9,
    0xf3, 0x25, 0x3c, 0x06, 0x2a, 0xdc, 0x1f, 0xfc,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMqMode {
    None,
    Rss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthConf {
    pub mtu: u16,
    pub mq_mode: RxMqMode,
}

impl Default for EthConf {
    fn default() -> Self {
        Self {
            mtu: MTU_DEFAULT,
            mq_mode: RxMqMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PortStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub imissed: u64,
    pub oerrors: u64,
}

pub trait EthDevice: Send + Sync {
    fn port_by_name(&self, name: &str) -> Result<u16>;

    /// NUMA node of the port, [`SOCKET_ID_ANY`] when unknown.
    fn socket_id(&self, port: u16) -> i32;

    fn configure(&self, port: u16, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> Result<()>;

    fn rx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        socket: i32,
        pool: &MemoryPool,
    ) -> Result<()>;

    fn tx_queue_setup(&self, port: u16, queue: u16, nb_desc: u16, socket: i32) -> Result<()>;

    fn start(&self, port: u16) -> Result<()>;

    fn set_mtu(&self, port: u16, mtu: u16) -> Result<()>;

    fn set_promiscuous(&self, port: u16, enable: bool) -> Result<()>;

    fn rx_burst(&self, port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize;

    /// Transmit from the front of `pkts`; packets not accepted stay in it.
    fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

    fn stats(&self, port: u16) -> Option<PortStats>;
}

/// Toeplitz hash of `input` with a 40-byte key.
pub fn softrss(input: &[u8], key: &[u8; 40]) -> u32 {
    let mut hash = 0;

    for (i, &byte) in input.iter().enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                hash ^= key_window(key, i * 8 + bit);
            }
        }
    }

    hash
}

fn key_window(key: &[u8; 40], pos: usize) -> u32 {
    let start = pos / 8;
    let mut v: u64 = 0;
    for i in 0..5 {
        v = (v << 8) | *key.get(start + i).unwrap_or(&0) as u64;
    }
    (v >> (8 - pos % 8)) as u32
}

/// RSS hash of an Ethernet frame over its IPv4 addresses; 0 for anything
/// else.
pub fn flow_hash(frame: &[u8]) -> u32 {
    const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
    const IPV4_SRC: usize = ETHER_HDR_LEN as usize + 12;

    if frame.len() < IPV4_SRC + 8 || frame[12..14] != ETHERTYPE_IPV4 {
        return 0;
    }

    softrss(&frame[IPV4_SRC..IPV4_SRC + 8], &DEFAULT_RSS_KEY)
}

struct RxRing {
    pool: MemoryPool,
    ring: VecDeque<Mbuf>,
    cap: usize,
}

struct TxRing {
    ring: VecDeque<Mbuf>,
    cap: usize,
}

#[derive(Default)]
struct PortState {
    conf: Option<EthConf>,
    rxq: Vec<Option<RxRing>>,
    txq: Vec<Option<TxRing>>,
    started: bool,
    promiscuous: bool,
    mtu: u16,
    stats: PortStats,
}

struct SoftPort {
    name: String,
    socket: i32,
    state: Mutex<PortState>,
}

/// A set of named ports backed by memory rings.
///
/// Packets are put on an RX ring with [`inject`](Self::inject) and taken
/// off a TX ring with [`drain_tx`](Self::drain_tx).
pub struct SoftEthDevice {
    ports: Vec<SoftPort>,
}

fn dev_err(op: &'static str, code: i32) -> Error {
    Error::Device { op, code: -code }
}

impl SoftEthDevice {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self::with_sockets(names.iter().map(|n| (n.as_ref(), SOCKET_ID_ANY)))
    }

    pub fn with_sockets<'a>(ports: impl IntoIterator<Item = (&'a str, i32)>) -> Self {
        Self {
            ports: ports
                .into_iter()
                .map(|(name, socket)| SoftPort {
                    name: name.to_string(),
                    socket,
                    state: Mutex::new(PortState {
                        mtu: MTU_DEFAULT,
                        ..PortState::default()
                    }),
                })
                .collect(),
        }
    }

    fn port(&self, port: u16, op: &'static str) -> Result<&SoftPort> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| dev_err(op, ENODEV))
    }

    pub fn nb_ports(&self) -> u16 {
        self.ports.len() as _
    }

    /// Receive a frame on an RX ring. Returns `false` when the frame is
    /// missed: port stopped, ring full or pool exhausted.
    pub fn inject(&self, port: u16, queue: u16, frame: &[u8]) -> Result<bool> {
        const OP: &str = "inject";
        let p = self.port(port, OP)?;
        let mut state = p.state.lock();
        let started = state.started;
        let ring = state
            .rxq
            .get_mut(queue as usize)
            .and_then(|q| q.as_mut())
            .ok_or_else(|| dev_err(OP, EINVAL))?;

        let mbuf = match ring.pool.alloc() {
            Some(mbuf) if started && ring.ring.len() < ring.cap => mbuf,
            _ => {
                state.stats.imissed += 1;
                return Ok(false);
            }
        };

        let mut mbuf = mbuf;
        mbuf.append(frame)?;
        mbuf.port = port;
        mbuf.queue = queue;
        mbuf.hash = flow_hash(frame);
        ring.ring.push_back(mbuf);

        Ok(true)
    }

    /// Take every frame transmitted on a TX ring.
    pub fn drain_tx(&self, port: u16, queue: u16) -> Vec<Vec<u8>> {
        let Some(p) = self.ports.get(port as usize) else {
            return Vec::new();
        };
        let mut state = p.state.lock();
        match state.txq.get_mut(queue as usize).and_then(|q| q.as_mut()) {
            Some(ring) => ring.ring.drain(..).map(|m| m.data().to_vec()).collect(),
            None => Vec::new(),
        }
    }

    pub fn is_started(&self, port: u16) -> bool {
        self.ports
            .get(port as usize)
            .map(|p| p.state.lock().started)
            .unwrap_or(false)
    }

    pub fn promiscuous(&self, port: u16) -> Option<bool> {
        self.ports.get(port as usize).map(|p| p.state.lock().promiscuous)
    }
}

impl EthDevice for SoftEthDevice {
    fn port_by_name(&self, name: &str) -> Result<u16> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .map(|id| id as u16)
            .ok_or_else(|| dev_err("eth_dev_get_port_by_name", ENODEV))
    }

    fn socket_id(&self, port: u16) -> i32 {
        self.ports
            .get(port as usize)
            .map(|p| p.socket)
            .unwrap_or(SOCKET_ID_ANY)
    }

    fn configure(&self, port: u16, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> Result<()> {
        const OP: &str = "eth_dev_configure";
        let mut state = self.port(port, OP)?.state.lock();

        if state.started {
            return Err(dev_err(OP, EBUSY));
        }
        if nb_rx == 0
            || nb_tx == 0
            || nb_rx > MAX_QUEUES_PER_PORT
            || nb_tx > MAX_QUEUES_PER_PORT
            || !(MTU_MIN..=MTU_MAX).contains(&conf.mtu)
        {
            return Err(dev_err(OP, EINVAL));
        }

        state.conf = Some(*conf);
        state.mtu = conf.mtu;
        state.rxq = (0..nb_rx).map(|_| None).collect();
        state.txq = (0..nb_tx).map(|_| None).collect();

        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        _socket: i32,
        pool: &MemoryPool,
    ) -> Result<()> {
        const OP: &str = "eth_rx_queue_setup";
        let mut state = self.port(port, OP)?.state.lock();

        if nb_desc == 0 {
            return Err(dev_err(OP, EINVAL));
        }
        let slot = state
            .rxq
            .get_mut(queue as usize)
            .ok_or_else(|| dev_err(OP, EINVAL))?;
        *slot = Some(RxRing {
            pool: pool.clone(),
            ring: VecDeque::new(),
            cap: nb_desc as _,
        });

        Ok(())
    }

    fn tx_queue_setup(&self, port: u16, queue: u16, nb_desc: u16, _socket: i32) -> Result<()> {
        const OP: &str = "eth_tx_queue_setup";
        let mut state = self.port(port, OP)?.state.lock();

        if nb_desc == 0 {
            return Err(dev_err(OP, EINVAL));
        }
        let slot = state
            .txq
            .get_mut(queue as usize)
            .ok_or_else(|| dev_err(OP, EINVAL))?;
        *slot = Some(TxRing {
            ring: VecDeque::new(),
            cap: nb_desc as _,
        });

        Ok(())
    }

    fn start(&self, port: u16) -> Result<()> {
        const OP: &str = "eth_dev_start";
        let mut state = self.port(port, OP)?.state.lock();

        if state.conf.is_none()
            || state.rxq.iter().any(|q| q.is_none())
            || state.txq.iter().any(|q| q.is_none())
        {
            return Err(dev_err(OP, EINVAL));
        }
        state.started = true;

        Ok(())
    }

    fn set_mtu(&self, port: u16, mtu: u16) -> Result<()> {
        const OP: &str = "eth_dev_set_mtu";
        let mut state = self.port(port, OP)?.state.lock();

        if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
            return Err(dev_err(OP, EINVAL));
        }
        state.mtu = mtu;

        Ok(())
    }

    fn set_promiscuous(&self, port: u16, enable: bool) -> Result<()> {
        let mut state = self.port(port, "eth_promiscuous_set")?.state.lock();
        state.promiscuous = enable;
        Ok(())
    }

    fn rx_burst(&self, port: u16, queue: u16, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let Some(p) = self.ports.get(port as usize) else {
            return 0;
        };
        let mut state = p.state.lock();
        if !state.started {
            return 0;
        }
        let Some(ring) = state.rxq.get_mut(queue as usize).and_then(|q| q.as_mut()) else {
            return 0;
        };

        let n = max.min(ring.ring.len());
        out.extend(ring.ring.drain(..n));
        state.stats.ipackets += n as u64;

        n
    }

    fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let Some(p) = self.ports.get(port as usize) else {
            return 0;
        };
        let mut state = p.state.lock();
        if !state.started {
            return 0;
        }
        let Some(ring) = state.txq.get_mut(queue as usize).and_then(|q| q.as_mut()) else {
            return 0;
        };

        let n = pkts.len().min(ring.cap - ring.ring.len());
        ring.ring.extend(pkts.drain(..n));
        state.stats.opackets += n as u64;

        n
    }

    fn stats(&self, port: u16) -> Option<PortStats> {
        self.ports.get(port as usize).map(|p| p.state.lock().stats)
    }
}
