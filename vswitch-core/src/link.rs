use std::fmt::Write;
use std::sync::Arc;

use crate::device::{EthConf, EthDevice, RX_DESC_DEFAULT, SOCKET_ID_ANY, TX_DESC_DEFAULT};
use crate::error::Error;
use crate::memory::{MemoryPool, PoolRegistry};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub name: String,
    pub nb_rxq: u16,
    pub nb_txq: u16,
    pub pool: String,
}

#[derive(Debug, Clone)]
pub struct RxConfig {
    pub nb_queues: u16,
    pub queue_sz: u16,
    pub pool: MemoryPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfig {
    pub nb_queues: u16,
    pub queue_sz: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub id: u16,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub id: u16,
    pub numa_node: i32,
    pub rx: RxConfig,
    pub tx: TxConfig,
    pub promiscuous: bool,
    pub mtu: u16,
    pub peer: Option<Peer>,
}

/// Configured links, in the order they were added.
pub struct LinkRegistry {
    dev: Arc<dyn EthDevice>,
    links: Vec<Link>,
}

impl LinkRegistry {
    pub fn new(dev: Arc<dyn EthDevice>) -> Self {
        Self {
            dev,
            links: Vec::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn EthDevice> {
        &self.dev
    }

    /// Configure the device behind `config.name` and set up all of its
    /// queues. Queues set up before a failing one are not rolled back.
    pub fn add(&mut self, config: LinkConfig, pools: &PoolRegistry) -> Result<&Link> {
        let id = self.dev.port_by_name(&config.name)?;
        if self.get(&config.name).is_some() {
            return Err(Error::exists(config.name));
        }
        let pool = pools.lookup(&config.pool)?;

        let mut numa_node = self.dev.socket_id(id);
        if numa_node == SOCKET_ID_ANY {
            numa_node = 0;
        }

        let conf = EthConf::default();
        self.dev
            .configure(id, config.nb_rxq, config.nb_txq, &conf)?;

        for q in 0..config.nb_rxq {
            self.dev
                .rx_queue_setup(id, q, RX_DESC_DEFAULT, numa_node, &pool)?;
        }
        for q in 0..config.nb_txq {
            self.dev.tx_queue_setup(id, q, TX_DESC_DEFAULT, numa_node)?;
        }

        log::debug!(
            "link {} (port {}) configured with {} rxq, {} txq",
            config.name,
            id,
            config.nb_rxq,
            config.nb_txq
        );

        let idx = self.links.len();
        self.links.push(Link {
            name: config.name,
            id,
            numa_node,
            rx: RxConfig {
                nb_queues: config.nb_rxq,
                queue_sz: RX_DESC_DEFAULT,
                pool,
            },
            tx: TxConfig {
                nb_queues: config.nb_txq,
                queue_sz: TX_DESC_DEFAULT,
            },
            promiscuous: false,
            mtu: conf.mtu,
            peer: None,
        });

        Ok(&self.links[idx])
    }

    /// Forget a link. Its partner, if any, is left without a peer.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        let link = self.links.remove(idx);

        if let Some(peer) = &link.peer {
            if let Some(partner) = self.links.iter_mut().find(|l| l.id == peer.id) {
                partner.peer = None;
                log::debug!("link {} lost its peer {}", partner.name, link.name);
            }
        }

        Ok(())
    }

    pub fn set_promiscuous(&mut self, name: &str, enable: bool) -> Result<()> {
        let idx = self.position(name)?;
        self.dev.set_promiscuous(self.links[idx].id, enable)?;
        self.links[idx].promiscuous = enable;
        Ok(())
    }

    pub fn set_mtu(&mut self, name: &str, mtu: u16) -> Result<()> {
        let idx = self.position(name)?;
        self.dev.set_mtu(self.links[idx].id, mtu)?;
        self.links[idx].mtu = mtu;
        Ok(())
    }

    /// Pair two links so that what one receives is sent out of the other.
    /// A link may be paired with itself.
    pub fn set_peer(&mut self, name: &str, peer: &str) -> Result<()> {
        let a = self.position(name)?;
        let b = self.position(peer)?;

        for idx in [a, b] {
            if self.links[idx].peer.is_some() {
                return Err(Error::exists(format!("peer of {}", self.links[idx].name)));
            }
        }

        let peer_of_a = Peer {
            name: self.links[b].name.clone(),
            id: self.links[b].id,
        };
        let peer_of_b = Peer {
            name: self.links[a].name.clone(),
            id: self.links[a].id,
        };
        self.links[a].peer = Some(peer_of_a);
        self.links[b].peer = Some(peer_of_b);

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.name == name)
    }

    pub fn lookup(&self, name: &str) -> Result<&Link> {
        self.get(name).ok_or_else(|| Error::not_found(name))
    }

    pub fn get_by_id(&self, id: u16) -> Option<&Link> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn peer_of(&self, id: u16) -> Option<&Peer> {
        self.get_by_id(id).and_then(|l| l.peer.as_ref())
    }

    /// Start every configured link on the device.
    pub fn start(&self) -> Result<()> {
        for link in &self.links {
            self.dev.start(link.id)?;
            log::info!("link {} started", link.name);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn show(&self, link: &Link) -> String {
        let stats = self.dev.stats(link.id).unwrap_or_default();
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{}: flags=<{}> mtu {}",
            link.name,
            if link.promiscuous { "PROMISC" } else { "" },
            link.mtu
        );
        let _ = writeln!(
            out,
            "\tport# {}  numa {}  rxq {} txq {}  mempool {}",
            link.id,
            link.numa_node,
            link.rx.nb_queues,
            link.tx.nb_queues,
            link.rx.pool.name()
        );
        if let Some(peer) = &link.peer {
            let _ = writeln!(out, "\tpeer {}", peer.name);
        }
        let _ = writeln!(
            out,
            "\tRX packets {}  missed {}",
            stats.ipackets, stats.imissed
        );
        let _ = writeln!(
            out,
            "\tTX packets {}  errors {}",
            stats.opackets, stats.oerrors
        );

        out
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.links
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| Error::not_found(name))
    }
}
