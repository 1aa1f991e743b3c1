//! Built-in node templates.
//!
//! Every template is registered once per [`NodeRegistry`]; the assembler
//! clones them per core and per link queue.

mod dispatcher;
mod ethdev_rx;
mod ethdev_tx;
mod eventdev_rx;
mod eventdev_tx;
mod forward;
mod pkt_drop;

pub use dispatcher::Dispatcher;
pub use ethdev_rx::EthDevRx;
pub use ethdev_tx::EthDevTx;
pub use eventdev_rx::EventDevRx;
pub use eventdev_tx::EventDevTx;
pub use forward::Forward;
pub use pkt_drop::PktDrop;

use crate::graph::NodeRegistry;
use crate::node::NodeFlags;
use crate::Result;

pub const PKT_DROP: &str = "pkt_drop";
pub const DISPATCHER: &str = "vs_eventdev_dispatcher";
pub const EVENTDEV_RX: &str = "vs_eventdev_rx";
pub const EVENTDEV_TX: &str = "vs_eventdev_tx";
pub const FORWARD: &str = "vs_forward";
pub const ETHDEV_RX: &str = "ethdev_rx";
pub const ETHDEV_TX: &str = "ethdev_tx";

/// Packets pulled from a queue per poll.
pub const BURST_SIZE: usize = 32;

pub fn register_builtin(reg: &mut NodeRegistry) -> Result<()> {
    reg.register(PKT_DROP, NodeFlags::empty(), &[], || PktDrop)?;
    reg.register(DISPATCHER, NodeFlags::empty(), &[PKT_DROP], Dispatcher::new)?;
    reg.register(
        EVENTDEV_RX,
        NodeFlags::SOURCE,
        &[DISPATCHER, PKT_DROP],
        EventDevRx::new,
    )?;
    reg.register(EVENTDEV_TX, NodeFlags::empty(), &[PKT_DROP], EventDevTx::new)?;
    reg.register(FORWARD, NodeFlags::empty(), &[PKT_DROP], Forward::new)?;
    reg.register(ETHDEV_RX, NodeFlags::SOURCE, &[], EthDevRx::new)?;
    reg.register(ETHDEV_TX, NodeFlags::empty(), &[PKT_DROP], EthDevTx::new)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_builtin_twice() {
        let mut reg = NodeRegistry::new();
        register_builtin(&mut reg).unwrap();
        assert!(register_builtin(&mut reg).is_err());

        let rx = reg.node_from_name(EVENTDEV_RX).unwrap();
        assert_eq!(reg.edges(rx).unwrap(), [DISPATCHER, PKT_DROP]);
        assert_eq!(reg.edge_count(reg.lookup(ETHDEV_RX).unwrap()).unwrap(), 0);
    }
}
