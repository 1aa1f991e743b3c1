use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::device::EthDevice;
use crate::error::Error;
use crate::eventdev::{EventDevice, EventOp, EventType};
use crate::eventq::ScheduleType;
use crate::graph::{DispatchTable, Streams};
use crate::packet::Mbuf;
use crate::Result;

pub const NODE_NAME_MAX_LEN: usize = 64;

/// Index into a node's edge list.
pub type Edge = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u32 {
        /// Polled on every walk instead of fed by other nodes.
        const SOURCE = 0b_0001;
    }
}

#[allow(unused)]
pub trait Node: Send {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        Ok(())
    }

    /// Handle `objs` and hand every packet to one of the node's edges.
    /// Source nodes are called with an empty vector. Returns the number of
    /// objects handled or produced.
    fn process(&mut self, out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize;
}

pub(crate) type NodeBuildFn = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

/// What a node instance is handed when its graph is initialised.
pub struct NodeInit<'a> {
    pub id: NodeId,
    pub name: &'a str,
    pub graph: &'a str,
    pub core: u16,
    pub dispatch: &'a Arc<DispatchTable>,
    pub(crate) data: Option<NodeData>,
}

impl NodeInit<'_> {
    /// Take the context registered for this node at assembly.
    pub fn take_data(&mut self) -> Result<NodeData> {
        self.data
            .take()
            .ok_or_else(|| Error::Wiring(self.name.to_string()))
    }
}

/// Per-instance contexts filled in by the assembler.
#[derive(Clone)]
pub enum NodeData {
    EventRx(EventRxData),
    EventTx(EventTxData),
    Forward(ForwardData),
    EthRx(EthRxData),
    EthTx(EthTxData),
}

impl NodeData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EventRx(_) => "eventdev_rx",
            Self::EventTx(_) => "eventdev_tx",
            Self::Forward(_) => "forward",
            Self::EthRx(_) => "ethdev_rx",
            Self::EthTx(_) => "ethdev_tx",
        }
    }
}

impl fmt::Debug for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Clone)]
pub struct EventRxData {
    pub dev: Arc<dyn EventDevice>,
    pub dev_id: u8,
    pub port: u8,
    pub pool: String,
    pub next: Edge,
}

#[derive(Clone)]
pub struct EventTxData {
    pub dev: Arc<dyn EventDevice>,
    pub dev_id: u8,
    pub port: u8,
    pub op: EventOp,
    pub sched: ScheduleType,
    pub queue: u8,
    pub event_type: EventType,
    pub sub_event_type: u8,
    pub priority: u8,
}

/// Egress edge per origin link id.
#[derive(Debug, Clone, Default)]
pub struct ForwardData {
    pub next: HashMap<u16, Edge>,
}

#[derive(Clone)]
pub struct EthRxData {
    pub dev: Arc<dyn EthDevice>,
    pub port: u16,
    pub queue: u16,
}

#[derive(Clone)]
pub struct EthTxData {
    pub dev: Arc<dyn EthDevice>,
    pub port: u16,
    pub queue: u16,
}

macro_rules! expect_data {
    ($ctx:expr, $variant:ident) => {
        match $ctx.take_data()? {
            $crate::node::NodeData::$variant(data) => data,
            other => {
                log::error!(
                    "node {} got a {} context",
                    $ctx.name,
                    other.kind()
                );
                return Err($crate::error::Error::Wiring($ctx.name.to_string()));
            }
        }
    };
}

pub(crate) use expect_data;
