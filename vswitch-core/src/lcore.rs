use arrayvec::ArrayVec;

use crate::eventdev::PortConf;
use crate::eventq::{InputQueue, OutputQueue};
use crate::stage::{Direction, LinkQueue, Role, Stage, STAGE_MAX_LINK_QUEUES};
use crate::Result;

pub const GRAPH_MAX_PATTERNS: usize = 16;

/// Event queues a core dequeues from and enqueues to, by role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pipeline {
    Rx { output: OutputQueue },
    Worker { input: InputQueue, output: OutputQueue },
    Tx { input: InputQueue },
}

impl Pipeline {
    pub fn role(&self) -> Role {
        match self {
            Self::Rx { .. } => Role::Rx,
            Self::Worker { .. } => Role::Worker,
            Self::Tx { .. } => Role::Tx,
        }
    }

    pub fn input(&self) -> Option<&InputQueue> {
        match self {
            Self::Worker { input, .. } | Self::Tx { input } => Some(input),
            Self::Rx { .. } => None,
        }
    }

    pub fn output(&self) -> Option<&OutputQueue> {
        match self {
            Self::Rx { output } | Self::Worker { output, .. } => Some(output),
            Self::Tx { .. } => None,
        }
    }
}

/// Runtime view of one stage on one core.
#[derive(Debug, Clone)]
pub struct Lcore {
    pub core_id: u16,
    pub enabled: bool,
    pub ev_id: u8,
    pub ev_port_id: u8,
    pub port_conf: PortConf,
    pub pipeline: Option<Pipeline>,
    pub link_in_queues: ArrayVec<LinkQueue, STAGE_MAX_LINK_QUEUES>,
    pub link_out_queues: ArrayVec<LinkQueue, STAGE_MAX_LINK_QUEUES>,
    pub nodes: String,
    pub patterns: ArrayVec<String, GRAPH_MAX_PATTERNS>,
    pub graph_name: String,
}

impl Lcore {
    pub fn init(core_id: u16, ev_id: u8) -> Self {
        Self {
            core_id,
            enabled: false,
            ev_id,
            ev_port_id: 0,
            port_conf: PortConf::default(),
            pipeline: None,
            link_in_queues: ArrayVec::new(),
            link_out_queues: ArrayVec::new(),
            nodes: String::new(),
            patterns: ArrayVec::new(),
            graph_name: String::new(),
        }
    }

    /// Project `stage` onto this core, using event port `ev_port_id`.
    pub fn populate(&mut self, stage: &Stage, ev_port_id: u8) -> Result<()> {
        self.pipeline = Some(stage.pipeline()?);
        self.enabled = true;
        self.ev_port_id = ev_port_id;
        self.port_conf = PortConf::default();
        self.nodes = stage.nodes.clone();

        self.link_in_queues = stage.link_queues(Direction::In).collect();
        self.link_out_queues = stage.link_queues(Direction::Out).collect();

        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        self.pipeline.as_ref().map(Pipeline::role)
    }

    /// Node names listed with `stage set <name> graph`.
    pub fn extra_nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.split(',').map(str::trim).filter(|n| !n.is_empty())
    }
}
