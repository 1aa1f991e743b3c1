//! Stage registry.
//!
//! A stage assigns a set of cores one role in the pipeline, together with
//! the event queues and link queues those cores use. The registry also owns
//! the enabled/used core bitmaps that keep stages from overlapping.

use std::fmt::{self, Write};
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;
use crate::eventq::{InputQueue, OutputQueue, ScheduleType};
use crate::lcore::Pipeline;
use crate::link::LinkRegistry;
use crate::Result;

pub const STAGE_MAX: usize = 16;
pub const STAGE_NAME_MAX_LEN: usize = 64;
pub const STAGE_MAX_LINK_QUEUES: usize = 8;
pub const STAGE_GRAPH_NODES_MAX_LEN: usize = 256;
pub const MAX_LCORE: u16 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct CoreMask(pub u64);

impl CoreMask {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(&self, core: u16) -> bool {
        core < MAX_LCORE && self.0 & (1 << core) != 0
    }

    pub fn insert(&mut self, core: u16) {
        if core < MAX_LCORE {
            self.0 |= 1 << core;
        }
    }

    pub fn remove(&mut self, core: u16) {
        if core < MAX_LCORE {
            self.0 &= !(1 << core);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_superset(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..MAX_LCORE).filter(|&c| self.contains(c))
    }
}

impl FromIterator<u16> for CoreMask {
    fn from_iter<T: IntoIterator<Item = u16>>(iter: T) -> Self {
        let mut mask = Self::empty();
        for core in iter {
            mask.insert(core);
        }
        mask
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl FromStr for CoreMask {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed
            .map(CoreMask)
            .map_err(|_| Error::invalid(format!("coremask '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Rx,
    Worker,
    Tx,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rx" => Ok(Self::Rx),
            "worker" => Ok(Self::Worker),
            "tx" => Ok(Self::Tx),
            _ => Err(Error::invalid(format!("stage type '{s}'"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rx => f.write_str("rx"),
            Self::Worker => f.write_str("worker"),
            Self::Tx => f.write_str("tx"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkQueue {
    pub link_id: u16,
    pub queue_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub id: usize,
    pub coremask: CoreMask,
    pub role: Option<Role>,
    pub input: Option<InputQueue>,
    pub output: Option<OutputQueue>,
    pub link_in: [Option<LinkQueue>; STAGE_MAX_LINK_QUEUES],
    pub link_out: [Option<LinkQueue>; STAGE_MAX_LINK_QUEUES],
    pub nodes: String,
}

impl Stage {
    fn new(name: String, id: usize, coremask: CoreMask) -> Self {
        Self {
            name,
            id,
            coremask,
            role: None,
            input: None,
            output: None,
            link_in: [None; STAGE_MAX_LINK_QUEUES],
            link_out: [None; STAGE_MAX_LINK_QUEUES],
            nodes: String::new(),
        }
    }

    pub fn link_queues(&self, dir: Direction) -> impl Iterator<Item = LinkQueue> + '_ {
        let slots = match dir {
            Direction::In => &self.link_in,
            Direction::Out => &self.link_out,
        };
        slots.iter().flatten().copied()
    }

    /// Event queue wiring implied by the stage's role.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let missing = |what: &str| Error::invalid(format!("stage {} has no {}", self.name, what));

        match self.role {
            Some(Role::Rx) => Ok(Pipeline::Rx {
                output: self.output.ok_or_else(|| missing("output queue"))?,
            }),
            Some(Role::Worker) => Ok(Pipeline::Worker {
                input: self.input.clone().ok_or_else(|| missing("input queue"))?,
                output: self.output.ok_or_else(|| missing("output queue"))?,
            }),
            Some(Role::Tx) => Ok(Pipeline::Tx {
                input: self.input.clone().ok_or_else(|| missing("input queue"))?,
            }),
            None => Err(missing("type")),
        }
    }

    pub fn show(&self) -> String {
        let mut out = format!(
            "{}: stage_id={} coremask:{}",
            self.name, self.id, self.coremask
        );
        if let Some(role) = self.role {
            let _ = write!(out, " type {role}");
        }
        if let Some(q) = &self.input {
            let _ = write!(out, " in {} {}", q.id, q.schedule);
        }
        if let Some(q) = &self.output {
            let _ = write!(out, " out {} {}", q.id, q.schedule);
        }
        out
    }
}

/// Named stages in insertion order, plus core occupancy.
#[derive(Debug)]
pub struct StageRegistry {
    enabled: CoreMask,
    used: CoreMask,
    stages: Vec<Stage>,
    ids: [bool; STAGE_MAX],
}

impl StageRegistry {
    /// `enabled` are the cores stages may be placed on.
    pub fn new(enabled: CoreMask) -> Self {
        Self {
            enabled,
            used: CoreMask::empty(),
            stages: Vec::new(),
            ids: [false; STAGE_MAX],
        }
    }

    pub fn enabled_coremask(&self) -> CoreMask {
        self.enabled
    }

    pub fn used_coremask(&self) -> CoreMask {
        self.used
    }

    pub fn add(&mut self, name: &str, coremask: CoreMask) -> Result<&Stage> {
        if name.is_empty() || name.len() >= STAGE_NAME_MAX_LEN {
            return Err(Error::invalid(format!("stage name '{name}'")));
        }
        if self.get(name).is_some() {
            return Err(Error::exists(name));
        }
        let id = self
            .ids
            .iter()
            .position(|used| !used)
            .ok_or_else(|| Error::exhausted(format!("stage slots for {name}")))?;

        for core in coremask.iter() {
            if !self.enabled.contains(core) {
                return Err(Error::InvalidCore(core));
            }
            if self.used.contains(core) {
                return Err(Error::CoreConflict(core));
            }
        }

        self.used = self.used.union(coremask);
        self.ids[id] = true;

        let idx = self.stages.len();
        self.stages.push(Stage::new(name.to_string(), id, coremask));

        Ok(&self.stages[idx])
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self.position(name)?;
        let stage = self.stages.remove(idx);

        self.used = self.used.difference(stage.coremask);
        self.ids[stage.id] = false;

        Ok(())
    }

    pub fn set_role(&mut self, name: &str, role: &str) -> Result<()> {
        let idx = self.position(name)?;
        self.stages[idx].role = Some(role.parse()?);
        Ok(())
    }

    pub fn set_input_queue(
        &mut self,
        name: &str,
        qid: u8,
        schedule: ScheduleType,
        pool: &str,
    ) -> Result<()> {
        let idx = self.position(name)?;
        self.stages[idx].input = Some(InputQueue {
            id: qid,
            schedule,
            pool: pool.to_string(),
        });
        Ok(())
    }

    pub fn set_output_queue(&mut self, name: &str, qid: u8, schedule: ScheduleType) -> Result<()> {
        let idx = self.position(name)?;
        self.stages[idx].output = Some(OutputQueue { id: qid, schedule });
        Ok(())
    }

    /// Bind an RX queue of `link` to an RX stage.
    pub fn set_ingress_link_queue(
        &mut self,
        name: &str,
        links: &LinkRegistry,
        link: &str,
        qid: u16,
    ) -> Result<()> {
        self.set_link_queue(name, links, link, qid, Direction::In)
    }

    /// Bind a TX queue of `link` to a TX stage.
    pub fn set_egress_link_queue(
        &mut self,
        name: &str,
        links: &LinkRegistry,
        link: &str,
        qid: u16,
    ) -> Result<()> {
        self.set_link_queue(name, links, link, qid, Direction::Out)
    }

    fn set_link_queue(
        &mut self,
        name: &str,
        links: &LinkRegistry,
        link: &str,
        qid: u16,
        dir: Direction,
    ) -> Result<()> {
        let idx = self.position(name)?;
        let stage = &mut self.stages[idx];

        let (role, slots) = match dir {
            Direction::In => (Role::Rx, &mut stage.link_in),
            Direction::Out => (Role::Tx, &mut stage.link_out),
        };
        if stage.role != Some(role) {
            return Err(Error::invalid(format!(
                "stage {} is not a {} stage",
                stage.name, role
            )));
        }

        let link = links.lookup(link)?;
        let nb_queues = match dir {
            Direction::In => link.rx.nb_queues,
            Direction::Out => link.tx.nb_queues,
        };
        if qid >= nb_queues {
            return Err(Error::invalid(format!("queue {} of link {}", qid, link.name)));
        }

        let binding = LinkQueue {
            link_id: link.id,
            queue_id: qid,
        };
        if slots.iter().flatten().any(|lq| *lq == binding) {
            return Ok(());
        }

        let slot = slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| Error::exhausted(format!("link queues of stage {name}")))?;
        *slot = Some(binding);

        Ok(())
    }

    pub fn set_extra_graph_nodes(&mut self, name: &str, nodes: &str) -> Result<()> {
        let idx = self.position(name)?;
        if nodes.len() >= STAGE_GRAPH_NODES_MAX_LEN {
            return Err(Error::invalid(format!("graph node list of stage {name}")));
        }
        self.stages[idx].nodes = nodes.to_string();
        Ok(())
    }

    /// Visit stages in insertion order, stopping at the first error.
    pub fn walk<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Stage) -> Result<()>,
    {
        for stage in &self.stages {
            f(stage)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn lookup(&self, name: &str) -> Result<&Stage> {
        self.get(name).ok_or_else(|| Error::not_found(name))
    }

    /// First stage with a queue of link `link_id` bound, in either direction.
    pub fn link_user(&self, link_id: u16) -> Option<&Stage> {
        self.stages.iter().find(|s| {
            s.link_queues(Direction::In)
                .chain(s.link_queues(Direction::Out))
                .any(|lq| lq.link_id == link_id)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::not_found(name))
    }
}
