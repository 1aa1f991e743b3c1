//! Event queue bindings of a stage.
//!
//! A stage consumes from at most one event queue and produces into at most
//! one. The consumer side decides how the queue is provisioned on the event
//! device.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

pub const EV_QUEUE_NB_ATOMIC_FLOWS: u32 = 1024;
pub const EV_QUEUE_NB_ORDER_SEQUENCES: u32 = 1024;
pub const EV_PRIORITY_NORMAL: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ScheduleType {
    /// At most one port holds a given flow at a time.
    Atomic,
    /// Events may be processed in parallel; enqueue order is restored
    /// when they are forwarded.
    Ordered,
}

impl FromStr for ScheduleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(Self::Atomic),
            "ordered" => Ok(Self::Ordered),
            _ => Err(Error::invalid(format!("schedule type '{s}'"))),
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomic => f.write_str("atomic"),
            Self::Ordered => f.write_str("ordered"),
        }
    }
}

/// Provisioning parameters of one event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConf {
    pub schedule: ScheduleType,
    pub nb_atomic_flows: u32,
    pub nb_atomic_order_sequences: u32,
    pub priority: u8,
    pub all_types: bool,
}

impl QueueConf {
    pub fn new(schedule: ScheduleType) -> Self {
        Self {
            schedule,
            nb_atomic_flows: EV_QUEUE_NB_ATOMIC_FLOWS,
            nb_atomic_order_sequences: EV_QUEUE_NB_ORDER_SEQUENCES,
            priority: EV_PRIORITY_NORMAL,
            all_types: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputQueue {
    pub id: u8,
    pub schedule: ScheduleType,
    pub pool: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputQueue {
    pub id: u8,
    pub schedule: ScheduleType,
}

impl InputQueue {
    pub fn conf(&self) -> QueueConf {
        QueueConf::new(self.schedule)
    }
}
