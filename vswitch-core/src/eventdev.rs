//! Event scheduling layer.
//!
//! [`EventDevice`] is the seam between the pipeline and the scheduler that
//! moves events between stages. [`SoftEventDevice`] is an in-process
//! scheduler with the same contract: atomic queues pin a flow to one port
//! until that port dequeues again, ordered queues restore dequeue order when
//! the events are forwarded.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bitflags::bitflags;
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;

use crate::error::{Error, EINVAL, ENODEV};
use crate::eventq::{QueueConf, ScheduleType, EV_PRIORITY_NORMAL};
use crate::packet::Mbuf;
use crate::Result;

pub const EBUSY: i32 = 16;
pub const ESRCH: i32 = 3;

pub const EV_FLOW_ID_MASK: u32 = 0xF_FFFF;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventDevCap: u32 {
        const QUEUE_ALL_TYPES = 0b_0001;
        const BURST_MODE = 0b_0010;
        const DISTRIBUTED_SCHED = 0b_0100;
    }
}

#[derive(Debug, Clone)]
pub struct EventDevInfo {
    pub driver_name: String,
    pub max_event_queues: u8,
    pub max_event_ports: u8,
    pub max_num_events: u32,
    pub max_event_port_dequeue_depth: u16,
    pub max_event_port_enqueue_depth: u16,
    pub capabilities: EventDevCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDevConfig {
    pub nb_event_queues: u8,
    pub nb_event_ports: u8,
    pub nb_events_limit: u32,
    pub nb_event_queue_flows: u32,
    pub nb_event_port_dequeue_depth: u16,
    pub nb_event_port_enqueue_depth: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub dequeue_depth: u16,
    pub enqueue_depth: u16,
    pub new_event_threshold: u32,
}

impl Default for PortConf {
    fn default() -> Self {
        Self {
            dequeue_depth: 128,
            enqueue_depth: 128,
            new_event_threshold: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventOp {
    New,
    Forward,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    /// Minted from a packet received on a link.
    EthDev,
    /// Produced by a worker core.
    Cpu,
}

/// Scheduling context a port holds for an event it dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hold {
    queue: u8,
    kind: HoldKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldKind {
    Atomic { flow: u32 },
    Ordered { seq: u64 },
}

/// Event attributes carried by a packet between the event source node and
/// the event sink node of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTag {
    pub event_type: EventType,
    pub sub_event_type: u8,
    pub flow_id: u32,
    pub queue_id: u8,
    pub sched: ScheduleType,
    pub priority: u8,
    pub(crate) hold: Option<Hold>,
}

#[derive(Debug)]
pub struct Event {
    pub op: EventOp,
    pub queue_id: u8,
    pub sched: ScheduleType,
    pub flow_id: u32,
    pub event_type: EventType,
    pub sub_event_type: u8,
    pub priority: u8,
    pub mbuf: Mbuf,
    pub(crate) hold: Option<Hold>,
}

/// Flow id of a new event: the packet's flow hash folded with the event
/// source, so that equal hashes from different sources do not share a flow.
pub fn flow_id(hash: u32, event_type: EventType, sub_event_type: u8) -> u32 {
    let source = ((event_type as u32) << 8) | sub_event_type as u32;
    (hash ^ source.rotate_left(12)) & EV_FLOW_ID_MASK
}

impl Event {
    pub fn new(mbuf: Mbuf, queue_id: u8, sched: ScheduleType) -> Self {
        Self {
            op: EventOp::New,
            queue_id,
            sched,
            flow_id: mbuf.hash & EV_FLOW_ID_MASK,
            event_type: EventType::Cpu,
            sub_event_type: 0,
            priority: EV_PRIORITY_NORMAL,
            mbuf,
            hold: None,
        }
    }

    /// Re-attach the event attributes carried by `mbuf` so it can be
    /// forwarded under the scheduling context it was dequeued with.
    pub fn forward(mut mbuf: Mbuf, queue_id: u8, sched: ScheduleType) -> Self {
        let tag = mbuf.event.take();
        let mut ev = Self::new(mbuf, queue_id, sched);
        ev.op = EventOp::Forward;

        if let Some(tag) = tag {
            ev.flow_id = tag.flow_id;
            ev.event_type = tag.event_type;
            ev.sub_event_type = tag.sub_event_type;
            ev.priority = tag.priority;
            ev.hold = tag.hold;
        }

        ev
    }

    /// Hand the packet to the graph, keeping the event attributes on it.
    pub fn into_mbuf(self) -> Mbuf {
        let mut mbuf = self.mbuf;
        mbuf.event = Some(EventTag {
            event_type: self.event_type,
            sub_event_type: self.sub_event_type,
            flow_id: self.flow_id,
            queue_id: self.queue_id,
            sched: self.sched,
            priority: self.priority,
            hold: self.hold,
        });
        mbuf
    }
}

pub trait EventDevice: Send + Sync {
    fn count(&self) -> u8;

    fn info(&self, dev_id: u8) -> Result<EventDevInfo>;

    fn configure(&self, dev_id: u8, config: &EventDevConfig) -> Result<()>;

    fn queue_setup(&self, dev_id: u8, queue_id: u8, conf: &QueueConf) -> Result<()>;

    fn port_setup(&self, dev_id: u8, port_id: u8, conf: &PortConf) -> Result<()>;

    /// Link a port to the queues it dequeues from, returning how many
    /// links were established.
    fn port_link(&self, dev_id: u8, port_id: u8, queues: &[u8]) -> Result<usize>;

    /// Scheduler service of the device, `None` when the device schedules
    /// in hardware.
    fn service_id(&self, dev_id: u8) -> Result<Option<u32>>;

    fn service_runstate_set(&self, service_id: u32, running: bool) -> Result<()>;

    fn start(&self, dev_id: u8) -> Result<()>;

    /// Dequeue up to `max` events into `out`, returning how many were
    /// dequeued. The scheduling contexts held from the previous dequeue on
    /// this port are released first.
    fn dequeue_burst(&self, dev_id: u8, port_id: u8, out: &mut Vec<Event>, max: usize) -> usize;

    /// Enqueue `events` in order. Accepted events are removed from the
    /// front of the vector; the rejected tail stays with the caller.
    fn enqueue_burst(&self, dev_id: u8, port_id: u8, events: &mut Vec<Event>) -> usize;
}

const SOFT_MAX_QUEUES: u8 = 64;
const SOFT_MAX_PORTS: u8 = 64;
const SOFT_MAX_EVENTS: u32 = 4096;
const SOFT_SERVICE_ID: u32 = 0;

pub struct SoftEventDevice {
    info: EventDevInfo,
    state: Mutex<SoftState>,
}

#[derive(Default)]
struct SoftState {
    config: Option<EventDevConfig>,
    queues: Vec<Option<SoftQueue>>,
    ports: Vec<Option<SoftPort>>,
    started: bool,
    service_running: bool,
    inflight: u32,
}

struct SoftQueue {
    conf: QueueConf,
    fifo: VecDeque<Event>,
    // flow -> (port, events held)
    owners: HashMap<u32, (u8, u32)>,
    next_seq: u64,
    release_seq: u64,
    reorder: BTreeMap<u64, Option<Event>>,
    enqueued: u64,
    dequeued: u64,
}

struct SoftPort {
    conf: PortConf,
    links: SmallVec<[u8; 4]>,
    held: Vec<Held>,
}

struct Held {
    hold: Hold,
    forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub dequeued: u64,
}

fn ev_err(op: &'static str, code: i32) -> Error {
    Error::EventDev { op, code: -code }
}

impl Default for SoftEventDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftEventDevice {
    pub fn new() -> Self {
        Self {
            info: EventDevInfo {
                driver_name: "event_soft".to_string(),
                max_event_queues: SOFT_MAX_QUEUES,
                max_event_ports: SOFT_MAX_PORTS,
                max_num_events: SOFT_MAX_EVENTS,
                max_event_port_dequeue_depth: 128,
                max_event_port_enqueue_depth: 128,
                capabilities: EventDevCap::QUEUE_ALL_TYPES | EventDevCap::BURST_MODE,
            },
            state: Mutex::new(SoftState::default()),
        }
    }

    fn check_dev(dev_id: u8, op: &'static str) -> Result<()> {
        if dev_id != 0 {
            return Err(ev_err(op, ENODEV));
        }
        Ok(())
    }

    pub fn queue_conf(&self, queue_id: u8) -> Option<QueueConf> {
        let state = self.state.lock();
        state
            .queues
            .get(queue_id as usize)
            .and_then(|q| q.as_ref())
            .map(|q| q.conf)
    }

    pub fn queue_stats(&self, queue_id: u8) -> Option<QueueStats> {
        let state = self.state.lock();
        state
            .queues
            .get(queue_id as usize)
            .and_then(|q| q.as_ref())
            .map(|q| QueueStats {
                depth: q.fifo.len(),
                enqueued: q.enqueued,
                dequeued: q.dequeued,
            })
    }

    pub fn port_links(&self, port_id: u8) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .ports
            .get(port_id as usize)
            .and_then(|p| p.as_ref())
            .map(|p| p.links.to_vec())
    }

    pub fn config(&self) -> Option<EventDevConfig> {
        self.state.lock().config
    }

    pub fn inflight(&self) -> u32 {
        self.state.lock().inflight
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }
}

impl SoftState {
    fn release_holds(&mut self, port_id: u8) {
        let held = match self.ports[port_id as usize].as_mut() {
            Some(port) => std::mem::take(&mut port.held),
            None => return,
        };

        for h in held {
            self.release_one(port_id, h.hold, h.forwarded);
        }
    }

    fn release_one(&mut self, port_id: u8, hold: Hold, forwarded: bool) {
        if !forwarded {
            self.inflight -= 1;
        }

        let Some(queue) = self.queues[hold.queue as usize].as_mut() else {
            return;
        };

        match hold.kind {
            HoldKind::Atomic { flow } => {
                if let Some((owner, count)) = queue.owners.get_mut(&flow) {
                    debug_assert_eq!(*owner, port_id);
                    *count -= 1;
                    if *count == 0 {
                        queue.owners.remove(&flow);
                    }
                }
            }
            HoldKind::Ordered { seq } => {
                if !forwarded {
                    queue.reorder.insert(seq, None);
                    self.drain_reorder(hold.queue);
                }
            }
        }
    }

    /// Deliver, in sequence order, every forwarded event whose predecessors
    /// have all been forwarded or released.
    fn drain_reorder(&mut self, queue_id: u8) {
        let mut ready = Vec::new();
        if let Some(queue) = self.queues[queue_id as usize].as_mut() {
            while let Some(slot) = queue.reorder.remove(&queue.release_seq) {
                queue.release_seq += 1;
                if let Some(ev) = slot {
                    ready.push(ev);
                }
            }
        }

        for ev in ready {
            self.push(ev);
        }
    }

    fn push(&mut self, ev: Event) {
        if let Some(queue) = self.queues[ev.queue_id as usize].as_mut() {
            queue.enqueued += 1;
            queue.fifo.push_back(ev);
        }
    }

    fn queue_ready(&self, queue_id: u8) -> bool {
        matches!(self.queues.get(queue_id as usize), Some(Some(_)))
    }

    fn accept(&mut self, port_id: u8, mut ev: Event) -> std::result::Result<(), Event> {
        if ev.op != EventOp::Release && !self.queue_ready(ev.queue_id) {
            return Err(ev);
        }

        let limit = match (self.config, self.ports[port_id as usize].as_ref()) {
            (Some(config), Some(port)) => config.nb_events_limit.min(port.conf.new_event_threshold),
            _ => return Err(ev),
        };

        match ev.op {
            EventOp::New => {
                if self.inflight >= limit {
                    return Err(ev);
                }
                self.inflight += 1;
                ev.hold = None;
                self.push(ev);
            }
            EventOp::Forward => {
                let hold = ev.hold.take();
                let held = hold.and_then(|hold| {
                    let port = self.ports[port_id as usize].as_mut()?;
                    let h = port
                        .held
                        .iter_mut()
                        .find(|h| h.hold == hold && !h.forwarded)?;
                    h.forwarded = true;
                    Some(hold)
                });

                match held {
                    Some(Hold {
                        queue,
                        kind: HoldKind::Ordered { seq },
                    }) => {
                        if let Some(q) = self.queues[queue as usize].as_mut() {
                            q.reorder.insert(seq, Some(ev));
                        }
                        self.drain_reorder(queue);
                    }
                    Some(_) => self.push(ev),
                    None => {
                        // forwarding an event this port never dequeued
                        if self.inflight >= limit {
                            return Err(ev);
                        }
                        self.inflight += 1;
                        self.push(ev);
                    }
                }
            }
            EventOp::Release => {
                if let (Some(hold), Some(port)) = (ev.hold, self.ports[port_id as usize].as_mut()) {
                    if let Some(idx) = port
                        .held
                        .iter()
                        .position(|h| h.hold == hold && !h.forwarded)
                    {
                        let h = port.held.remove(idx);
                        self.release_one(port_id, h.hold, false);
                    }
                }
            }
        }

        Ok(())
    }
}

impl EventDevice for SoftEventDevice {
    fn count(&self) -> u8 {
        1
    }

    fn info(&self, dev_id: u8) -> Result<EventDevInfo> {
        Self::check_dev(dev_id, "event_dev_info_get")?;
        Ok(self.info.clone())
    }

    fn configure(&self, dev_id: u8, config: &EventDevConfig) -> Result<()> {
        const OP: &str = "event_dev_configure";
        Self::check_dev(dev_id, OP)?;

        let mut state = self.state.lock();
        if state.started {
            return Err(ev_err(OP, EBUSY));
        }
        if config.nb_event_queues == 0
            || config.nb_event_ports == 0
            || config.nb_event_queues > self.info.max_event_queues
            || config.nb_event_ports > self.info.max_event_ports
            || config.nb_events_limit > self.info.max_num_events
        {
            return Err(ev_err(OP, EINVAL));
        }

        state.queues = (0..config.nb_event_queues).map(|_| None).collect();
        state.ports = (0..config.nb_event_ports).map(|_| None).collect();
        state.config = Some(*config);
        state.inflight = 0;

        log::debug!(
            "event device {} configured: {} queues, {} ports",
            dev_id,
            config.nb_event_queues,
            config.nb_event_ports
        );

        Ok(())
    }

    fn queue_setup(&self, dev_id: u8, queue_id: u8, conf: &QueueConf) -> Result<()> {
        const OP: &str = "event_queue_setup";
        Self::check_dev(dev_id, OP)?;

        let mut state = self.state.lock();
        if state.started {
            return Err(ev_err(OP, EBUSY));
        }
        let slot = state
            .queues
            .get_mut(queue_id as usize)
            .ok_or_else(|| ev_err(OP, EINVAL))?;

        *slot = Some(SoftQueue {
            conf: *conf,
            fifo: VecDeque::new(),
            owners: HashMap::new(),
            next_seq: 0,
            release_seq: 0,
            reorder: BTreeMap::new(),
            enqueued: 0,
            dequeued: 0,
        });

        Ok(())
    }

    fn port_setup(&self, dev_id: u8, port_id: u8, conf: &PortConf) -> Result<()> {
        const OP: &str = "event_port_setup";
        Self::check_dev(dev_id, OP)?;

        let mut state = self.state.lock();
        if state.started {
            return Err(ev_err(OP, EBUSY));
        }
        let config = state.config.ok_or_else(|| ev_err(OP, EINVAL))?;
        if conf.dequeue_depth > config.nb_event_port_dequeue_depth
            || conf.enqueue_depth > config.nb_event_port_enqueue_depth
            || conf.new_event_threshold > config.nb_events_limit
        {
            return Err(ev_err(OP, EINVAL));
        }

        let slot = state
            .ports
            .get_mut(port_id as usize)
            .ok_or_else(|| ev_err(OP, EINVAL))?;
        *slot = Some(SoftPort {
            conf: *conf,
            links: SmallVec::new(),
            held: Vec::new(),
        });

        Ok(())
    }

    fn port_link(&self, dev_id: u8, port_id: u8, queues: &[u8]) -> Result<usize> {
        const OP: &str = "event_port_link";
        Self::check_dev(dev_id, OP)?;

        let mut state = self.state.lock();
        if queues.iter().any(|&q| !state.queue_ready(q)) {
            return Err(ev_err(OP, EINVAL));
        }

        let port = state
            .ports
            .get_mut(port_id as usize)
            .and_then(|p| p.as_mut())
            .ok_or_else(|| ev_err(OP, EINVAL))?;

        for &q in queues {
            if !port.links.contains(&q) {
                port.links.push(q);
            }
        }

        Ok(queues.len())
    }

    fn service_id(&self, dev_id: u8) -> Result<Option<u32>> {
        Self::check_dev(dev_id, "event_dev_service_id_get")?;
        Ok(Some(SOFT_SERVICE_ID))
    }

    fn service_runstate_set(&self, service_id: u32, running: bool) -> Result<()> {
        if service_id != SOFT_SERVICE_ID {
            return Err(ev_err("service_runstate_set", EINVAL));
        }
        self.state.lock().service_running = running;
        Ok(())
    }

    fn start(&self, dev_id: u8) -> Result<()> {
        const OP: &str = "event_dev_start";
        Self::check_dev(dev_id, OP)?;

        let mut state = self.state.lock();
        if state.config.is_none() || state.ports.iter().any(|p| p.is_none()) {
            return Err(ev_err(OP, EINVAL));
        }
        state.started = true;

        log::debug!("event device {} started", dev_id);

        Ok(())
    }

    fn dequeue_burst(&self, dev_id: u8, port_id: u8, out: &mut Vec<Event>, max: usize) -> usize {
        if dev_id != 0 {
            return 0;
        }

        let mut state = self.state.lock();
        if !state.started || !state.service_running {
            return 0;
        }
        if !matches!(state.ports.get(port_id as usize), Some(Some(_))) {
            return 0;
        }

        state.release_holds(port_id);

        let SoftState { queues, ports, .. } = &mut *state;
        let Some(port) = ports[port_id as usize].as_mut() else {
            return 0;
        };
        let max = max.min(port.conf.dequeue_depth as usize);
        let mut n = 0;

        for &qid in &port.links {
            let Some(queue) = queues[qid as usize].as_mut() else {
                continue;
            };

            let mut i = 0;
            while n < max && i < queue.fifo.len() {
                let hold = match queue.conf.schedule {
                    ScheduleType::Atomic => {
                        let flow = queue.fifo[i].flow_id;
                        match queue.owners.get_mut(&flow) {
                            Some((owner, _)) if *owner != port_id => {
                                i += 1;
                                continue;
                            }
                            Some((_, count)) => *count += 1,
                            None => {
                                queue.owners.insert(flow, (port_id, 1));
                            }
                        }
                        HoldKind::Atomic { flow }
                    }
                    ScheduleType::Ordered => {
                        let seq = queue.next_seq;
                        queue.next_seq += 1;
                        HoldKind::Ordered { seq }
                    }
                };

                let Some(mut ev) = queue.fifo.remove(i) else {
                    break;
                };
                let hold = Hold { queue: qid, kind: hold };
                ev.hold = Some(hold);
                ev.sched = queue.conf.schedule;
                port.held.push(Held {
                    hold,
                    forwarded: false,
                });
                queue.dequeued += 1;
                out.push(ev);
                n += 1;
            }
        }

        n
    }

    fn enqueue_burst(&self, dev_id: u8, port_id: u8, events: &mut Vec<Event>) -> usize {
        if dev_id != 0 {
            return 0;
        }

        let mut state = self.state.lock();
        if !state.started {
            return 0;
        }
        let depth = match state.ports.get(port_id as usize) {
            Some(Some(port)) => port.conf.enqueue_depth as usize,
            _ => return 0,
        };

        let pending = std::mem::take(events);
        let mut iter = pending.into_iter();
        let mut n = 0;

        for ev in iter.by_ref() {
            if n == depth {
                events.push(ev);
                break;
            }
            match state.accept(port_id, ev) {
                Ok(()) => n += 1,
                Err(ev) => {
                    events.push(ev);
                    break;
                }
            }
        }
        events.extend(iter);

        n
    }
}
