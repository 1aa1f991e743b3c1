use std::sync::Arc;

use crate::eventdev::{flow_id, Event, EventDevice, EventOp, EventType};
use crate::eventq::{ScheduleType, EV_PRIORITY_NORMAL};
use crate::graph::Streams;
use crate::node::{expect_data, Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

const DROP: u16 = 0;

/// Stamps packets as events and enqueues them on the core's event port.
/// What the device does not accept is dropped.
pub struct EventDevTx {
    dev: Option<Arc<dyn EventDevice>>,
    dev_id: u8,
    port: u8,
    op: EventOp,
    sched: ScheduleType,
    queue: u8,
    event_type: EventType,
    sub_event_type: u8,
    priority: u8,
    events: Vec<Event>,
}

impl EventDevTx {
    pub fn new() -> Self {
        Self {
            dev: None,
            dev_id: 0,
            port: 0,
            op: EventOp::New,
            sched: ScheduleType::Atomic,
            queue: 0,
            event_type: EventType::Cpu,
            sub_event_type: 0,
            priority: EV_PRIORITY_NORMAL,
            events: Vec::new(),
        }
    }

    /// New events take their flow id from the packet hash and the event
    /// source; forwarded ones keep the flow and scheduling context they were
    /// dequeued with.
    fn stamp(&self, mbuf: Mbuf) -> Event {
        let mut ev = match self.op {
            EventOp::Forward => Event::forward(mbuf, self.queue, self.sched),
            op => {
                let mut ev = Event::new(mbuf, self.queue, self.sched);
                ev.op = op;
                ev.flow_id = flow_id(ev.mbuf.hash, self.event_type, self.sub_event_type);
                ev
            }
        };
        ev.event_type = self.event_type;
        ev.sub_event_type = self.sub_event_type;
        ev.priority = self.priority;
        ev
    }
}

impl Node for EventDevTx {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        let data = expect_data!(ctx, EventTx);

        self.dev = Some(data.dev);
        self.dev_id = data.dev_id;
        self.port = data.port;
        self.op = data.op;
        self.sched = data.sched;
        self.queue = data.queue;
        self.event_type = data.event_type;
        self.sub_event_type = data.sub_event_type;
        self.priority = data.priority;

        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize {
        let n = objs.len();

        let Some(dev) = self.dev.clone() else {
            out.enqueue_burst(DROP, objs);
            return n;
        };

        self.events.clear();
        for mbuf in objs {
            let ev = self.stamp(mbuf);
            self.events.push(ev);
        }

        dev.enqueue_burst(self.dev_id, self.port, &mut self.events);
        out.enqueue_burst(DROP, self.events.drain(..).map(|ev| ev.mbuf));

        n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{MemoryPool, PoolConfig};

    fn sink(op: EventOp, event_type: EventType, sub_event_type: u8) -> EventDevTx {
        EventDevTx {
            op,
            event_type,
            sub_event_type,
            queue: 3,
            sched: ScheduleType::Ordered,
            ..EventDevTx::new()
        }
    }

    #[test]
    fn test_new_event_flow_id() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mbuf = |hash| {
            let mut m = pool.alloc().unwrap();
            m.hash = hash;
            m
        };

        let a = sink(EventOp::New, EventType::EthDev, 0).stamp(mbuf(0x1234));
        let b = sink(EventOp::New, EventType::EthDev, 0).stamp(mbuf(0x1234));
        let c = sink(EventOp::New, EventType::EthDev, 1).stamp(mbuf(0x1234));
        let d = sink(EventOp::New, EventType::Cpu, 0).stamp(mbuf(0x1234));

        assert_eq!(a.flow_id, b.flow_id);
        assert_ne!(a.flow_id, c.flow_id);
        assert_ne!(a.flow_id, d.flow_id);
        assert_eq!(a.flow_id, flow_id(0x1234, EventType::EthDev, 0));
        assert_eq!(a.queue_id, 3);
        assert_eq!(a.sched, ScheduleType::Ordered);
        assert_eq!(a.event_type, EventType::EthDev);
    }

    #[test]
    fn test_forward_keeps_flow() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut m = pool.alloc().unwrap();
        m.hash = 0x1234;

        let tagged = Event::new(m, 0, ScheduleType::Atomic);
        let kept = tagged.flow_id;
        let ev = sink(EventOp::Forward, EventType::Cpu, 0).stamp(tagged.into_mbuf());

        assert_eq!(ev.op, EventOp::Forward);
        assert_eq!(ev.flow_id, kept);
        assert_eq!(ev.queue_id, 3);
    }
}
