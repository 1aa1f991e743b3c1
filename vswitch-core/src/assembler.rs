//! Per-core graph assembly.
//!
//! For every enabled lcore the assembler sets up its event port, clones the
//! node templates the core's role needs, registers their contexts and
//! records the node patterns the core's graph is created from.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrayvec::ArrayVec;

use crate::device::EthDevice;
use crate::error::Error;
use crate::eventdev::{EventDevice, EventOp, EventType};
use crate::eventq::{ScheduleType, EV_PRIORITY_NORMAL};
use crate::graph::NodeRegistry;
use crate::lcore::{Lcore, GRAPH_MAX_PATTERNS};
use crate::link::LinkRegistry;
use crate::node::{EthRxData, EthTxData, EventRxData, EventTxData, ForwardData, NodeData, NodeId};
use crate::nodes::{DISPATCHER, ETHDEV_RX, ETHDEV_TX, EVENTDEV_RX, EVENTDEV_TX, FORWARD};
use crate::stage::LinkQueue;
use crate::Result;

type Patterns = ArrayVec<String, GRAPH_MAX_PATTERNS>;

/// Event queues in use, decided before any core is wired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePlan {
    /// Discipline each queue is provisioned with; producers stamp their
    /// events with it.
    pub types: BTreeMap<u8, ScheduleType>,
    /// Link queues whose packets RX stages put on each queue.
    pub origins: BTreeMap<u8, Vec<LinkQueue>>,
}

impl QueuePlan {
    pub fn nb_queues(&self) -> u8 {
        self.types.keys().next_back().map_or(0, |q| q + 1)
    }
}

pub struct Assembler<'a> {
    reg: &'a mut NodeRegistry,
    evdev: &'a Arc<dyn EventDevice>,
    links: &'a LinkRegistry,
    plan: &'a QueuePlan,
}

impl<'a> Assembler<'a> {
    pub fn new(
        reg: &'a mut NodeRegistry,
        evdev: &'a Arc<dyn EventDevice>,
        links: &'a LinkRegistry,
        plan: &'a QueuePlan,
    ) -> Self {
        Self {
            reg,
            evdev,
            links,
            plan,
        }
    }

    /// Wire the nodes of `lcore` and fill in its patterns and graph name.
    /// Disabled cores are left alone.
    pub fn populate(&mut self, lcore: &mut Lcore) -> Result<()> {
        if !lcore.enabled {
            return Ok(());
        }
        let Some(pipeline) = lcore.pipeline.clone() else {
            return Err(Error::invalid(format!("core {} has no pipeline", lcore.core_id)));
        };

        let dev_id = lcore.ev_id;
        let port = lcore.ev_port_id;
        let mut patterns = Patterns::new();

        self.evdev.port_setup(dev_id, port, &lcore.port_conf)?;

        if let Some(input) = pipeline.input() {
            self.evdev.port_link(dev_id, port, &[input.id])?;

            let rx = self
                .reg
                .clone_node(EVENTDEV_RX, &format!("{}-{}", port, input.id))?;
            self.reg.data_add(
                rx,
                NodeData::EventRx(EventRxData {
                    dev: self.evdev.clone(),
                    dev_id,
                    port,
                    pool: input.pool.clone(),
                    next: 0,
                }),
            )?;
            push(&mut patterns, self.name(rx)?)?;

            if pipeline.output().is_some() {
                self.reg.dispatcher_set_mempool(&input.pool);
                push(&mut patterns, DISPATCHER.to_string())?;
            } else {
                self.populate_egress(lcore, rx, &mut patterns)?;
            }
        }

        if let Some(output) = pipeline.output() {
            let tx = self
                .reg
                .clone_node(EVENTDEV_TX, &format!("{}-{}", port, output.id))?;
            let tx_name = self.name(tx)?;

            let (op, event_type) = match pipeline.input() {
                Some(_) => (EventOp::Forward, EventType::Cpu),
                None => (EventOp::New, EventType::EthDev),
            };
            let sched = self
                .plan
                .types
                .get(&output.id)
                .copied()
                .unwrap_or(output.schedule);

            self.reg.data_add(
                tx,
                NodeData::EventTx(EventTxData {
                    dev: self.evdev.clone(),
                    dev_id,
                    port,
                    op,
                    sched,
                    queue: output.id,
                    event_type,
                    sub_event_type: 0,
                    priority: EV_PRIORITY_NORMAL,
                }),
            )?;
            push(&mut patterns, tx_name.clone())?;

            if let Some(input) = pipeline.input() {
                self.reg.dispatcher_add_next(&tx_name, lcore.core_id)?;
                for lq in self.plan.origins.get(&input.id).into_iter().flatten() {
                    self.reg.dispatcher_set_next_ethdev(
                        &tx_name,
                        lcore.core_id,
                        lq.link_id,
                        lq.queue_id,
                    )?;
                }
            } else {
                for lq in &lcore.link_in_queues {
                    let rx = self.link_node(ETHDEV_RX, lq)?;
                    self.reg.edge_update(rx, &tx_name)?;
                    push(&mut patterns, self.name(rx)?)?;
                }
            }
        }

        for node in lcore.extra_nodes() {
            push(&mut patterns, node.to_string())?;
        }

        log::debug!(
            "core {} creates graph with patterns: {:?}",
            lcore.core_id,
            patterns
        );

        lcore.patterns = patterns;
        lcore.graph_name = format!("worker_{}", lcore.core_id);

        Ok(())
    }

    /// Forward node of a TX core and the link TX nodes it feeds. A packet
    /// received on link A leaves through the TX node of A's peer.
    fn populate_egress(&mut self, lcore: &Lcore, rx: NodeId, patterns: &mut Patterns) -> Result<()> {
        let fwd = self
            .reg
            .clone_node(FORWARD, &lcore.ev_port_id.to_string())?;
        let fwd_name = self.name(fwd)?;

        let next = self.reg.edge_update(rx, &fwd_name)?;
        if let Some(NodeData::EventRx(data)) = self.reg.data_mut(rx) {
            data.next = next;
        }
        push(patterns, fwd_name.clone())?;

        let mut table = ForwardData::default();
        for lq in &lcore.link_out_queues {
            let tx = self.link_node(ETHDEV_TX, lq)?;
            let tx_name = self.name(tx)?;
            push(patterns, tx_name.clone())?;

            match self.links.peer_of(lq.link_id) {
                Some(peer) => {
                    let edge = self.reg.edge_update(fwd, &tx_name)?;
                    table.next.insert(peer.id, edge);
                }
                None => log::warn!(
                    "{}: link {} has no peer, nothing is forwarded to it",
                    fwd_name,
                    lq.link_id
                ),
            }
        }
        self.reg.data_add(fwd, NodeData::Forward(table))?;

        Ok(())
    }

    /// Node polling or feeding one link queue. RX queues belong to exactly
    /// one core; TX nodes are shared by every core transmitting on the queue.
    fn link_node(&mut self, template: &str, lq: &LinkQueue) -> Result<NodeId> {
        let name = format!("{}-{}-{}", template, lq.link_id, lq.queue_id);
        if template == ETHDEV_TX {
            if let Some(id) = self.reg.node_from_name(&name) {
                return Ok(id);
            }
        }

        let dev = self.links.device().clone();
        let id = self
            .reg
            .clone_node(template, &format!("{}-{}", lq.link_id, lq.queue_id))?;
        let data = if template == ETHDEV_TX {
            NodeData::EthTx(EthTxData {
                dev,
                port: lq.link_id,
                queue: lq.queue_id,
            })
        } else {
            NodeData::EthRx(EthRxData {
                dev,
                port: lq.link_id,
                queue: lq.queue_id,
            })
        };
        self.reg.data_add(id, data)?;

        Ok(id)
    }

    fn name(&self, id: NodeId) -> Result<String> {
        self.reg
            .node_name(id)
            .map(str::to_string)
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }
}

fn push(patterns: &mut Patterns, pattern: String) -> Result<()> {
    patterns
        .try_push(pattern)
        .map_err(|e| Error::exhausted(format!("graph patterns ({})", e.element())))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::SoftEthDevice;
    use crate::eventdev::{EventDevConfig, EventTag, SoftEventDevice};
    use crate::eventq::QueueConf;
    use crate::graph::DispatchTable;
    use crate::link::LinkConfig;
    use crate::memory::{MemoryPool, PoolConfig, PoolRegistry};
    use crate::nodes;
    use crate::stage::{CoreMask, StageRegistry};

    struct Fixture {
        reg: NodeRegistry,
        soft: Arc<SoftEventDevice>,
        evdev: Arc<dyn EventDevice>,
        links: LinkRegistry,
        stages: StageRegistry,
    }

    fn fixture() -> Fixture {
        let mut pools = PoolRegistry::new();
        pools.add(PoolConfig::new("mp0")).unwrap();

        let eth: Arc<dyn EthDevice> = Arc::new(SoftEthDevice::new(&["eth0", "eth1"]));
        let mut links = LinkRegistry::new(eth);
        for name in ["eth0", "eth1"] {
            links
                .add(
                    LinkConfig {
                        name: name.to_string(),
                        nb_rxq: 1,
                        nb_txq: 1,
                        pool: "mp0".to_string(),
                    },
                    &pools,
                )
                .unwrap();
        }

        let soft = Arc::new(SoftEventDevice::new());
        soft.configure(
            0,
            &EventDevConfig {
                nb_event_queues: 2,
                nb_event_ports: 4,
                nb_events_limit: 4096,
                nb_event_queue_flows: 1024,
                nb_event_port_dequeue_depth: 128,
                nb_event_port_enqueue_depth: 128,
            },
        )
        .unwrap();
        for q in 0..2 {
            soft.queue_setup(0, q, &QueueConf::new(ScheduleType::Atomic))
                .unwrap();
        }

        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();

        Fixture {
            reg,
            evdev: soft.clone(),
            soft,
            links,
            stages: StageRegistry::new(CoreMask(0x1e)),
        }
    }

    fn lcore_of(f: &Fixture, stage: &str, core: u16, port: u8) -> Lcore {
        let mut lcore = Lcore::init(core, 0);
        lcore.populate(f.stages.get(stage).unwrap(), port).unwrap();
        lcore
    }

    #[test]
    fn test_rx_core() {
        let mut f = fixture();
        f.stages.add("rx", CoreMask(0x2)).unwrap();
        f.stages.set_role("rx", "rx").unwrap();
        f.stages
            .set_output_queue("rx", 0, ScheduleType::Atomic)
            .unwrap();
        f.stages
            .set_ingress_link_queue("rx", &f.links, "eth1", 0)
            .unwrap();

        let mut lcore = lcore_of(&f, "rx", 1, 0);
        let plan = QueuePlan {
            types: BTreeMap::from([(0, ScheduleType::Ordered)]),
            ..Default::default()
        };
        Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan)
            .populate(&mut lcore)
            .unwrap();

        assert_eq!(lcore.graph_name, "worker_1");
        assert_eq!(
            lcore.patterns.as_slice(),
            ["vs_eventdev_tx-0-0", "ethdev_rx-1-0"]
        );

        let rx = f.reg.node_from_name("ethdev_rx-1-0").unwrap();
        assert_eq!(f.reg.edges(rx).unwrap(), ["vs_eventdev_tx-0-0"]);

        let tx = f.reg.node_from_name("vs_eventdev_tx-0-0").unwrap();
        match f.reg.data_mut(tx) {
            Some(NodeData::EventTx(d)) => {
                assert_eq!(d.op, EventOp::New);
                assert_eq!(d.event_type, EventType::EthDev);
                // stamped with the queue's provisioned discipline
                assert_eq!(d.sched, ScheduleType::Ordered);
            }
            other => panic!("unexpected context {other:?}"),
        }
    }

    #[test]
    fn test_worker_core() {
        let mut f = fixture();
        f.stages.add("w", CoreMask(0x4)).unwrap();
        f.stages.set_role("w", "worker").unwrap();
        f.stages
            .set_input_queue("w", 0, ScheduleType::Ordered, "mp0")
            .unwrap();
        f.stages
            .set_output_queue("w", 1, ScheduleType::Atomic)
            .unwrap();
        f.stages.set_extra_graph_nodes("w", "pkt_drop").unwrap();

        let mut lcore = lcore_of(&f, "w", 2, 1);
        let plan = QueuePlan::default();
        Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan)
            .populate(&mut lcore)
            .unwrap();

        assert_eq!(
            lcore.patterns.as_slice(),
            [
                "vs_eventdev_rx-1-0",
                "vs_eventdev_dispatcher",
                "vs_eventdev_tx-1-1",
                "pkt_drop"
            ]
        );
        assert_eq!(f.soft.port_links(1).unwrap(), vec![0]);
        assert_eq!(f.reg.dispatch().pool(), Some("mp0"));

        let disp = f.reg.node_from_name(DISPATCHER).unwrap();
        assert_eq!(f.reg.edges(disp).unwrap(), ["pkt_drop", "vs_eventdev_tx-1-1"]);
    }

    #[test]
    fn test_worker_routes_link_origins() {
        let mut f = fixture();
        f.stages.add("w", CoreMask(0x4)).unwrap();
        f.stages.set_role("w", "worker").unwrap();
        f.stages
            .set_input_queue("w", 0, ScheduleType::Atomic, "mp0")
            .unwrap();
        f.stages
            .set_output_queue("w", 1, ScheduleType::Atomic)
            .unwrap();

        let mut lcore = lcore_of(&f, "w", 2, 1);
        let plan = QueuePlan {
            types: BTreeMap::from([(0, ScheduleType::Atomic), (1, ScheduleType::Atomic)]),
            origins: BTreeMap::from([(
                0,
                vec![LinkQueue {
                    link_id: 1,
                    queue_id: 0,
                }],
            )]),
        };
        Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan)
            .populate(&mut lcore)
            .unwrap();

        let pool = MemoryPool::create(PoolConfig::new("t")).unwrap();
        let tagged = |event_type, port| {
            let mut m = pool.alloc().unwrap();
            m.port = port;
            m.event = Some(EventTag {
                event_type,
                sub_event_type: 0,
                flow_id: 0,
                queue_id: 0,
                sched: ScheduleType::Atomic,
                priority: 0,
                hold: None,
            });
            m
        };

        // edge 1 is vs_eventdev_tx-1-1, behind the drop edge
        let table = f.reg.dispatch();
        assert_eq!(table.route(&tagged(EventType::EthDev, 1), 2), 1);
        assert_eq!(table.route(&tagged(EventType::Cpu, 0), 2), 1);
        assert_eq!(
            table.route(&tagged(EventType::EthDev, 0), 2),
            DispatchTable::DROP
        );
        assert_eq!(
            table.route(&tagged(EventType::EthDev, 1), 3),
            DispatchTable::DROP
        );
    }

    #[test]
    fn test_tx_core_forward_table() {
        let mut f = fixture();
        f.links.set_peer("eth0", "eth1").unwrap();

        f.stages.add("tx", CoreMask(0x8)).unwrap();
        f.stages.set_role("tx", "tx").unwrap();
        f.stages
            .set_input_queue("tx", 1, ScheduleType::Atomic, "mp0")
            .unwrap();
        f.stages
            .set_egress_link_queue("tx", &f.links, "eth0", 0)
            .unwrap();

        let mut lcore = lcore_of(&f, "tx", 3, 2);
        let plan = QueuePlan::default();
        Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan)
            .populate(&mut lcore)
            .unwrap();

        assert_eq!(
            lcore.patterns.as_slice(),
            ["vs_eventdev_rx-2-1", "vs_forward-2", "ethdev_tx-0-0"]
        );

        let rx = f.reg.node_from_name("vs_eventdev_rx-2-1").unwrap();
        match f.reg.data_mut(rx) {
            // edge 2, after the dispatcher and drop edges of the template
            Some(NodeData::EventRx(d)) => assert_eq!(d.next, 2),
            other => panic!("unexpected context {other:?}"),
        }

        let fwd = f.reg.node_from_name("vs_forward-2").unwrap();
        match f.reg.data_mut(fwd) {
            // packets received on eth1 leave through eth0
            Some(NodeData::Forward(d)) => assert_eq!(d.next.get(&1), Some(&1)),
            other => panic!("unexpected context {other:?}"),
        }
    }

    #[test]
    fn test_rx_queue_owned_by_one_core() {
        let mut f = fixture();
        f.stages.add("rx", CoreMask(0x6)).unwrap();
        f.stages.set_role("rx", "rx").unwrap();
        f.stages
            .set_output_queue("rx", 0, ScheduleType::Atomic)
            .unwrap();
        f.stages
            .set_ingress_link_queue("rx", &f.links, "eth0", 0)
            .unwrap();

        let mut first = lcore_of(&f, "rx", 1, 0);
        let mut second = lcore_of(&f, "rx", 2, 1);
        let plan = QueuePlan::default();
        let mut asm = Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan);

        asm.populate(&mut first).unwrap();
        assert!(matches!(
            asm.populate(&mut second),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_too_many_patterns() {
        let mut f = fixture();
        f.stages.add("w", CoreMask(0x4)).unwrap();
        f.stages.set_role("w", "worker").unwrap();
        f.stages
            .set_input_queue("w", 0, ScheduleType::Atomic, "mp0")
            .unwrap();
        f.stages
            .set_output_queue("w", 1, ScheduleType::Atomic)
            .unwrap();
        let extra = vec!["pkt_drop"; GRAPH_MAX_PATTERNS].join(",");
        f.stages.set_extra_graph_nodes("w", &extra).unwrap();

        let mut lcore = lcore_of(&f, "w", 2, 0);
        let plan = QueuePlan::default();
        assert!(matches!(
            Assembler::new(&mut f.reg, &f.evdev, &f.links, &plan).populate(&mut lcore),
            Err(Error::ResourceExhausted(_))
        ));
    }
}
