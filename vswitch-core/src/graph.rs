//! Node registry and per-core graphs.
//!
//! Building a graph is two-phase: nodes are registered and cloned into the
//! registry arena with their edges named, then [`NodeRegistry::create_graph`]
//! picks the nodes matching a pattern list and resolves edge names into
//! graph-local indices. Contexts registered for the picked nodes move into
//! the graph by copy and are handed to the nodes by [`Graph::init`], so a
//! node shared by several cores gets one context per graph.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::capture::Capture;
use crate::error::Error;
use crate::eventdev::EventType;
use crate::node::{Edge, Node, NodeBuildFn, NodeData, NodeFlags, NodeId, NodeInit, NODE_NAME_MAX_LEN};
use crate::nodes::{DISPATCHER, PKT_DROP};
use crate::packet::Mbuf;
use crate::Result;

/// Next hops of the shared dispatcher node, per core.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    by_link: HashMap<(u16, u16, u16), Edge>,
    by_core: HashMap<u16, Edge>,
    pool: Option<String>,
}

impl DispatchTable {
    pub const DROP: Edge = 0;

    /// Edge for a packet dequeued on `core`. Packets fresh from a link take
    /// the route registered for their origin (port, queue), packets from a
    /// worker the route of the core. Anything else is dropped.
    pub fn route(&self, mbuf: &Mbuf, core: u16) -> Edge {
        match mbuf.event.map(|tag| tag.event_type) {
            Some(EventType::EthDev) => self.by_link.get(&(core, mbuf.port, mbuf.queue)).copied(),
            Some(EventType::Cpu) => self.by_core.get(&core).copied(),
            None => None,
        }
        .unwrap_or(Self::DROP)
    }

    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }
}

#[derive(Clone)]
struct NodeEntry {
    name: String,
    parent: Option<NodeId>,
    flags: NodeFlags,
    edges: Vec<String>,
    build: NodeBuildFn,
}

/// Node templates, their clones and the contexts registered for them.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeEntry>,
    by_name: HashMap<String, NodeId>,
    data: HashMap<NodeId, NodeData>,
    dispatch: Arc<DispatchTable>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, N>(
        &mut self,
        name: &str,
        flags: NodeFlags,
        edges: &[&str],
        build: F,
    ) -> Result<NodeId>
    where
        F: Fn() -> N + Send + Sync + 'static,
        N: Node + 'static,
    {
        let build: NodeBuildFn = Arc::new(move || -> Box<dyn Node> { Box::new(build()) });
        self.insert(NodeEntry {
            name: name.to_string(),
            parent: None,
            flags,
            edges: edges.iter().map(|e| e.to_string()).collect(),
            build,
        })
    }

    /// Copy a template node under the name `<template>-<suffix>`.
    pub fn clone_node(&mut self, template: &str, suffix: &str) -> Result<NodeId> {
        let parent = self.lookup(template)?;
        let entry = &self.nodes[parent.0 as usize];
        if entry.parent.is_some() {
            return Err(Error::invalid(format!("{template} is itself a clone")));
        }

        let clone = NodeEntry {
            name: format!("{template}-{suffix}"),
            parent: Some(parent),
            ..entry.clone()
        };
        self.insert(clone)
    }

    fn insert(&mut self, entry: NodeEntry) -> Result<NodeId> {
        if entry.name.is_empty() || entry.name.len() >= NODE_NAME_MAX_LEN {
            return Err(Error::invalid(format!("node name '{}'", entry.name)));
        }
        if self.by_name.contains_key(&entry.name) {
            return Err(Error::exists(entry.name));
        }

        let id = NodeId(self.nodes.len() as u32);
        self.by_name.insert(entry.name.clone(), id);
        self.nodes.push(entry);

        Ok(id)
    }

    /// Add `next` as an edge of `id`, returning its index. An existing edge
    /// to the same node is reused.
    pub fn edge_update(&mut self, id: NodeId, next: &str) -> Result<Edge> {
        self.lookup(next)?;
        let entry = self.entry_mut(id)?;

        let edge = match entry.edges.iter().position(|e| e == next) {
            Some(pos) => pos,
            None => {
                entry.edges.push(next.to_string());
                entry.edges.len() - 1
            }
        };

        Ok(edge as Edge)
    }

    pub fn edge_count(&self, id: NodeId) -> Result<u16> {
        Ok(self.entry(id)?.edges.len() as u16)
    }

    pub fn edges(&self, id: NodeId) -> Result<&[String]> {
        Ok(&self.entry(id)?.edges)
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id.0 as usize).map(|e| e.name.as_str())
    }

    pub fn node_from_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn lookup(&self, name: &str) -> Result<NodeId> {
        self.node_from_name(name)
            .ok_or_else(|| Error::not_found(format!("node {name}")))
    }

    pub fn data_add(&mut self, id: NodeId, data: NodeData) -> Result<()> {
        let name = self.entry(id)?.name.clone();
        if self.data.contains_key(&id) {
            return Err(Error::exists(format!("context of node {name}")));
        }
        self.data.insert(id, data);
        Ok(())
    }

    pub fn data_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.data.get_mut(&id)
    }

    pub fn data_remove(&mut self, id: NodeId) -> Result<NodeData> {
        self.data
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("context of node {id}")))
    }

    /// Route packets of `core` to `next`.
    pub fn dispatcher_add_next(&mut self, next: &str, core: u16) -> Result<()> {
        let id = self.lookup(DISPATCHER)?;
        let edge = self.edge_update(id, next)?;
        Arc::make_mut(&mut self.dispatch).by_core.insert(core, edge);
        Ok(())
    }

    /// Route packets of `core` received on (`port`, `queue`) to `next`.
    pub fn dispatcher_set_next_ethdev(
        &mut self,
        next: &str,
        core: u16,
        port: u16,
        queue: u16,
    ) -> Result<()> {
        let id = self.lookup(DISPATCHER)?;
        let edge = self.edge_update(id, next)?;
        Arc::make_mut(&mut self.dispatch)
            .by_link
            .insert((core, port, queue), edge);
        Ok(())
    }

    pub fn dispatcher_set_mempool(&mut self, pool: &str) {
        Arc::make_mut(&mut self.dispatch).pool = Some(pool.to_string());
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// Build the graph of `core` from the nodes matching `patterns`
    /// (`*` and `?` wildcards). The drop node is always part of a graph.
    pub fn create_graph(&mut self, name: &str, core: u16, patterns: &[String]) -> Result<Graph> {
        let mut picked: Vec<NodeId> = vec![self.lookup(PKT_DROP)?];

        for pattern in patterns {
            let mut matched = false;
            for (i, entry) in self.nodes.iter().enumerate() {
                if glob_match(pattern.as_bytes(), entry.name.as_bytes()) {
                    matched = true;
                    let id = NodeId(i as u32);
                    if !picked.contains(&id) {
                        picked.push(id);
                    }
                }
            }
            if !matched {
                return Err(Error::not_found(format!("node pattern '{pattern}'")));
            }
        }

        let index: HashMap<NodeId, usize> = picked.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let drop = 0;

        let mut nodes = Vec::with_capacity(picked.len());
        let mut sources = SmallVec::new();

        for (idx, &id) in picked.iter().enumerate() {
            let entry = &self.nodes[id.0 as usize];

            let edges = entry
                .edges
                .iter()
                .map(|next| {
                    match self.by_name.get(next).and_then(|nid| index.get(nid)) {
                        Some(&target) => target,
                        None => {
                            log::debug!(
                                "graph {}: edge {} -> {} leaves the graph, dropping",
                                name,
                                entry.name,
                                next
                            );
                            drop
                        }
                    }
                })
                .collect();

            if entry.flags.contains(NodeFlags::SOURCE) {
                sources.push(idx);
            }

            nodes.push(GraphNode {
                id,
                name: entry.name.clone(),
                node: (entry.build)(),
                edges,
                data: self.data.get(&id).cloned(),
                stats: Arc::new(NodeStats::default()),
            });
        }

        log::debug!(
            "graph {} on core {}: {:?}",
            name,
            core,
            nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>()
        );

        Ok(Graph {
            name: name.to_string(),
            core,
            buffers: (0..nodes.len()).map(|_| Vec::new()).collect(),
            nodes,
            pending: VecDeque::new(),
            sources,
            drop,
            dispatch: self.dispatch.clone(),
            capture: None,
            ready: false,
        })
    }

    fn entry(&self, id: NodeId) -> Result<&NodeEntry> {
        self.nodes
            .get(id.0 as usize)
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::not_found(format!("node {id}")))
    }
}

fn glob_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], name) || (!name.is_empty() && glob_match(pattern, &name[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => glob_match(&pattern[1..], &name[1..]),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct NodeStats {
    calls: AtomicU64,
    objs: AtomicU64,
}

impl NodeStats {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn objs(&self) -> u64 {
        self.objs.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatsSnapshot {
    pub node: String,
    pub calls: u64,
    pub objs: u64,
}

/// Counters of a graph, readable while its worker runs.
#[derive(Debug, Clone)]
pub struct GraphStats {
    pub graph: String,
    pub core: u16,
    nodes: Vec<(String, Arc<NodeStats>)>,
}

impl GraphStats {
    pub fn snapshot(&self) -> Vec<NodeStatsSnapshot> {
        self.nodes
            .iter()
            .map(|(name, s)| NodeStatsSnapshot {
                node: name.clone(),
                calls: s.calls(),
                objs: s.objs(),
            })
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<&NodeStats> {
        self.nodes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_ref())
    }
}

struct GraphNode {
    id: NodeId,
    name: String,
    node: Box<dyn Node>,
    edges: SmallVec<[usize; 4]>,
    data: Option<NodeData>,
    stats: Arc<NodeStats>,
}

pub struct Graph {
    name: String,
    core: u16,
    nodes: Vec<GraphNode>,
    buffers: Vec<Vec<Mbuf>>,
    pending: VecDeque<usize>,
    sources: SmallVec<[usize; 8]>,
    drop: usize,
    dispatch: Arc<DispatchTable>,
    capture: Option<Capture>,
    ready: bool,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core(&self) -> u16 {
        self.core
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// Write the first `limit` packets handed to any node to `path`.
    pub fn enable_capture(&mut self, path: &Path, limit: usize) -> Result<()> {
        self.capture = Some(Capture::create(path, limit)?);
        Ok(())
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            graph: self.name.clone(),
            core: self.core,
            nodes: self
                .nodes
                .iter()
                .map(|n| (n.name.clone(), n.stats.clone()))
                .collect(),
        }
    }

    /// Hand every node its context. Fails when a node needs a context that
    /// was never registered.
    pub fn init(&mut self) -> Result<()> {
        for n in &mut self.nodes {
            let mut ctx = NodeInit {
                id: n.id,
                name: &n.name,
                graph: &self.name,
                core: self.core,
                dispatch: &self.dispatch,
                data: n.data.take(),
            };
            n.node.init(&mut ctx)?;
        }
        self.ready = true;

        Ok(())
    }

    /// Poll the source nodes once and run everything they produced to
    /// completion. Returns the number of objects handled.
    pub fn walk(&mut self) -> usize {
        debug_assert!(self.ready, "graph {} walked before init", self.name);

        let mut total = 0;

        for i in 0..self.sources.len() {
            let idx = self.sources[i];
            total += self.run(idx, Vec::new());
        }

        while let Some(idx) = self.pending.pop_front() {
            let objs = std::mem::take(&mut self.buffers[idx]);
            if !objs.is_empty() {
                total += self.run(idx, objs);
            }
        }

        total
    }

    fn run(&mut self, idx: usize, objs: Vec<Mbuf>) -> usize {
        if !objs.is_empty() {
            self.capture(&objs);
        }

        let Graph {
            nodes,
            buffers,
            pending,
            drop,
            ..
        } = self;
        let n = &mut nodes[idx];

        let mut out = Streams {
            edges: &n.edges,
            buffers,
            pending,
            drop: *drop,
        };
        let handled = n.node.process(&mut out, objs);

        if handled > 0 {
            n.stats.calls.fetch_add(1, Ordering::Relaxed);
            n.stats.objs.fetch_add(handled as u64, Ordering::Relaxed);
        }

        handled
    }

    fn capture(&mut self, objs: &[Mbuf]) {
        let Some(cap) = &mut self.capture else {
            return;
        };
        if let Err(e) = cap.record(objs) {
            log::warn!("graph {}: capture to {} failed: {}", self.name, cap.path().display(), e);
            self.capture = None;
        } else if cap.is_full() {
            log::info!("graph {}: capture to {} complete", self.name, cap.path().display());
            self.capture = None;
        }
    }
}

/// Output side of a node while it is being processed.
pub struct Streams<'a> {
    edges: &'a [usize],
    buffers: &'a mut [Vec<Mbuf>],
    pending: &'a mut VecDeque<usize>,
    drop: usize,
}

impl Streams<'_> {
    /// Pass `mbuf` along `edge`; an unknown edge leads to the drop node.
    pub fn enqueue(&mut self, edge: Edge, mbuf: Mbuf) {
        let target = self.edges.get(edge as usize).copied().unwrap_or(self.drop);
        let buf = &mut self.buffers[target];
        if buf.is_empty() {
            self.pending.push_back(target);
        }
        buf.push(mbuf);
    }

    pub fn enqueue_burst<I>(&mut self, edge: Edge, objs: I)
    where
        I: IntoIterator<Item = Mbuf>,
    {
        for mbuf in objs {
            self.enqueue(edge, mbuf);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eventdev::EventTag;
    use crate::eventq::ScheduleType;
    use crate::memory::{MemoryPool, PoolConfig};
    use crate::nodes;

    struct Source {
        pool: MemoryPool,
        left: usize,
    }

    impl Node for Source {
        fn process(&mut self, out: &mut Streams<'_>, _objs: Vec<Mbuf>) -> usize {
            let mut n = 0;
            while self.left > 0 {
                out.enqueue(0, self.pool.alloc().unwrap());
                self.left -= 1;
                n += 1;
            }
            n
        }
    }

    struct Relay;

    impl Node for Relay {
        fn process(&mut self, out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize {
            let n = objs.len();
            out.enqueue_burst(0, objs);
            n
        }
    }

    fn registry(pool: &MemoryPool, count: usize) -> NodeRegistry {
        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();

        let pool = pool.clone();
        reg.register("src", NodeFlags::SOURCE, &["relay"], move || Source {
            pool: pool.clone(),
            left: count,
        })
        .unwrap();
        reg.register("relay", NodeFlags::empty(), &["sink"], || Relay)
            .unwrap();
        reg
    }

    #[test]
    fn test_glob() {
        assert!(glob_match(b"ethdev_rx-*", b"ethdev_rx-0-1"));
        assert!(glob_match(b"*", b"pkt_drop"));
        assert!(glob_match(b"vs_?orward", b"vs_forward"));
        assert!(!glob_match(b"ethdev_tx-*", b"ethdev_rx-0-1"));
        assert!(!glob_match(b"pkt", b"pkt_drop"));
    }

    #[test]
    fn test_clone_and_edges() {
        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();

        let id = reg.clone_node("vs_forward", "3").unwrap();
        assert_eq!(reg.node_name(id), Some("vs_forward-3"));
        assert_eq!(reg.node_from_name("vs_forward-3"), Some(id));
        assert!(matches!(
            reg.clone_node("vs_forward", "3"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(reg.clone_node("vs_forward-3", "x").is_err());

        // edges are inherited from the template
        assert_eq!(reg.edge_count(id).unwrap(), 1);
        assert_eq!(reg.edge_update(id, "pkt_drop").unwrap(), 0);
        assert!(matches!(
            reg.edge_update(id, "nowhere"),
            Err(Error::NotFound(_))
        ));
    }

    struct Tagged {
        pool: MemoryPool,
        pending: Vec<(Option<EventType>, u16, u16)>,
    }

    impl Node for Tagged {
        fn process(&mut self, out: &mut Streams<'_>, _objs: Vec<Mbuf>) -> usize {
            let n = self.pending.len();
            for (event_type, port, queue) in self.pending.drain(..) {
                let mut m = self.pool.alloc().unwrap();
                m.port = port;
                m.queue = queue;
                m.event = event_type.map(|event_type| EventTag {
                    event_type,
                    sub_event_type: 0,
                    flow_id: 0,
                    queue_id: 0,
                    sched: ScheduleType::Atomic,
                    priority: 0,
                    hold: None,
                });
                out.enqueue(0, m);
            }
            n
        }
    }

    struct Sink;

    impl Node for Sink {
        fn process(&mut self, _out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize {
            objs.len()
        }
    }

    #[test]
    fn test_dispatcher_routes_and_drops() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();

        let src_pool = pool.clone();
        reg.register("src", NodeFlags::SOURCE, &[DISPATCHER], move || Tagged {
            pool: src_pool.clone(),
            pending: vec![
                (Some(EventType::EthDev), 0, 1),
                // no route for this origin
                (Some(EventType::EthDev), 0, 0),
                (Some(EventType::Cpu), 0, 0),
                (None, 0, 1),
            ],
        })
        .unwrap();
        reg.register("from_link", NodeFlags::empty(), &[], || Sink).unwrap();
        reg.register("from_cpu", NodeFlags::empty(), &[], || Sink).unwrap();

        reg.dispatcher_set_next_ethdev("from_link", 2, 0, 1).unwrap();
        reg.dispatcher_add_next("from_cpu", 2).unwrap();
        // routes of another core are not taken
        reg.dispatcher_set_next_ethdev("from_cpu", 3, 0, 0).unwrap();

        let patterns: Vec<String> = ["src", DISPATCHER, "from_*"].map(String::from).into();
        let mut g = reg.create_graph("worker_2", 2, &patterns).unwrap();
        g.init().unwrap();
        g.walk();

        let stats = g.stats();
        assert_eq!(stats.node("from_link").unwrap().objs(), 1);
        assert_eq!(stats.node("from_cpu").unwrap().objs(), 1);
        assert_eq!(stats.node(PKT_DROP).unwrap().objs(), 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_unmatched_pattern() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut reg = registry(&pool, 1);
        assert!(matches!(
            reg.create_graph("g", 1, &["nope-*".to_string()]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_edge_out_of_graph_goes_to_drop() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut reg = registry(&pool, 3);

        // "sink" is not registered, "relay" forwards to it
        let mut g = reg
            .create_graph("g", 1, &["src".to_string(), "relay".to_string()])
            .unwrap();
        g.init().unwrap();

        assert_eq!(g.walk(), 9);
        let stats = g.stats();
        assert_eq!(stats.node("relay").unwrap().objs(), 3);
        assert_eq!(stats.node(PKT_DROP).unwrap().objs(), 3);
        assert_eq!(pool.in_use(), 0);

        assert_eq!(g.walk(), 0);
        assert_eq!(stats.node("src").unwrap().calls(), 1);
    }

    #[test]
    fn test_capture_first_packets() {
        let pool = MemoryPool::create(PoolConfig::new("mp0")).unwrap();
        let mut reg = registry(&pool, 3);
        let path = std::env::temp_dir().join(format!("vswitch-graph-{}.pcap", std::process::id()));

        let mut g = reg
            .create_graph("g", 1, &["src".to_string(), "relay".to_string()])
            .unwrap();
        g.enable_capture(&path, 4).unwrap();
        g.init().unwrap();

        // three packets into relay, the first one of them again into drop
        assert_eq!(g.walk(), 9);
        assert!(g.capture.is_none());
        drop(g);

        let file = std::fs::File::open(&path).unwrap();
        let mut reader = pcap_file::pcap::PcapReader::new(file).unwrap();
        let mut n = 0;
        while let Some(pkt) = reader.next_packet() {
            pkt.unwrap();
            n += 1;
        }
        assert_eq!(n, 4);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_context_fails_init() {
        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();
        reg.clone_node("vs_forward", "1").unwrap();

        let mut g = reg
            .create_graph("g", 1, &["vs_forward-1".to_string()])
            .unwrap();
        assert!(matches!(g.init(), Err(Error::Wiring(name)) if name == "vs_forward-1"));
    }

    #[test]
    fn test_context_copied_into_each_graph() {
        let mut reg = NodeRegistry::new();
        nodes::register_builtin(&mut reg).unwrap();
        let id = reg.clone_node("vs_forward", "1").unwrap();
        reg.data_add(id, NodeData::Forward(Default::default()))
            .unwrap();
        assert!(reg.data_add(id, NodeData::Forward(Default::default())).is_err());

        for core in [1, 2] {
            let mut g = reg
                .create_graph(&format!("worker_{core}"), core, &["vs_forward-*".to_string()])
                .unwrap();
            g.init().unwrap();
        }

        assert_eq!(reg.data_remove(id).unwrap().kind(), "forward");
        assert!(matches!(reg.data_remove(id), Err(Error::NotFound(_))));
    }
}
