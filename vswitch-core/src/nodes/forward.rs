use std::collections::HashMap;

use crate::graph::Streams;
use crate::node::{expect_data, Edge, Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

/// Sends each packet to the egress node registered for the link it was
/// received on.
pub struct Forward {
    next: HashMap<u16, Edge>,
}

impl Forward {
    const DROP: Edge = 0;

    pub fn new() -> Self {
        Self {
            next: HashMap::new(),
        }
    }
}

impl Node for Forward {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        let data = expect_data!(ctx, Forward);
        if data.next.is_empty() {
            log::warn!("{} has no egress, everything will be dropped", ctx.name);
        }
        self.next = data.next;
        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize {
        let n = objs.len();
        for mbuf in objs {
            let edge = self.next.get(&mbuf.port).copied().unwrap_or(Self::DROP);
            out.enqueue(edge, mbuf);
        }
        n
    }
}
