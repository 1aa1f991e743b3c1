use std::sync::Arc;

use crate::graph::{DispatchTable, Streams};
use crate::node::{Node, NodeInit};
use crate::packet::Mbuf;
use crate::Result;

/// Routes dequeued events to the next node of the core, or to the node
/// registered for the link queue they came in on.
pub struct Dispatcher {
    core: u16,
    table: Arc<DispatchTable>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            core: 0,
            table: Arc::default(),
        }
    }
}

impl Node for Dispatcher {
    fn init(&mut self, ctx: &mut NodeInit<'_>) -> Result<()> {
        self.core = ctx.core;
        self.table = ctx.dispatch.clone();

        log::debug!(
            "{} on core {} (mempool {})",
            ctx.name,
            ctx.core,
            self.table.pool().unwrap_or("-")
        );

        Ok(())
    }

    fn process(&mut self, out: &mut Streams<'_>, objs: Vec<Mbuf>) -> usize {
        let n = objs.len();
        for mbuf in objs {
            let edge = self.table.route(&mbuf, self.core);
            out.enqueue(edge, mbuf);
        }
        n
    }
}
