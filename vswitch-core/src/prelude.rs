pub use crate::config::Params;
pub use crate::device::{EthDevice, SoftEthDevice};
pub use crate::error::Error;
pub use crate::eventdev::{EventDevice, SoftEventDevice};
pub use crate::eventq::ScheduleType;
pub use crate::graph::Streams;
#[doc(inline)]
pub use crate::node::{Node, NodeFlags, NodeInit};
pub use crate::packet::Mbuf;
pub use crate::vswitch::Vswitch;
pub use crate::Result;
