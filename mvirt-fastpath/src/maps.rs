//! Tables shared by every hook on a node.

use crate::arp::ArpTable;
use crate::conntrack::ConnTrack;
use crate::failsafe::FailsafeTable;
use crate::nat::{NatTable, SocketNatTable};
use crate::routes::RouteTable;
use std::sync::Arc;

#[derive(Default)]
pub struct Maps {
    pub conntrack: Arc<ConnTrack>,
    pub nat: NatTable,
    pub ct_nats: SocketNatTable,
    pub routes: RouteTable,
    pub arp: ArpTable,
    pub failsafe: FailsafeTable,
}

impl Maps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ct_capacity(capacity: usize) -> Self {
        Self {
            conntrack: Arc::new(ConnTrack::with_capacity(capacity)),
            ..Self::default()
        }
    }
}
