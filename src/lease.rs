use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::addr::{ipv4_to_wire, MacAddr};
use crate::subnet::SubnetId;

/// Opaque client identifier carried in DHCP requests. Empty means the client
/// sent none.
pub type ClientId = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Normal,
    Declined,
    ExpiredReclaimed,
}

impl LeaseState {
    pub fn from_db(state: i32) -> Self {
        match state {
            1 => LeaseState::Declined,
            2 => LeaseState::ExpiredReclaimed,
            _ => LeaseState::Normal,
        }
    }

    pub fn as_db(self) -> i32 {
        match self {
            LeaseState::Normal => 0,
            LeaseState::Declined => 1,
            LeaseState::ExpiredReclaimed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub addr: Ipv4Addr,
    pub subnet_id: SubnetId,
    pub state: LeaseState,
    pub mac: Option<MacAddr>,
    pub client_id: ClientId,
    pub host_name: String,
    pub client_last_trans_time: DateTime<Utc>,
    pub valid_life_time: Duration,
    pub renew_time: Duration,
    pub rebind_time: Duration,
}

impl Lease {
    pub fn expired_at(&self) -> DateTime<Utc> {
        self.client_last_trans_time + chrono::Duration::seconds(self.valid_life_time.as_secs() as i64)
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at() < Utc::now()
    }

    /// A declined copy occupies the address but belongs to no client.
    pub fn decline(&self) -> Lease {
        let mut declined = self.clone();
        declined.state = LeaseState::Declined;
        declined.client_last_trans_time = Utc::now();
        declined.mac = None;
        declined.client_id = ClientId::new();
        declined
    }
}

/// Outcome of one lease request, in the integer forms the response wire
/// format uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseResult {
    pub succeed: bool,
    pub addr: u32,
    pub subnet_id: u32,
}

impl LeaseResult {
    pub fn with_lease(lease: &Lease) -> Self {
        Self {
            succeed: true,
            addr: ipv4_to_wire(lease.addr),
            subnet_id: lease.subnet_id,
        }
    }

    /// Acknowledges an operation that yields no address (release, decline).
    pub fn succeeded() -> Self {
        Self {
            succeed: true,
            addr: 0,
            subnet_id: 0,
        }
    }

    /// The subnet id 1 keeps the encoded payload non-empty.
    pub fn failed() -> Self {
        Self {
            succeed: false,
            addr: 0,
            subnet_id: 1,
        }
    }
}
