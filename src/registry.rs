//! Shared, short-critical-section lookup from host ifindex to the switch
//! interface it mirrors. Populated by the syncer as it creates/destroys tap
//! devices; read by the kernel observer to decide whether an event concerns
//! a core-owned interface at all (§4.D: "if ifindex is a known core-owned
//! tap").
//!
//! This is intentionally a separate, much smaller critical section than the
//! syncer's full `TapDevice` map (§5): readers here never need the device
//! itself, only the identity mapping, so they never compete with the
//! syncer's netlink mutations for the same lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::ids::InterfaceId;

pub type TapRegistry = Arc<RwLock<HashMap<i32, InterfaceId>>>;

pub fn new_registry() -> TapRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}
