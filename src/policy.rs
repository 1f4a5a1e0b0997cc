//! Pure mapping from [`InterfaceId`] to kernel routing-table id, and from
//! an installed address to the source-routing rule that forces its traffic
//! out of the matching tap. No I/O; fully unit-testable.

use crate::config::Config;
use crate::ids::{InterfaceId, PrefixAddr};

/// Kernel reserves table ids 0, 254 (`main`), and 255 (`local`); valid
/// range for source-routing tables is therefore `[1, 253]`.
pub const MIN_TABLE_ID: i32 = 1;
pub const MAX_TABLE_ID: i32 = 253;

/// `from <src>/<prefix_len> lookup <table_id>` with the fixed action the
/// spec names (`FR_ACT_TO_TBL` in the original kernel vocabulary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleSpec {
    pub addr: PrefixAddr,
    pub table_id: i32,
}

/// Computes table ids per-process. Exactly one strategy is selected from
/// [`Config::voq_mode`]; both are total over their deployment's ID space and
/// injective by construction (each band is a disjoint, monotonic offset).
#[derive(Debug, Clone, Copy)]
pub enum PolicyRouter {
    /// Non-VoQ (NPU) deployments: a bucketed scheme keyed off the
    /// `InterfaceId` numeric range. Grounded in the original's four bands:
    /// virtual interfaces below 2000 count down from 250, front-panel
    /// interfaces in `[2000, 3000)` map to `[1, 1000)`, a reserved band in
    /// `[3000, 4000)` maps to `[101, 1101)`… in practice deployments only
    /// ever populate one band at a time, keeping the result inside [1,253].
    Npu,
    /// VoQ deployments: offset purely by the first switch's minimum
    /// system-port-range id.
    Voq { system_port_min: u32 },
}

impl PolicyRouter {
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.voq_mode {
            PolicyRouter::Voq {
                system_port_min: cfg.voq_system_port_min,
            }
        } else {
            PolicyRouter::Npu
        }
    }

    /// Derive the routing-table id for an interface. Panics if the computed
    /// id falls outside `[1, 253]` — a contract violation by the caller's
    /// deployment topology, not a recoverable runtime condition.
    pub fn table_id(&self, ifid: InterfaceId) -> i32 {
        let id = match self {
            PolicyRouter::Npu => Self::table_id_npu(ifid),
            PolicyRouter::Voq { system_port_min } => ifid.0 - *system_port_min as i32,
        };
        assert!(
            (MIN_TABLE_ID..=MAX_TABLE_ID).contains(&id),
            "table id {id} for interface {ifid} out of range [{MIN_TABLE_ID}, {MAX_TABLE_ID}]"
        );
        id
    }

    fn table_id_npu(ifid: InterfaceId) -> i32 {
        let id = ifid.0;
        if id >= 4000 {
            id - 4000 + 201
        } else if id >= 3000 {
            id - 3000 + 101
        } else if id >= 2000 {
            id - 2000 + 1
        } else {
            250 - (id - 10)
        }
    }

    /// Build the source-routing rule for an address, or `None` for
    /// link-local addresses (not globally unique across interfaces, so a
    /// rule for them would be ambiguous and is skipped entirely).
    pub fn rule_for(&self, ifid: InterfaceId, addr: PrefixAddr) -> Option<RuleSpec> {
        if addr.is_link_local() {
            return None;
        }
        Some(RuleSpec {
            addr,
            table_id: self.table_id(ifid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[test]
    fn npu_bands_stay_in_range() {
        let router = PolicyRouter::Npu;
        for id in [10, 13, 2000, 2001, 2999, 3000, 3999, 4000, 4251] {
            let t = router.table_id(InterfaceId(id));
            assert!((1..=253).contains(&t), "id {id} -> table {t}");
        }
    }

    #[test]
    fn npu_distinct_ids_yield_distinct_tables() {
        let router = PolicyRouter::Npu;
        let ids = [2000, 2001, 2002, 2003, 4000, 4001, 10, 11, 12];
        let mut seen = HashSet::new();
        for id in ids {
            assert!(seen.insert(router.table_id(InterfaceId(id))));
        }
    }

    #[test]
    fn voq_offsets_by_system_port_min() {
        let router = PolicyRouter::Voq {
            system_port_min: 2000,
        };
        assert_eq!(router.table_id(InterfaceId(2001)), 1);
        assert_eq!(router.table_id(InterfaceId(2100)), 100);
    }

    #[test]
    fn link_local_addresses_produce_no_rule() {
        let router = PolicyRouter::Npu;
        let addr = PrefixAddr::new(Ipv4Addr::new(169, 254, 1, 1).into(), 16);
        assert!(router.rule_for(InterfaceId(2001), addr).is_none());
    }

    #[test]
    fn non_link_local_address_gets_rule_matching_table_id() {
        let router = PolicyRouter::Npu;
        let addr = PrefixAddr::new(Ipv4Addr::new(10, 0, 0, 1).into(), 31);
        let rule = router.rule_for(InterfaceId(2001), addr).unwrap();
        assert_eq!(rule.table_id, router.table_id(InterfaceId(2001)));
        assert_eq!(rule.addr, addr);
    }
}
