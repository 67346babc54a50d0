use std::net::Ipv4Addr;

use crate::subnet::Subnet;

/// Linear-probing address cursor over a subnet's pool list. The engine skips
/// unusable candidates by calling again, up to the subnet's capacity.
#[derive(Debug, Default)]
pub struct IterativeAllocator {
    last_picked: u32,
}

impl IterativeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick_addr(&mut self, subnet: &Subnet) -> Option<Ipv4Addr> {
        let pools = &subnet.pools;
        let first = pools.first()?;

        if self.last_picked == 0 {
            self.last_picked = first.start;
            return Some(Ipv4Addr::from(first.start));
        }

        let cursor = self.last_picked;
        let Some(index) = pools.iter().position(|pool| pool.contains_val(cursor)) else {
            // pools were edited out from under the cursor
            self.last_picked = first.start;
            return Some(Ipv4Addr::from(first.start));
        };

        let next = cursor.wrapping_add(1);
        if pools[index].contains_val(next) {
            self.last_picked = next;
            return Some(Ipv4Addr::from(next));
        }

        let next_pool = &pools[(index + 1) % pools.len()];
        self.last_picked = next_pool.start;
        Some(Ipv4Addr::from(next_pool.start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subnet::{Pool, DEFAULT_REBIND_TIME, DEFAULT_RENEW_TIME, DEFAULT_VALID_LIFE_TIME};

    fn subnet_with_pools(pools: Vec<Pool>) -> Subnet {
        Subnet {
            id: 1,
            renew_time: DEFAULT_RENEW_TIME,
            rebind_time: DEFAULT_REBIND_TIME,
            valid_life_time: DEFAULT_VALID_LIFE_TIME,
            pools,
            reserved_pools: Vec::new(),
        }
    }

    #[test]
    fn wraps_over_both_pools_forever() {
        let subnet = subnet_with_pools(vec![
            Pool::parse("192.0.0.1-192.0.0.5").unwrap(),
            Pool::parse("192.127.0.1-192.127.0.5").unwrap(),
        ]);
        let mut allocator = IterativeAllocator::new();

        for _ in 0..1000 {
            for last in 1..=5u8 {
                assert_eq!(
                    allocator.pick_addr(&subnet),
                    Some(Ipv4Addr::new(192, 0, 0, last))
                );
            }
            for last in 1..=5u8 {
                assert_eq!(
                    allocator.pick_addr(&subnet),
                    Some(Ipv4Addr::new(192, 127, 0, last))
                );
            }
        }
    }

    #[test]
    fn picked_addresses_lie_in_some_pool() {
        let subnet = subnet_with_pools(vec![
            Pool::parse("10.0.0.250-10.0.1.2").unwrap(),
            Pool::parse("10.9.0.1-10.9.0.3").unwrap(),
        ]);
        let mut allocator = IterativeAllocator::new();
        for _ in 0..(subnet.capacity() * 3) {
            let addr = allocator.pick_addr(&subnet).unwrap();
            assert!(
                subnet.pools.iter().any(|pool| pool.contains(addr)),
                "{addr} escaped the pools"
            );
        }
    }

    #[test]
    fn resets_when_pools_change() {
        let mut allocator = IterativeAllocator::new();
        let first = subnet_with_pools(vec![Pool::parse("10.0.0.1-10.0.0.5").unwrap()]);
        assert_eq!(
            allocator.pick_addr(&first),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );

        // cursor now points into a range that no longer exists
        let replaced = subnet_with_pools(vec![Pool::parse("10.5.0.1-10.5.0.5").unwrap()]);
        assert_eq!(
            allocator.pick_addr(&replaced),
            Some(Ipv4Addr::new(10, 5, 0, 1))
        );
        assert_eq!(
            allocator.pick_addr(&replaced),
            Some(Ipv4Addr::new(10, 5, 0, 2))
        );
    }

    #[test]
    fn empty_subnet_yields_nothing() {
        let mut allocator = IterativeAllocator::new();
        assert_eq!(allocator.pick_addr(&subnet_with_pools(Vec::new())), None);
    }
}
