//! Deterministic synthetic-address allocation for the DNS hijacker.
//!
//! Mirrors `fakeip.Pool` from the original implementation: a cursor walks a
//! CIDR range, wrapping (and flagging `cycle`) once it reaches the end, with
//! a bidirectional LRU cache backing name<->address lookups.

mod cache;

use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use cache::Cache;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// A 128-bit address representation that IPv4 and IPv6 share, so the cursor
/// arithmetic is identical regardless of family. IPv4 addresses occupy the
/// low 32 bits of the v4-mapped form.
fn addr_to_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn u128_to_addr(bits: u128, is_v4: bool) -> IpAddr {
    if is_v4 {
        let v6 = std::net::Ipv6Addr::from(bits);
        IpAddr::V4(v6.to_ipv4_mapped().expect("v4-mapped bits"))
    } else {
        IpAddr::V6(std::net::Ipv6Addr::from(bits))
    }
}

/// Returns the prefix with all host bits set to one (the broadcast-equivalent
/// "last" address), matching `unMasked` in the original `fakeip/utils.go`.
fn broadcast(net: IpNet) -> IpAddr {
    let is_v4 = net.addr().is_ipv4();
    let bits = if is_v4 { net.prefix_len() + 96 } else { net.prefix_len() };
    let base = addr_to_u128(net.network());
    let host_mask: u128 = if bits >= 128 { 0 } else { !0u128 >> bits };
    u128_to_addr(base | host_mask, is_v4)
}

#[derive(Debug)]
struct PoolInner {
    first: u128,
    last: u128,
    offset: u128,
    cycle: bool,
    is_v4: bool,
    cache: Cache,
}

/// Allocates fake addresses from a CIDR prefix, with an LRU-bounded
/// bidirectional name<->address map.
#[derive(Debug)]
pub struct Pool {
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Builds a pool over `prefix`, holding up to `size` live mappings
    /// (0 maps to the default of 1000). Rejects prefixes with fewer than 2
    /// usable host addresses, matching the original's `first.Less(last)` check.
    pub fn new(prefix: IpNet, size: usize) -> Result<Self> {
        let is_v4 = prefix.addr().is_ipv4();
        let network = addr_to_u128(prefix.network());
        let gateway = network.wrapping_add(1);
        let first = gateway.wrapping_add(1);
        let last = addr_to_u128(broadcast(prefix));

        if first >= last {
            return Err(Error::config(format!(
                "prefix {prefix} has no usable host addresses"
            )));
        }

        let size = if size == 0 { DEFAULT_CACHE_SIZE } else { size };

        Ok(Pool {
            inner: Mutex::new(PoolInner {
                first,
                last,
                offset: first.wrapping_sub(1),
                cycle: false,
                is_v4,
                cache: Cache::new(size),
            }),
        })
    }

    /// Returns the existing mapping for `name`, or allocates the next
    /// address in the range, evicting the occupant of that slot first if the
    /// pool has cycled or the slot is otherwise occupied.
    pub fn get_ip(&self, name: &str) -> IpAddr {
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.cache.get_by_domain(name) {
            return addr;
        }

        inner.offset = inner.offset.wrapping_add(1);
        if inner.offset >= inner.last {
            inner.cycle = true;
            inner.offset = inner.first;
        }
        let is_v4 = inner.is_v4;
        let offset = inner.offset;
        let addr = u128_to_addr(offset, is_v4);

        let occupied = inner.cache.get_by_addr(addr).is_some();
        if inner.cycle || occupied {
            inner.cache.remove_by_addr(addr);
        }
        inner.cache.insert(name.to_string(), addr);
        addr
    }

    /// Looks up the domain behind a fake address, touching the LRU.
    pub fn get_domain(&self, addr: IpAddr) -> Option<String> {
        self.inner.lock().cache.get_by_addr(addr)
    }

    /// Empties both maps. Per the original Go `Pool.Clear`, the cursor and
    /// cycle flag are left untouched — only the cache is cleared.
    pub fn clear(&self) {
        self.inner.lock().cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str, size: usize) -> Pool {
        Pool::new(cidr.parse().unwrap(), size).unwrap()
    }

    #[test]
    fn ipv4_allocation_is_sequential() {
        let p = pool("192.168.0.0/24", 0);
        assert_eq!(p.get_ip("foo.com"), "192.168.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(p.get_ip("bar.com"), "192.168.0.3".parse::<IpAddr>().unwrap());
        assert_eq!(p.get_domain("192.168.0.3".parse().unwrap()), Some("bar.com".to_string()));
    }

    #[test]
    fn ipv6_allocation_is_sequential() {
        let p = pool("2001:4860:4860::8888/118", 0);
        assert_eq!(
            p.get_ip("foo.com"),
            "2001:4860:4860::8802".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            p.get_ip("bar.com"),
            "2001:4860:4860::8803".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn monotonic_within_a_single_cycle() {
        let p = pool("192.168.0.0/24", 0);
        let first: u128 = addr_to_u128("192.168.0.2".parse().unwrap());
        for i in 0..20u128 {
            let name = format!("host-{i}.example");
            let got = addr_to_u128(p.get_ip(&name));
            assert_eq!(got, first + i);
        }
    }

    #[test]
    fn cycling_reassigns_the_oldest_slot() {
        // /28 leaves 14 host addrs minus gateway/first offset quirks; with
        // cache size 10 the 11th distinct name forces eviction of "foo".
        let p = pool("192.168.0.16/28", 10);
        let foo_first = p.get_ip("foo");
        let bar_first = p.get_ip("bar");
        for i in 0..11 {
            p.get_ip(&format!("filler-{i}"));
        }
        let baz = p.get_ip("baz");
        assert_eq!(baz, foo_first);
        let foo_second = p.get_ip("foo");
        assert_eq!(foo_second, bar_first);
    }

    #[test]
    fn rejects_prefixes_without_usable_hosts() {
        let err = Pool::new("192.168.0.1/31".parse().unwrap(), 0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lru_hotness_protects_recently_touched_entries() {
        let p = pool("10.0.0.0/24", 2);
        let a = p.get_ip("a");
        let b = p.get_ip("b");
        // touch "a" via both lookup paths so it outlives "b".
        assert_eq!(p.get_ip("a"), a);
        let c = p.get_ip("c");

        assert_eq!(p.get_domain(a), Some("a".to_string()));
        assert_eq!(p.get_domain(c), Some("c".to_string()));
        assert_eq!(p.get_domain(b), None);
    }

    #[test]
    fn after_two_full_cycles_first_name_maps_elsewhere() {
        let p = pool("192.168.0.0/28", 4);
        let first_name = "first.example";
        let original = p.get_ip(first_name);
        // the /28 usable range holds 13 addresses; allocate well past two
        // full cycles so the cursor wraps at least twice.
        for i in 0..30 {
            p.get_ip(&format!("n{i}.example"));
        }
        let fresh = p.get_ip(first_name);
        assert_ne!(fresh, original);
    }
}
