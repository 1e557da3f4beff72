use std::net::IpAddr;

use lru::LruCache;
use std::num::NonZeroUsize;

/// Bidirectional LRU cache: every live entry has a mirror in both maps.
/// `GetByDomain` and `GetByIP` both promote (touch) the entry in *both*
/// maps, matching `fakeip.Cache` in the original implementation.
#[derive(Debug)]
pub struct Cache {
    by_domain: LruCache<String, IpAddr>,
    by_addr: LruCache<IpAddr, String>,
}

impl Cache {
    pub fn new(size: usize) -> Self {
        let cap = NonZeroUsize::new(size).unwrap_or(NonZeroUsize::new(1).unwrap());
        Cache {
            by_domain: LruCache::new(cap),
            by_addr: LruCache::new(cap),
        }
    }

    pub fn insert(&mut self, name: String, addr: IpAddr) {
        self.by_domain.put(name.clone(), addr);
        self.by_addr.put(addr, name);
    }

    pub fn get_by_domain(&mut self, name: &str) -> Option<IpAddr> {
        let addr = *self.by_domain.get(name)?;
        self.by_addr.get(&addr);
        Some(addr)
    }

    pub fn get_by_addr(&mut self, addr: IpAddr) -> Option<String> {
        let name = self.by_addr.get(&addr)?.clone();
        self.by_domain.get(&name);
        Some(name)
    }

    pub fn remove_by_addr(&mut self, addr: IpAddr) {
        if let Some(name) = self.by_addr.pop(&addr) {
            self.by_domain.pop(&name);
        }
    }

    pub fn clear(&mut self) {
        self.by_domain.clear();
        self.by_addr.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn bijective_entries_mirror_each_other() {
        let mut c = Cache::new(10);
        c.insert("a.example".into(), addr(1));
        assert_eq!(c.get_by_domain("a.example"), Some(addr(1)));
        assert_eq!(c.get_by_addr(addr(1)), Some("a.example".to_string()));
    }

    #[test]
    fn lru_eviction_respects_touch_order() {
        let mut c = Cache::new(2);
        c.insert("a".into(), addr(1));
        c.insert("b".into(), addr(2));
        // touch "a" so it becomes most-recently-used.
        assert!(c.get_by_domain("a").is_some());
        c.insert("c".into(), addr(3));

        assert!(c.get_by_domain("a").is_some());
        assert!(c.get_by_domain("c").is_some());
        assert!(c.get_by_domain("b").is_none());
    }
}
