use std::sync::{
    PoisonError, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use log::info;

use crate::Error;

/// Supplies the address for each connection attempt.
pub trait AddressSource: Send + Sync {
    /// Address for attempt number `attempt` of the current reconnect cycle,
    /// counting from zero. `None` when no address is known.
    fn next(&self, attempt: u32, last_error: Option<&Error>) -> Option<String>;

    /// Replaces the known members. Sources with a fixed address ignore this.
    fn refresh(&self, _members: Vec<String>) {}
}

/// Always the same address.
#[derive(Debug, Clone)]
pub struct SingleAddress(pub String);

impl AddressSource for SingleAddress {
    fn next(&self, _attempt: u32, _last_error: Option<&Error>) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Cycles through a list of addresses that discovery may replace.
#[derive(Debug, Default)]
pub struct RoundRobinAddresses {
    addresses: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

impl RoundRobinAddresses {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses: RwLock::new(addresses),
            cursor: AtomicUsize::new(0),
        }
    }

    /// A copy of the current list.
    pub fn snapshot(&self) -> Vec<String> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AddressSource for RoundRobinAddresses {
    fn next(&self, _attempt: u32, _last_error: Option<&Error>) -> Option<String> {
        let addresses = self.addresses.read().unwrap_or_else(PoisonError::into_inner);
        if addresses.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % addresses.len();
        Some(addresses[i].clone())
    }

    fn refresh(&self, members: Vec<String>) {
        info!("address list refreshed: {members:?}");
        *self.addresses.write().unwrap_or_else(PoisonError::into_inner) = members;
        self.cursor.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles() {
        let source = RoundRobinAddresses::new(vec!["a:1".into(), "b:2".into()]);
        let picked: Vec<_> = (0..4).filter_map(|i| source.next(i, None)).collect();
        assert_eq!(picked, vec!["a:1", "b:2", "a:1", "b:2"]);
    }

    #[test]
    fn refresh_replaces_members() {
        let source = RoundRobinAddresses::new(vec!["a:1".into()]);
        source.next(0, None);
        source.refresh(vec!["c:3".into(), "d:4".into()]);
        assert_eq!(source.snapshot(), vec!["c:3", "d:4"]);
        assert_eq!(source.next(0, None).as_deref(), Some("c:3"));
    }

    #[test]
    fn empty_list_yields_nothing() {
        let source = RoundRobinAddresses::new(Vec::new());
        assert!(source.next(0, None).is_none());

        let single = SingleAddress("x:1".into());
        single.refresh(vec!["y:2".into()]);
        assert_eq!(single.next(5, None).as_deref(), Some("x:1"));
    }
}
