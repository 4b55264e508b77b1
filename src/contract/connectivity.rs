//! Snapshot of which servers can reach which

use super::ids::ServerId;
use std::collections::BTreeSet;

/// `(a, b)` present means `a` reports it can reach `b`.
///
/// `(a, a)` is present exactly when the coordinator hears from `a` at all. When it
/// does not, `a` is assumed to see everyone, so the coordinator's own
/// disconnection does not look like a failure of `a`'s peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityMap {
    links: BTreeSet<(ServerId, ServerId)>,
}

impl ConnectivityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links(links: impl IntoIterator<Item = (ServerId, ServerId)>) -> Self {
        Self {
            links: links.into_iter().collect(),
        }
    }

    /// Every server in `servers` sees every other one.
    pub fn fully_connected<'a>(servers: impl IntoIterator<Item = &'a ServerId>) -> Self {
        let servers: Vec<ServerId> = servers.into_iter().copied().collect();
        let mut map = Self::new();
        for a in &servers {
            for b in &servers {
                map.connect(*a, *b);
            }
        }
        map
    }

    pub fn connect(&mut self, from: ServerId, to: ServerId) {
        self.links.insert((from, to));
    }

    /// Cut every link to and from `server`, including its report of itself.
    pub fn isolate(&mut self, server: &ServerId) {
        self.links.retain(|(a, b)| a != server && b != server);
    }

    pub fn can_see(&self, observer: &ServerId, target: &ServerId) -> bool {
        observer == target
            || self.links.contains(&(*observer, *target))
            || !self.links.contains(&(*observer, *observer))
    }

    /// Is `target` seen by a strict majority of `group`?
    pub fn seen_by_majority(&self, target: &ServerId, group: &BTreeSet<ServerId>) -> bool {
        let seen = group
            .iter()
            .filter(|observer| self.can_see(observer, target))
            .count();
        seen * 2 > group.len()
    }
}
