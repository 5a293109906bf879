//! Per-task proxy rotation.

use droprun_core::{HistoryBuffer, Proxy};

/// Proxies available to one task, handed out in rotation.
///
/// Pools are never shared between tasks.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    proxies: Vec<Proxy>,
    cursor: usize,
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Swap in a new list. Rotation restarts from the first entry.
    pub fn replace(&mut self, proxies: Vec<Proxy>) {
        self.proxies = proxies;
        self.cursor = 0;
    }

    /// Draw the next proxy that is neither `current` nor recently banned.
    ///
    /// `banned` holds proxy ids. Returns `None` once every entry is excluded.
    pub fn draw(&mut self, current: Option<&Proxy>, banned: &HistoryBuffer<String>) -> Option<Proxy> {
        let len = self.proxies.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let candidate = &self.proxies[index];
            if current.map(|c| c.id == candidate.id).unwrap_or(false) {
                continue;
            }
            if banned.contains(&candidate.id) {
                continue;
            }
            self.cursor = (index + 1) % len;
            return Some(candidate.clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies(raw: &[&str]) -> Vec<Proxy> {
        raw.iter()
            .map(|r| Proxy::parse(r).unwrap().unwrap())
            .collect()
    }

    #[test]
    fn test_rotates_in_order() {
        let list = proxies(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let mut pool = ProxyPool::new(list.clone());
        let banned = HistoryBuffer::new(4);

        assert_eq!(pool.draw(None, &banned), Some(list[0].clone()));
        assert_eq!(pool.draw(None, &banned), Some(list[1].clone()));
        assert_eq!(pool.draw(None, &banned), Some(list[2].clone()));
        assert_eq!(pool.draw(None, &banned), Some(list[0].clone()));
    }

    #[test]
    fn test_skips_current_and_banned() {
        let list = proxies(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let mut pool = ProxyPool::new(list.clone());
        let mut banned = HistoryBuffer::new(4);
        banned.insert(list[1].id.clone());

        let next = pool.draw(Some(&list[0]), &banned);
        assert_eq!(next, Some(list[2].clone()));
    }

    #[test]
    fn test_exhausted_when_everything_excluded() {
        let list = proxies(&["10.0.0.1:80", "10.0.0.2:80"]);
        let mut pool = ProxyPool::new(list.clone());
        let mut banned = HistoryBuffer::new(4);
        banned.insert(list[0].id.clone());

        assert_eq!(pool.draw(Some(&list[1]), &banned), None);
        assert_eq!(ProxyPool::default().draw(None, &banned), None);
    }

    #[test]
    fn test_evicted_ban_becomes_usable() {
        let list = proxies(&["10.0.0.1:80", "10.0.0.2:80"]);
        let mut pool = ProxyPool::new(list.clone());
        let mut banned = HistoryBuffer::new(1);
        banned.insert(list[0].id.clone());
        banned.insert(list[1].id.clone());

        assert_eq!(pool.draw(None, &banned), Some(list[0].clone()));
    }

    #[test]
    fn test_replace_resets_rotation() {
        let mut pool = ProxyPool::new(proxies(&["10.0.0.1:80"]));
        let banned = HistoryBuffer::new(1);
        pool.draw(None, &banned);

        let fresh = proxies(&["10.0.0.8:80", "10.0.0.9:80"]);
        pool.replace(fresh.clone());
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.draw(None, &banned), Some(fresh[0].clone()));
    }
}
