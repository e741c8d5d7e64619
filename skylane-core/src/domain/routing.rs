//! Routing module for resolving requests against the published route table.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::rule::{RouteKey, RouteRule};

/// One immutable, point-in-time routing configuration.
///
/// Tables are built whole and then published; a published table is never
/// mutated, which is what lets readers use it without locks.
#[derive(Debug, Default)]
pub struct RouteTable {
    version: u64,
    rules: BTreeMap<RouteKey, Arc<RouteRule>>,
}

impl RouteTable {
    /// Build a table from a batch of rules. The last rule for a duplicate key wins.
    pub fn build(version: u64, rules: impl IntoIterator<Item = RouteRule>) -> Self {
        let mut table = BTreeMap::new();
        for rule in rules {
            table.insert(rule.key(), Arc::new(rule));
        }
        Self {
            version,
            rules: table,
        }
    }

    /// Monotonic publish counter; the empty startup table is version 0.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of rules in the table.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over rules in key order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<RouteRule>> {
        self.rules.values()
    }

    /// Resolve a request to a rule.
    ///
    /// An exact `host + path` match wins. Otherwise any rule for the same
    /// domain is used; with keys ordered, that is the rule with the smallest path.
    pub fn resolve(&self, host: &str, path: &str) -> Option<&Arc<RouteRule>> {
        if let Some(rule) = self.rules.get(&RouteKey::new(host, path)) {
            return Some(rule);
        }

        self.rules
            .range(RouteKey::new(host, "")..)
            .next()
            .filter(|(key, _)| key.domain == host)
            .map(|(_, rule)| rule)
    }
}

/// A lock-free routing table handle.
///
/// Uses `ArcSwap` so the data plane can replace its whole configuration
/// without acquiring read locks on the hot path.
#[derive(Debug)]
pub struct Router {
    table: ArcSwap<RouteTable>,
    publish: Mutex<()>,
}

impl Router {
    /// Create a router holding an empty table.
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            publish: Mutex::new(()),
        }
    }

    /// Atomically replace the entire table with one built from `rules`.
    ///
    /// Readers holding the previous snapshot keep seeing it unchanged.
    pub fn publish(&self, rules: Vec<RouteRule>) -> Arc<RouteTable> {
        let _writer = self.publish.lock();
        let version = self.table.load().version + 1;
        let count = rules.len();
        let table = Arc::new(RouteTable::build(version, rules));
        self.table.store(table.clone());
        tracing::info!(version, rules = count, keys = table.len(), "Route table published");
        table
    }

    /// Load the current snapshot. Use one snapshot for the whole of a request.
    pub fn snapshot(&self) -> Arc<RouteTable> {
        self.table.load_full()
    }

    /// Resolve against the current snapshot.
    pub fn resolve(&self, host: &str, path: &str) -> Option<Arc<RouteRule>> {
        self.table.load().resolve(host, path).cloned()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared reference to the lock-free router.
pub type SharedRouter = Arc<Router>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::upstream::Upstream;
    use proptest::prelude::*;

    fn rule(domain: &str, path: &str, upstream: &str) -> RouteRule {
        RouteRule::new(
            domain,
            path,
            vec![Upstream::new(upstream, vec!["10.0.0.1".into()], 80, 1)],
        )
    }

    #[test]
    fn exact_match_preferred_over_domain_fallback() {
        let router = Router::new();
        router.publish(vec![rule("a.com", "/", "u1"), rule("a.com", "/api", "u2")]);

        let exact = router.resolve("a.com", "/api").unwrap();
        assert_eq!(exact.upstreams[0].name, "u2");

        let fallback = router.resolve("a.com", "/other").unwrap();
        assert_eq!(fallback.domain, "a.com");
        assert_eq!(fallback.upstreams[0].name, "u1");

        assert!(router.resolve("b.com", "/").is_none());
    }

    #[test]
    fn domain_fallback_ignores_neighbouring_domains() {
        let router = Router::new();
        router.publish(vec![rule("a.co", "/x", "u1"), rule("a.com.evil", "/", "u2")]);

        assert!(router.resolve("a.com", "/x").is_none());
        assert_eq!(router.resolve("a.co", "/y").unwrap().upstreams[0].name, "u1");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let table = RouteTable::build(1, vec![rule("a.com", "/", "first"), rule("a.com", "/", "second")]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve("a.com", "/").unwrap().upstreams[0].name, "second");
    }

    #[test]
    fn publish_replaces_whole_table() {
        let router = Router::new();
        assert_eq!(router.snapshot().version(), 0);

        router.publish(vec![rule("a.com", "/", "u1"), rule("b.com", "/", "u2")]);
        let before = router.snapshot();

        router.publish(vec![rule("c.com", "/", "u3")]);
        let after = router.snapshot();

        assert_eq!(before.version(), 1);
        assert_eq!(before.len(), 2);
        assert!(before.resolve("a.com", "/").is_some());

        assert_eq!(after.version(), 2);
        assert_eq!(after.len(), 1);
        assert!(after.resolve("a.com", "/").is_none());
        assert!(after.resolve("c.com", "/").is_some());
    }

    #[test]
    fn concurrent_readers_only_observe_published_tables() {
        use std::thread;

        // Table `v` carries rules for `host-0 .. host-v`, all pointing at upstream `v`.
        fn table_for(v: usize) -> Vec<RouteRule> {
            (0..=v)
                .map(|i| rule(&format!("host-{}", i), "/", &format!("gen-{}", v)))
                .collect()
        }

        const WRITES: usize = 200;
        let router = Arc::new(Router::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let router = Arc::clone(&router);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let table = router.snapshot();
                        let version = table.version() as usize;
                        if version == 0 {
                            assert!(table.is_empty());
                            continue;
                        }
                        // Every rule in one snapshot belongs to the same generation.
                        let generation = version - 1;
                        assert_eq!(table.len(), generation + 1);
                        for rule in table.rules() {
                            assert_eq!(rule.upstreams[0].name, format!("gen-{}", generation));
                        }
                    }
                })
            })
            .collect();

        for v in 0..WRITES {
            router.publish(table_for(v));
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(router.snapshot().version() as usize, WRITES);
    }

    proptest! {
        #[test]
        fn table_keys_are_unique(entries in proptest::collection::vec(("[a-c]\\.com", "/[a-c]{0,2}"), 0..32)) {
            let rules: Vec<_> = entries
                .iter()
                .enumerate()
                .map(|(i, (d, p))| rule(d, p, &i.to_string()))
                .collect();
            let table = RouteTable::build(1, rules);

            let mut distinct: Vec<_> = entries.clone();
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(table.len(), distinct.len());

            // Each key resolves to the last rule submitted for it.
            for (domain, path) in &distinct {
                let last = entries.iter().rposition(|(d, p)| d == domain && p == path).unwrap();
                let resolved = table.resolve(domain, path).unwrap();
                prop_assert_eq!(&resolved.upstreams[0].name, &last.to_string());
            }
        }

        #[test]
        fn fallback_only_returns_same_domain(host in "[a-c]\\.com", path in "/[a-z]{0,3}") {
            let table = RouteTable::build(1, vec![rule("a.com", "/x", "ua"), rule("b.com", "/y", "ub")]);
            match table.resolve(&host, &path) {
                Some(rule) => prop_assert_eq!(&rule.domain, &host),
                None => prop_assert_eq!(host.as_str(), "c.com"),
            }
        }
    }
}
