//! Trie-keyed record cache
//!
//! Names are split into labels and walked reversed (`local`, `cluster`,
//! `node-1`), so a subtree is a DNS zone. A `*` child substitutes for
//! any missing label during lookup. Each node groups its records by
//! type, keyed by record data so duplicates collapse; expired records
//! are evicted lazily on read.

use crate::dns::record::{unix_now, Record, RecordData, RecordType};
use std::collections::HashMap;

/// Per-name container grouping records by type.
#[derive(Default)]
pub struct CacheValue {
    data: HashMap<RecordType, HashMap<RecordData, Record>>,
}

impl CacheValue {
    pub fn add(&mut self, record: Record) {
        if !record.is_live(unix_now()) {
            return;
        }

        self.data
            .entry(record.rtype)
            .or_default()
            .insert(record.data.clone(), record);
    }

    /// Live records of one type; `ANY` yields every type present.
    /// Dead records found along the way are dropped.
    pub fn get(&mut self, rtype: RecordType) -> Vec<Record> {
        let now = unix_now();

        if rtype == RecordType::Any {
            let types: Vec<RecordType> = self.data.keys().copied().collect();
            return types
                .into_iter()
                .flat_map(|each| self.collect_live(each, now))
                .collect();
        }

        self.collect_live(rtype, now)
    }

    fn collect_live(&mut self, rtype: RecordType, now: u64) -> Vec<Record> {
        let Some(records) = self.data.get_mut(&rtype) else {
            return Vec::new();
        };

        records.retain(|_, record| record.is_live(now));
        records.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(HashMap::is_empty)
    }
}

/// One trie node; the root represents the DNS root.
#[derive(Default)]
pub struct CacheNode {
    children: HashMap<String, CacheNode>,
    value: CacheValue,
}

impl CacheNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk to the node for `fqdn`, falling back to a `*` sibling at
    /// each level. Returns None on miss.
    fn lookup_mut(&mut self, fqdn: &str) -> Option<&mut CacheValue> {
        let mut current = self;

        for label in labels_reversed(fqdn) {
            let key = if current.children.contains_key(label) {
                label
            } else if current.children.contains_key("*") {
                "*"
            } else {
                return None;
            };

            current = current.children.get_mut(key).expect("checked above");
        }

        Some(&mut current.value)
    }

    /// Walk to the node for `fqdn`, creating missing nodes (touch
    /// mode).
    fn touch(&mut self, fqdn: &str) -> &mut CacheValue {
        let mut current = self;

        for label in labels_reversed(fqdn) {
            let key = if !current.children.contains_key(label)
                && current.children.contains_key("*")
            {
                "*"
            } else {
                label
            };

            current = current.children.entry(key.to_string()).or_default();
        }

        &mut current.value
    }

    /// Insert a record at its own name, if it is still live.
    pub fn add(&mut self, record: Record) {
        let name = record.name.clone();
        self.touch(&name).add(record);
    }

    /// Build and insert a record from parts.
    pub fn add_parts(&mut self, fqdn: &str, data: RecordData, ttl: i64) {
        self.add(Record::new(fqdn, data, ttl));
    }

    /// All live records of `rtype` at `fqdn`.
    pub fn query(&mut self, fqdn: &str, rtype: RecordType) -> Vec<Record> {
        match self.lookup_mut(fqdn.trim_end_matches('.')) {
            Some(value) => value.get(rtype),
            None => Vec::new(),
        }
    }

    /// Remove every record at `fqdn`.
    pub fn remove(&mut self, fqdn: &str) {
        if let Some(value) = self.lookup_mut(fqdn.trim_end_matches('.')) {
            *value = CacheValue::default();
        }
    }

    /// Every live record in the trie.
    pub fn iter_records(&mut self) -> Vec<Record> {
        let mut out = self.value.get(RecordType::Any);
        for child in self.children.values_mut() {
            out.extend(child.iter_records());
        }
        out
    }
}

fn labels_reversed(fqdn: &str) -> impl Iterator<Item = &str> {
    fqdn.split('.').rev().filter(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn a_record(name: &str, octet: u8, ttl: i64) -> Record {
        Record::new(name, RecordData::A(Ipv4Addr::new(10, 0, 0, octet)), ttl)
    }

    #[test]
    fn test_add_and_query() {
        let mut cache = CacheNode::new();
        cache.add(a_record("node-1.cluster.local", 1, 300));

        let records = cache.query("node-1.cluster.local", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)));

        assert!(cache.query("node-2.cluster.local", RecordType::A).is_empty());
        assert!(cache.query("node-1.cluster.local", RecordType::Aaaa).is_empty());
    }

    #[test]
    fn test_duplicate_data_collapses() {
        let mut cache = CacheNode::new();
        cache.add(a_record("node-1.cluster.local", 1, 300));
        cache.add(a_record("node-1.cluster.local", 1, 600));

        assert_eq!(cache.query("node-1.cluster.local", RecordType::A).len(), 1);
    }

    #[test]
    fn test_wildcard_fallback() {
        let mut cache = CacheNode::new();
        cache.add(a_record("*.cluster.local", 9, 300));

        let records = cache.query("anything.cluster.local", RecordType::A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 9)));

        // But not across levels.
        assert!(cache.query("a.b.cluster.local", RecordType::A).is_empty());
    }

    #[test]
    fn test_expired_records_are_evicted_on_read() {
        let mut cache = CacheNode::new();

        let mut stale = a_record("node-1.cluster.local", 1, 10);
        stale.timestamp = unix_now() - 100;
        // Dead on arrival is refused outright.
        cache.add(stale);
        assert!(cache.query("node-1.cluster.local", RecordType::A).is_empty());

        let mut aging = a_record("node-2.cluster.local", 2, 10);
        cache.add(aging.clone());
        assert_eq!(cache.query("node-2.cluster.local", RecordType::A).len(), 1);

        // Re-insert with a timestamp in the past, then watch the read
        // path drop it.
        aging.timestamp = unix_now() - 100;
        cache
            .touch("node-2.cluster.local")
            .data
            .entry(RecordType::A)
            .or_default()
            .insert(aging.data.clone(), aging);

        assert!(cache.query("node-2.cluster.local", RecordType::A).is_empty());
    }

    #[test]
    fn test_any_returns_all_types() {
        let mut cache = CacheNode::new();
        cache.add(a_record("svc.cluster.local", 1, 300));
        cache.add(Record::new(
            "svc.cluster.local",
            RecordData::Txt("service=gateway".to_string()),
            300,
        ));

        let records = cache.query("svc.cluster.local", RecordType::Any);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_pinned_ttl_never_expires() {
        let mut cache = CacheNode::new();
        let mut pinned = a_record("root.servers.local", 3, -1);
        pinned.timestamp = 0;
        cache.add(pinned);

        assert_eq!(cache.query("root.servers.local", RecordType::A).len(), 1);
    }
}
