//! Known hosts and their replica group labels.

use std::collections::BTreeMap;

use connpool_core::HostAddr;
use connpool_core::config::TopologySection;

/// Immutable membership snapshot supplied by the topology service.
///
/// A host carries at most one group label. Hosts without a label are
/// reported only under `hosts`, never under `replicaSets`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyView {
    members: BTreeMap<HostAddr, Option<String>>,
}

impl TopologyView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an ungrouped host. Keeps an existing group label.
    pub fn with_host(mut self, host: impl Into<HostAddr>) -> Self {
        self.members.entry(host.into()).or_insert(None);
        self
    }

    /// Add every host in `hosts` under `group`.
    pub fn with_group<H: Into<HostAddr>>(
        mut self,
        group: &str,
        hosts: impl IntoIterator<Item = H>,
    ) -> Self {
        for host in hosts {
            self.members.insert(host.into(), Some(group.to_string()));
        }
        self
    }

    /// Build from the `[topology]` section of connpool.toml.
    pub fn from_section(section: &TopologySection) -> Self {
        let mut view = Self::new();
        for host in section.hosts.iter().flatten() {
            view = view.with_host(host.as_str());
        }
        for (group, hosts) in section.groups.iter().flatten() {
            view = view.with_group(group, hosts.iter().map(String::as_str));
        }
        view
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostAddr> {
        self.members.keys()
    }

    pub fn contains(&self, host: &HostAddr) -> bool {
        self.members.contains_key(host)
    }

    pub fn group_of(&self, host: &HostAddr) -> Option<&str> {
        self.members.get(host).and_then(|g| g.as_deref())
    }

    /// Group name to sorted member hosts.
    pub fn groups(&self) -> BTreeMap<&str, Vec<&HostAddr>> {
        let mut groups: BTreeMap<&str, Vec<&HostAddr>> = BTreeMap::new();
        for (host, group) in &self.members {
            if let Some(group) = group {
                groups.entry(group.as_str()).or_default().push(host);
            }
        }
        groups
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_collect_members() {
        let view = TopologyView::new()
            .with_group("rs0", ["a:1", "b:1"])
            .with_group("rs1", ["c:1"])
            .with_host("d:1");

        let groups = view.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["rs0"].len(), 2);
        assert_eq!(view.group_of(&HostAddr::from("c:1")), Some("rs1"));
        assert_eq!(view.group_of(&HostAddr::from("d:1")), None);
        assert_eq!(view.len(), 4);
    }

    #[test]
    fn with_host_keeps_group_label() {
        let view = TopologyView::new().with_group("rs0", ["a:1"]).with_host("a:1");
        assert_eq!(view.group_of(&HostAddr::from("a:1")), Some("rs0"));
    }

    #[test]
    fn from_section_merges_hosts_and_groups() {
        let mut groups = BTreeMap::new();
        groups.insert("rs0".to_string(), vec!["a:1".to_string()]);
        let section = TopologySection {
            hosts: Some(vec!["cfg:1".to_string(), "a:1".to_string()]),
            groups: Some(groups),
        };
        let view = TopologyView::from_section(&section);
        assert!(view.contains(&HostAddr::from("cfg:1")));
        assert_eq!(view.group_of(&HostAddr::from("a:1")), Some("rs0"));
        assert!(TopologyView::from_section(&TopologySection::default()).is_empty());
    }
}
