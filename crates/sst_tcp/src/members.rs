//! Parsing of `id@addr` member lists.
//!
//! Deployments describe a group as a comma-separated list like
//! `0@10.0.0.1:25551,1@10.0.0.2:25551`; order in the list is row order.

use std::net::SocketAddr;

use anyhow::Context;

use sst_core::NodeId;

/// Parse a member list into parallel id and address vectors.
pub fn parse_members(list: &str) -> anyhow::Result<(Vec<NodeId>, Vec<SocketAddr>)> {
    let mut ids = Vec::new();
    let mut addrs = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (id, addr) = entry
            .split_once('@')
            .with_context(|| format!("member entry {entry:?} is not of the form id@addr"))?;
        let id: NodeId = id
            .parse()
            .with_context(|| format!("member id {id:?} is not a decimal number"))?;
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("member address {addr:?} is not a socket address"))?;
        anyhow::ensure!(!ids.contains(&id), "duplicate member id {id}");
        ids.push(id);
        addrs.push(addr);
    }
    anyhow::ensure!(!ids.is_empty(), "member list is empty");
    Ok((ids, addrs))
}

/// Render a member list back into the `id@addr` form.
pub fn format_members(ids: &[NodeId], addrs: &[SocketAddr]) -> String {
    ids.iter()
        .zip(addrs)
        .map(|(id, addr)| format!("{id}@{addr}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_list() {
        let (ids, addrs) =
            parse_members("0@127.0.0.1:25551, 1@127.0.0.1:25552,2@10.0.0.3:9999").unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(addrs[1], "127.0.0.1:25552".parse().unwrap());
        assert_eq!(
            format_members(&ids, &addrs),
            "0@127.0.0.1:25551,1@127.0.0.1:25552,2@10.0.0.3:9999"
        );
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_members("").is_err());
        assert!(parse_members("nope").is_err());
        assert!(parse_members("1@not-an-addr").is_err());
        assert!(parse_members("x@127.0.0.1:1").is_err());
        assert!(parse_members("1@127.0.0.1:1,1@127.0.0.1:2").is_err());
    }
}
