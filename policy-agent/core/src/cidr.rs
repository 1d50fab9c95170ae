//! Resolves an IP block minus its excepted sub-blocks into the contiguous ranges that remain
//! allowed, and re-expresses those ranges as a minimal set of aligned CIDR blocks.
//!
//! Addresses are handled as big-endian `u32` values so that ranges can be compared, sorted and
//! merged arithmetically.

use crate::Error;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parses a dotted-quad IPv4 address into its big-endian integer value.
pub fn to_int(ip: &str) -> Result<u32, Error> {
    ip.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| Error::InvalidAddress(ip.to_string()))
}

/// Parses an IPv4 CIDR. A bare address is treated as a `/32`.
///
/// Host bits are preserved; use [`bounds`] to obtain the block's range.
pub fn parse_net(s: &str) -> Result<Ipv4Net, Error> {
    if let Ok(net) = s.parse::<Ipv4Net>() {
        return Ok(net);
    }

    s.parse::<Ipv4Addr>()
        .map(Ipv4Net::from)
        .map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// Returns the inclusive `[start, end]` integer range covered by `net`.
#[inline]
pub fn bounds(net: &Ipv4Net) -> (u32, u32) {
    (u32::from(net.network()), u32::from(net.broadcast()))
}

/// Renders an aligned range start and prefix length as a CIDR string.
#[inline]
pub fn range_to_cidr(start: u32, prefix_len: u8) -> String {
    format!("{}/{}", Ipv4Addr::from(start), prefix_len)
}

/// Subtracts `excepts` from `block`, returning the remaining inclusive ranges as parallel
/// `(starts, ends)` vectors ordered by ascending start.
///
/// Excepted blocks are clipped to `block`; an except that does not overlap the block has no
/// effect. Overlapping or adjacent excepts coalesce, and the result does not depend on the order
/// of `excepts`.
pub fn resolve_ranges(block: Ipv4Net, excepts: &[Ipv4Net]) -> (Vec<u32>, Vec<u32>) {
    let (start, end) = bounds(&block);

    let mut holes = excepts
        .iter()
        .map(bounds)
        .filter(|&(lo, hi)| lo <= end && hi >= start)
        .map(|(lo, hi)| (lo.max(start), hi.min(end)))
        .collect::<Vec<_>>();
    holes.sort_unstable();

    let mut starts = Vec::new();
    let mut ends = Vec::new();

    // The lowest address not yet known to be excluded. Tracked as a u64 so that a hole ending at
    // 255.255.255.255 does not overflow.
    let mut next = u64::from(start);
    for (lo, hi) in holes {
        if u64::from(lo) > next {
            starts.push(next as u32);
            ends.push(lo - 1);
        }
        next = next.max(u64::from(hi) + 1);
    }
    if next <= u64::from(end) {
        starts.push(next as u32);
        ends.push(end);
    }

    (starts, ends)
}

/// Splits the inclusive range `[start, end]` into the minimal list of aligned CIDR blocks.
pub fn cover(start: u32, end: u32) -> Vec<Ipv4Net> {
    let end = u64::from(end);
    let mut cur = u64::from(start);
    let mut nets = Vec::new();

    while cur <= end {
        // The largest block that starts at `cur` is bounded by its alignment...
        let mut size: u64 = if cur == 0 {
            1 << 32
        } else {
            1 << cur.trailing_zeros()
        };
        // ...and by the end of the range.
        while cur + size - 1 > end {
            size >>= 1;
        }

        let prefix_len = 32 - size.trailing_zeros() as u8;
        if let Ok(net) = Ipv4Net::new(Ipv4Addr::from(cur as u32), prefix_len) {
            nets.push(net);
        }
        cur += size;
    }

    nets
}

/// Renders each resolved range as the minimal list of CIDR strings covering it.
pub fn cover_strings(starts: &[u32], ends: &[u32]) -> Vec<String> {
    starts
        .iter()
        .zip(ends)
        .flat_map(|(&start, &end)| cover(start, end))
        .map(|net| range_to_cidr(u32::from(net.network()), net.prefix_len()))
        .collect()
}

/// Resolves an IP block and its excepted sub-blocks into the disjoint CIDR blocks that remain
/// allowed.
pub fn resolve_block(cidr: &str, excepts: &[String]) -> Result<Vec<Ipv4Net>, Error> {
    let block = parse_net(cidr)?;
    let excepts = excepts
        .iter()
        .map(|e| parse_net(e))
        .collect::<Result<Vec<_>, _>>()?;

    let (starts, ends) = resolve_ranges(block, &excepts);
    Ok(starts
        .into_iter()
        .zip(ends)
        .flat_map(|(start, end)| cover(start, end))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn ints(ips: &[&str]) -> Vec<u32> {
        ips.iter().map(|ip| to_int(ip).unwrap()).collect()
    }

    /// Merges adjacent blocks back into inclusive ranges.
    fn merge(nets: &[Ipv4Net]) -> (Vec<u32>, Vec<u32>) {
        let mut bounds = nets.iter().map(bounds).collect::<Vec<_>>();
        bounds.sort_unstable();
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for (lo, hi) in bounds {
            match merged.last_mut() {
                Some(last) if u64::from(last.1) + 1 >= u64::from(lo) => last.1 = last.1.max(hi),
                _ => merged.push((lo, hi)),
            }
        }
        merged.into_iter().unzip()
    }

    #[test]
    fn to_int_is_big_endian() {
        assert_eq!(to_int("0.1.2.3").unwrap(), 66051);
        assert_eq!(to_int("3.2.1.0").unwrap(), 50462976);
        assert_eq!(to_int("255.255.255.255").unwrap(), u32::MAX);
    }

    #[test]
    fn to_int_rejects_malformed_addresses() {
        for ip in ["", "1.2.3", "1.2.3.256", "a.b.c.d", "10.0.0.0/8", "::1"] {
            assert!(
                matches!(to_int(ip), Err(Error::InvalidAddress(_))),
                "{ip:?} must not parse"
            );
        }
    }

    #[test]
    fn resolve_ranges_subtracts_excepts() {
        let excepts = [
            net("10.240.10.2/24"),
            net("10.240.11.4/24"),
            net("10.240.221.0/22"),
            net("10.235.0.0/30"),
        ];
        let (starts, ends) = resolve_ranges(net("10.240.6.6/16"), &excepts);
        assert_eq!(
            starts,
            ints(&["10.240.0.0", "10.240.12.0", "10.240.224.0"])
        );
        assert_eq!(
            ends,
            ints(&["10.240.9.255", "10.240.219.255", "10.240.255.255"])
        );
    }

    #[test]
    fn resolve_ranges_ignores_except_order() {
        let mut excepts = vec![
            net("10.240.221.0/22"),
            net("10.240.10.2/24"),
            net("10.235.0.0/30"),
            net("10.240.11.4/24"),
        ];
        let expected = resolve_ranges(net("10.240.0.0/16"), &excepts);
        excepts.reverse();
        assert_eq!(resolve_ranges(net("10.240.0.0/16"), &excepts), expected);
    }

    #[test]
    fn resolve_ranges_coalesces_overlapping_excepts() {
        let excepts = [net("192.168.0.0/25"), net("192.168.0.64/26"), net("192.168.0.128/25")];
        let (starts, ends) = resolve_ranges(net("192.168.0.0/23"), &excepts);
        assert_eq!(starts, ints(&["192.168.1.0"]));
        assert_eq!(ends, ints(&["192.168.1.255"]));
    }

    #[test]
    fn except_covering_block_leaves_nothing() {
        let (starts, ends) = resolve_ranges(net("10.1.2.0/24"), &[net("10.0.0.0/8")]);
        assert!(starts.is_empty());
        assert!(ends.is_empty());

        let (starts, _) = resolve_ranges(net("0.0.0.0/0"), &[net("0.0.0.0/0")]);
        assert!(starts.is_empty());
    }

    #[test]
    fn resolve_ranges_handles_address_space_edges() {
        let (starts, ends) = resolve_ranges(net("0.0.0.0/0"), &[net("255.255.255.0/24")]);
        assert_eq!(starts, vec![0]);
        assert_eq!(ends, ints(&["255.255.254.255"]));

        let (starts, ends) = resolve_ranges(net("0.0.0.0/0"), &[net("0.0.0.0/8")]);
        assert_eq!(starts, ints(&["1.0.0.0"]));
        assert_eq!(ends, vec![u32::MAX]);
    }

    #[test]
    fn range_to_cidr_round_trips_every_prefix_length() {
        for ip in ["0.0.0.0", "255.0.1.16", "10.240.0.0", "12.144.2.1", "240.220.10.6"] {
            for prefix_len in 0..=32u8 {
                let cidr = format!("{ip}/{prefix_len}");
                assert_eq!(range_to_cidr(to_int(ip).unwrap(), prefix_len), cidr);
            }
        }
    }

    #[test]
    fn cover_splits_unaligned_ranges() {
        let nets = cover(to_int("10.240.0.0").unwrap(), to_int("10.240.9.255").unwrap());
        assert_eq!(nets, vec![net("10.240.0.0/21"), net("10.240.8.0/23")]);

        let nets = cover(to_int("10.0.0.1").unwrap(), to_int("10.0.0.6").unwrap());
        assert_eq!(
            nets,
            vec![
                net("10.0.0.1/32"),
                net("10.0.0.2/31"),
                net("10.0.0.4/31"),
                net("10.0.0.6/32"),
            ]
        );

        assert_eq!(cover(0, u32::MAX), vec![net("0.0.0.0/0")]);
        assert_eq!(cover(u32::MAX, u32::MAX), vec![net("255.255.255.255/32")]);
    }

    #[test]
    fn cover_strings_renders_covering_block_starts() {
        let excepts = [
            net("10.240.10.2/24"),
            net("10.240.11.4/24"),
            net("10.240.221.0/22"),
            net("10.235.0.0/30"),
        ];
        let (starts, ends) = resolve_ranges(net("10.240.6.6/16"), &excepts);
        let cidrs = cover_strings(&starts, &ends);
        assert_eq!(cidrs.first().map(String::as_str), Some("10.240.0.0/21"));
        assert!(cidrs.contains(&"10.240.12.0/22".to_string()));
        assert!(cidrs.contains(&"10.240.224.0/19".to_string()));
    }

    #[test]
    fn resolved_blocks_round_trip() {
        let excepts = [
            "10.240.10.2/24".to_string(),
            "10.240.11.4/24".to_string(),
            "10.240.221.0/22".to_string(),
            "10.235.0.0/30".to_string(),
        ];
        let nets = resolve_block("10.240.6.6/16", &excepts).unwrap();
        let parsed = excepts.iter().map(|e| net(e)).collect::<Vec<_>>();
        assert_eq!(merge(&nets), resolve_ranges(net("10.240.6.6/16"), &parsed));

        // Re-resolving each rendered block against the same excepts reproduces it unchanged.
        for block in &nets {
            let (starts, ends) = resolve_ranges(*block, &parsed);
            assert_eq!((starts, ends), (vec![bounds(block).0], vec![bounds(block).1]));
        }
    }

    #[test]
    fn resolve_block_rejects_malformed_input() {
        assert!(matches!(
            resolve_block("10.0.0.0/33", &[]),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            resolve_block("10.0.0.0/8", &["nope".to_string()]),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            resolve_block("fd00::/8", &[]),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn bare_address_is_a_host_block() {
        assert_eq!(resolve_block("192.0.2.7", &[]).unwrap(), vec![net("192.0.2.7/32")]);
    }
}
