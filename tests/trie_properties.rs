//! Round-trip and invariant properties for the binary trie. No
//! `proptest` here, since it is not part of this crate's dependency
//! stack, so coverage is a deterministic table of prefix sets and probe
//! addresses checked against a naive reference matcher.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use edl_guard::trie::{encode, v4, v6, IpPrefix, Trie};

/// Naive reference: does any prefix in `prefixes` cover `addr`?
fn naive_contains(prefixes: &[IpPrefix], addr: IpAddr) -> bool {
    prefixes.iter().any(|p| covers(*p, addr))
}

fn covers(prefix: IpPrefix, addr: IpAddr) -> bool {
    match (prefix.addr, addr) {
        (IpAddr::V4(net), IpAddr::V4(a)) => {
            let mask = if prefix.len == 0 {
                0
            } else {
                u32::MAX << (32 - prefix.len as u32)
            };
            u32::from(net) & mask == u32::from(a) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(a)) => {
            let mask = if prefix.len == 0 {
                0
            } else {
                u128::MAX << (128 - prefix.len as u32)
            };
            u128::from(net) & mask == u128::from(a) & mask
        }
        _ => false,
    }
}

fn build(prefixes: &[IpPrefix]) -> Trie {
    let mut t = Trie::new();
    for p in prefixes {
        t.insert(*p);
    }
    t
}

#[test]
fn matches_naive_reference_across_a_table_of_cases() {
    let cases: Vec<(Vec<IpPrefix>, Vec<IpAddr>)> = vec![
        (
            vec![v4(203, 0, 113, 0, 24), v4(10, 0, 0, 0, 8)],
            vec![
                "203.0.113.1".parse().unwrap(),
                "203.0.114.1".parse().unwrap(),
                "10.255.0.1".parse().unwrap(),
                "11.0.0.1".parse().unwrap(),
            ],
        ),
        (
            vec![v4(0, 0, 0, 0, 0)],
            vec!["1.2.3.4".parse().unwrap(), "255.255.255.255".parse().unwrap()],
        ),
        (
            vec![v4(198, 51, 100, 9, 32)],
            vec![
                "198.51.100.9".parse().unwrap(),
                "198.51.100.10".parse().unwrap(),
            ],
        ),
        (
            vec![v6("2001:db8::".parse::<Ipv6Addr>().unwrap(), 32)],
            vec![
                IpAddr::V6("2001:db8::1".parse().unwrap()),
                IpAddr::V6("2001:db9::1".parse().unwrap()),
            ],
        ),
        (vec![], vec!["1.2.3.4".parse().unwrap()]),
    ];

    for (prefixes, addrs) in cases {
        let trie = build(&prefixes);
        for addr in addrs {
            assert_eq!(
                trie.contains(addr),
                naive_contains(&prefixes, addr),
                "mismatch for {addr} with prefixes {prefixes:?}"
            );
        }
    }
}

#[test]
fn round_trip_through_wire_format_matches_naive_reference() {
    let prefixes = vec![
        v4(203, 0, 113, 0, 24),
        v4(192, 168, 1, 1, 32),
        v6("2001:db8::".parse::<Ipv6Addr>().unwrap(), 48),
    ];
    let probes = vec![
        "203.0.113.200".parse().unwrap(),
        "192.168.1.1".parse().unwrap(),
        "192.168.1.2".parse().unwrap(),
        IpAddr::V6("2001:db8:0:0::9".parse().unwrap()),
        IpAddr::V6("2001:db9::9".parse().unwrap()),
    ];

    let bytes = encode(&prefixes);
    let (trie, _approx) = Trie::load(&bytes).unwrap();

    for addr in probes {
        assert_eq!(trie.contains(addr), naive_contains(&prefixes, addr));
    }
}

#[test]
fn zero_prefix_is_root_terminal_for_each_family() {
    let v4_trie = build(&[v4(0, 0, 0, 0, 0)]);
    assert!(v4_trie.contains(Ipv4Addr::new(9, 9, 9, 9).into()));

    let v6_trie = build(&[v6(Ipv6Addr::UNSPECIFIED, 0)]);
    assert!(v6_trie.contains(IpAddr::V6("::1".parse().unwrap())));
}

#[test]
fn idempotent_rebuild_from_same_prefixes_is_unchanged() {
    let prefixes = vec![v4(172, 16, 0, 0, 12)];
    let t1 = build(&prefixes);
    let t2 = build(&prefixes);
    for addr in ["172.16.5.5", "172.31.255.255", "172.32.0.1"] {
        let a: IpAddr = addr.parse().unwrap();
        assert_eq!(t1.contains(a), t2.contains(a));
    }
}
