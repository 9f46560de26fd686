//! Binary-trie IP matcher (C1) and serialized-trie loader (C2).
//!
//! Containment is "any terminal node on the address's root-to-leaf
//! walk", which is why longest-prefix-match on a binary trie reduces to
//! a plain membership check: any shorter covering prefix also
//! terminates on the same walk.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::EdlError;

const MAGIC: &[u8; 9] = b"ELLIOTRIE";
const FORMAT_VERSION: u16 = 2;
const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 9;
const ABSENT: u32 = 0xFFFF_FFFF;

/// An immutable IP prefix: address family is implied by the variant of
/// `addr`. `len` is 0..=32 for IPv4, 0..=128 for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Self { addr, len }
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    terminal: bool,
    #[allow(dead_code)]
    depth: u8,
}

impl TrieNode {
    fn empty() -> Box<Self> {
        Box::new(Self::default())
    }
}

/// Two independent roots, one per address family. Immutable once built;
/// updates replace the whole trie rather than mutating it in place.
#[derive(Debug)]
pub struct Trie {
    v4_root: Box<TrieNode>,
    v6_root: Box<TrieNode>,
}

impl Trie {
    pub fn new() -> Self {
        Self {
            v4_root: TrieNode::empty(),
            v6_root: TrieNode::empty(),
        }
    }

    /// Insert a prefix, creating missing children along the way.
    pub fn insert(&mut self, prefix: IpPrefix) {
        let (int_addr, width) = address_int(prefix.addr);
        let len = prefix.len.min(width);
        let root = match prefix.addr {
            IpAddr::V4(_) => &mut self.v4_root,
            IpAddr::V6(_) => &mut self.v6_root,
        };
        let mut node = root.as_mut();
        for depth in 0..len {
            let bit = ((int_addr >> (width - 1 - depth)) & 1) as usize;
            node = node.children[bit].get_or_insert_with(TrieNode::empty);
            node.depth = (depth + 1) as u8;
        }
        node.terminal = true;
    }

    /// True iff any inserted prefix covers `addr`. Allocation-free: the
    /// per-request hot path walks the address bit by bit via a plain shift
    /// rather than materializing a bit vector.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let (int_addr, width) = address_int(addr);
        let root = match addr {
            IpAddr::V4(_) => &self.v4_root,
            IpAddr::V6(_) => &self.v6_root,
        };
        let mut node = root.as_ref();
        if node.terminal {
            return true;
        }
        for i in (0..width).rev() {
            let bit = ((int_addr >> i) & 1) as usize;
            match &node.children[bit] {
                Some(child) => {
                    node = child;
                    if node.terminal {
                        return true;
                    }
                }
                None => return false,
            }
        }
        false
    }

    /// Parse a serialized `ELLIOTRIE` v2 blob.
    pub fn load(bytes: &[u8]) -> Result<(Trie, u32), EdlError> {
        if bytes.len() < HEADER_LEN {
            return Err(EdlError::Truncated);
        }
        if &bytes[0..9] != MAGIC {
            return Err(EdlError::InvalidMagic);
        }
        let version = u16::from_be_bytes([bytes[9], bytes[10]]);
        if version != FORMAT_VERSION {
            return Err(EdlError::UnsupportedVersion { got: version });
        }
        // byte 11 is the reserved flags byte, accepted as-is.
        let total_nodes = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let v4_root_idx = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let v6_root_idx = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

        let expected_len = HEADER_LEN
            .checked_add((total_nodes as usize).saturating_mul(RECORD_LEN))
            .ok_or(EdlError::Truncated)?;
        if bytes.len() < expected_len {
            return Err(EdlError::Truncated);
        }

        let mut records = Vec::with_capacity(total_nodes as usize);
        let mut offset = HEADER_LEN;
        for _ in 0..total_nodes {
            let left = u32::from_be_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ]);
            let right = u32::from_be_bytes([
                bytes[offset + 4],
                bytes[offset + 5],
                bytes[offset + 6],
                bytes[offset + 7],
            ]);
            let flags = bytes[offset + 8];
            records.push(FlatNode { left, right, flags });
            offset += RECORD_LEN;
        }

        let v4_root = materialize(v4_root_idx, &records)?;
        let v6_root = materialize(v6_root_idx, &records)?;
        let approx_entry_count = total_nodes / 7;

        Ok((Trie { v4_root, v6_root }, approx_entry_count))
    }
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

struct FlatNode {
    left: u32,
    right: u32,
    flags: u8,
}

fn materialize(idx: u32, records: &[FlatNode]) -> Result<Box<TrieNode>, EdlError> {
    if idx == ABSENT {
        return Ok(TrieNode::empty());
    }
    let record = records.get(idx as usize).ok_or(EdlError::Truncated)?;
    let terminal = record.flags & 0x1 != 0;
    let depth = record.flags >> 1;
    let left = materialize(record.left, records)?;
    let right = materialize(record.right, records)?;
    Ok(Box::new(TrieNode {
        children: [Some(left), Some(right)],
        terminal,
        depth,
    }))
}

/// An address as a plain integer plus its bit width (32 for IPv4, 128 for
/// IPv6). Bit `i` counting from the MSB is `(int_addr >> (width - 1 - i)) & 1`.
fn address_int(addr: IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => (u32::from(v4) as u128, 32),
        IpAddr::V6(v6) => (u128::from(v6), 128),
    }
}

/// Build the serialized bytes for a set of prefixes. Not used by the live
/// fetch path (the control plane is the only real producer of this format)
/// but exposed so tests and tooling can build fixtures without depending on
/// an external encoder.
pub fn encode(prefixes: &[IpPrefix]) -> Vec<u8> {
    struct Builder {
        nodes: Vec<(Option<usize>, Option<usize>, bool)>,
    }
    impl Builder {
        fn new() -> Self {
            Self { nodes: vec![] }
        }
        fn alloc(&mut self) -> usize {
            self.nodes.push((None, None, false));
            self.nodes.len() - 1
        }
        fn insert(&mut self, root: &mut Option<usize>, int_addr: u128, width: u8, len: u8) {
            let mut cur = *root.get_or_insert_with(|| {
                let i = self.alloc();
                i
            });
            for depth in 0..len {
                let bit = (int_addr >> (width - 1 - depth)) & 1 == 1;
                let (left, right, _) = self.nodes[cur];
                let next = if bit { right } else { left };
                let next = match next {
                    Some(n) => n,
                    None => {
                        let n = self.alloc();
                        let (l, r, t) = self.nodes[cur];
                        self.nodes[cur] = if bit { (l, Some(n), t) } else { (Some(n), r, t) };
                        n
                    }
                };
                cur = next;
            }
            self.nodes[cur].2 = true;
        }
    }

    let mut b = Builder::new();
    let mut v4_root: Option<usize> = None;
    let mut v6_root: Option<usize> = None;
    for p in prefixes {
        let (int_addr, width) = address_int(p.addr);
        let len = p.len.min(width);
        match p.addr {
            IpAddr::V4(_) => b.insert(&mut v4_root, int_addr, width, len),
            IpAddr::V6(_) => b.insert(&mut v6_root, int_addr, width, len),
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    out.push(0); // flags
    out.extend_from_slice(&(b.nodes.len() as u32).to_be_bytes());
    out.extend_from_slice(&v4_root.map(|i| i as u32).unwrap_or(ABSENT).to_be_bytes());
    out.extend_from_slice(&v6_root.map(|i| i as u32).unwrap_or(ABSENT).to_be_bytes());
    for (left, right, terminal) in &b.nodes {
        out.extend_from_slice(&left.map(|i| i as u32).unwrap_or(ABSENT).to_be_bytes());
        out.extend_from_slice(&right.map(|i| i as u32).unwrap_or(ABSENT).to_be_bytes());
        out.push(*terminal as u8);
    }
    out
}

#[allow(dead_code)]
pub fn v4(a: u8, b: u8, c: u8, d: u8, len: u8) -> IpPrefix {
    IpPrefix::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), len)
}

#[allow(dead_code)]
pub fn v6(addr: Ipv6Addr, len: u8) -> IpPrefix {
    IpPrefix::new(IpAddr::V6(addr), len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn zero_length_prefix_matches_everything() {
        let mut t = Trie::new();
        t.insert(v4(0, 0, 0, 0, 0));
        assert!(t.contains(ip4("1.2.3.4")));
        assert!(t.contains(ip4("255.255.255.255")));
    }

    #[test]
    fn slash_32_matches_only_exact_address() {
        let mut t = Trie::new();
        t.insert(v4(203, 0, 113, 9, 32));
        assert!(t.contains(ip4("203.0.113.9")));
        assert!(!t.contains(ip4("203.0.113.10")));
    }

    #[test]
    fn slash_24_contains_whole_block() {
        let mut t = Trie::new();
        t.insert(v4(203, 0, 113, 0, 24));
        assert!(t.contains(ip4("203.0.113.1")));
        assert!(t.contains(ip4("203.0.113.254")));
        assert!(!t.contains(ip4("203.0.114.1")));
    }

    #[test]
    fn ipv6_slash_128_exact() {
        let mut t = Trie::new();
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        t.insert(v6(addr, 128));
        assert!(t.contains(IpAddr::V6(addr)));
        assert!(!t.contains(IpAddr::V6("2001:db8::2".parse().unwrap())));
    }

    #[test]
    fn roundtrip_through_serialized_format() {
        let prefixes = vec![
            v4(203, 0, 113, 0, 24),
            v4(10, 0, 0, 0, 8),
            v6("2001:db8::".parse().unwrap(), 32),
        ];
        let bytes = encode(&prefixes);
        let (trie, approx) = Trie::load(&bytes).unwrap();
        assert!(trie.contains(ip4("203.0.113.50")));
        assert!(trie.contains(ip4("10.1.2.3")));
        assert!(!trie.contains(ip4("198.51.100.1")));
        assert!(trie.contains(IpAddr::V6("2001:db8::abcd".parse().unwrap())));
        assert!(approx > 0 || bytes.len() < 24 + 7 * 9);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&[v4(1, 2, 3, 0, 24)]);
        bytes[0] = b'X';
        assert!(matches!(Trie::load(&bytes), Err(EdlError::InvalidMagic)));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = encode(&[v4(1, 2, 3, 0, 24)]);
        bytes[9] = 0;
        bytes[10] = 9;
        assert!(matches!(
            Trie::load(&bytes),
            Err(EdlError::UnsupportedVersion { got: 9 })
        ));
    }

    #[test]
    fn rejects_truncated_stream() {
        let bytes = encode(&[v4(1, 2, 3, 0, 24)]);
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(Trie::load(truncated), Err(EdlError::Truncated)));
    }

    #[test]
    fn empty_trie_matches_nothing() {
        let t = Trie::new();
        assert!(!t.contains(ip4("1.1.1.1")));
    }
}
