//! Compact hostlist notation.
//!
//! Renders sets of node names like `n[1-3,7],gpu0` and expands them
//! back. The compact form is computed only when building RPC replies or
//! persisting state; the scheduler operates on bitmaps throughout.

/// Split a node name into (prefix, numeric suffix, suffix width).
fn split_name(name: &str) -> (&str, Option<(u64, usize)>) {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (name, None);
    }
    let split = name.len() - digits;
    let (prefix, num) = name.split_at(split);
    match num.parse::<u64>() {
        Ok(v) => (prefix, Some((v, num.len()))),
        Err(_) => (name, None),
    }
}

/// Compress a list of hostnames into bracketed range notation.
/// Input order is preserved for the first appearance of each prefix.
pub fn compress(names: &[&str]) -> String {
    #[derive(Clone)]
    struct Group {
        prefix: String,
        width: usize,
        nums: Vec<u64>,
        plain: bool,
    }
    let mut groups: Vec<Group> = Vec::new();

    for name in names {
        let (prefix, num) = split_name(name);
        match num {
            None => groups.push(Group {
                prefix: name.to_string(),
                width: 0,
                nums: Vec::new(),
                plain: true,
            }),
            Some((v, w)) => {
                if let Some(g) = groups
                    .iter_mut()
                    .find(|g| !g.plain && g.prefix == prefix && g.width == w)
                {
                    g.nums.push(v);
                } else {
                    groups.push(Group {
                        prefix: prefix.to_string(),
                        width: w,
                        nums: vec![v],
                        plain: false,
                    });
                }
            }
        }
    }

    let mut out = Vec::new();
    for g in &mut groups {
        if g.plain {
            out.push(g.prefix.clone());
            continue;
        }
        g.nums.sort_unstable();
        g.nums.dedup();
        if g.nums.len() == 1 {
            out.push(format!("{}{:0w$}", g.prefix, g.nums[0], w = g.width));
            continue;
        }
        let mut ranges = Vec::new();
        let mut start = g.nums[0];
        let mut end = g.nums[0];
        for &n in &g.nums[1..] {
            if n == end + 1 {
                end = n;
            } else {
                ranges.push((start, end));
                start = n;
                end = n;
            }
        }
        ranges.push((start, end));
        let body = ranges
            .iter()
            .map(|&(s, e)| {
                if s == e {
                    format!("{:0w$}", s, w = g.width)
                } else {
                    format!("{:0w$}-{:0w$}", s, e, w = g.width)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push(format!("{}[{}]", g.prefix, body));
    }
    out.join(",")
}

/// Expand hostlist notation into individual names.
/// Returns `None` on malformed input.
pub fn expand(spec: &str) -> Option<Vec<String>> {
    let mut out = Vec::new();
    let bytes = spec.as_bytes();
    let mut i = 0;
    let mut tok_start = 0;
    let mut depth = 0usize;

    // split on commas not inside brackets
    let mut tokens = Vec::new();
    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth = depth.checked_sub(1)?,
            b',' if depth == 0 => {
                tokens.push(&spec[tok_start..i]);
                tok_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if depth != 0 {
        return None;
    }
    if tok_start < spec.len() {
        tokens.push(&spec[tok_start..]);
    }

    for tok in tokens {
        if tok.is_empty() {
            continue;
        }
        match tok.find('[') {
            None => out.push(tok.to_string()),
            Some(open) => {
                let close = tok.rfind(']')?;
                if close < open {
                    return None;
                }
                let prefix = &tok[..open];
                let body = &tok[open + 1..close];
                for part in body.split(',') {
                    let (lo, hi) = match part.split_once('-') {
                        Some((a, b)) => (a, b),
                        None => (part, part),
                    };
                    let width = lo.len();
                    let lo_v: u64 = lo.parse().ok()?;
                    let hi_v: u64 = hi.parse().ok()?;
                    if hi_v < lo_v {
                        return None;
                    }
                    for v in lo_v..=hi_v {
                        out.push(format!("{}{:0w$}", prefix, v, w = width));
                    }
                }
            }
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_ranges() {
        assert_eq!(compress(&["n1", "n2", "n3", "n7"]), "n[1-3,7]");
        assert_eq!(compress(&["n1"]), "n1");
        assert_eq!(compress(&["alpha", "n2", "n3"]), "alpha,n[2-3]");
    }

    #[test]
    fn test_compress_zero_padding() {
        assert_eq!(compress(&["node001", "node002"]), "node[001-002]");
        // differing widths do not merge
        assert_eq!(compress(&["n01", "n2"]), "n01,n2");
    }

    #[test]
    fn test_expand() {
        assert_eq!(
            expand("n[1-3,7]").unwrap(),
            vec!["n1", "n2", "n3", "n7"]
        );
        assert_eq!(expand("alpha,n[2-3]").unwrap().len(), 3);
        assert_eq!(expand("node[001-003]").unwrap()[2], "node003");
        assert!(expand("n[3-1]").is_none());
        assert!(expand("n[1").is_none());
    }

    #[test]
    fn test_round_trip() {
        let names = vec!["c0", "c1", "c2", "c5", "login"];
        let compact = compress(&names);
        let back = expand(&compact).unwrap();
        assert_eq!(back, names);
    }
}
