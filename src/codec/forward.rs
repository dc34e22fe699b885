//! Forwarding tree support.
//!
//! A single RPC reaches many nodes by dividing the target list into
//! subgroups; the first member of each subgroup is the proxy and the
//! rest ride along in the forwarding descriptor. The proxy re-expands
//! the descriptor locally and its reply carries one return-list entry
//! per descendant. The tree is flat two-level on the wire; in memory
//! each supervisor owns its worker set and aggregates results into a
//! `Vec`.

use crate::codec::buffer::{PackBuf, UnpackBuf};
use crate::codec::msg::{Message, MsgType};
use crate::error::SchedResult;

/// Per-message forwarding descriptor: the targets a proxy must relay
/// the message to, and the per-hop timeout they inherit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardSpec {
    /// Hostnames the receiving proxy forwards to (excludes the proxy).
    pub targets: Vec<String>,
    /// Per-hop timeout, seconds.
    pub timeout: u32,
}

impl ForwardSpec {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.targets.len() as u16);
        if !self.targets.is_empty() {
            let joined = self.targets.join(",");
            buf.pack_str(Some(&joined));
            buf.pack_u32(self.timeout);
        }
    }

    pub fn unpack(buf: &mut UnpackBuf) -> SchedResult<ForwardSpec> {
        let cnt = buf.unpack_u16()? as usize;
        if cnt == 0 {
            return Ok(ForwardSpec::default());
        }
        let joined = buf.unpack_str_req()?;
        let timeout = buf.unpack_u32()?;
        let targets: Vec<String> = joined.split(',').map(|s| s.to_string()).collect();
        Ok(ForwardSpec { targets, timeout })
    }
}

/// One aggregated reply element: the outcome of the RPC on one
/// descendant node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnItem {
    /// Errno-style code from the node (0 = success).
    pub err: u32,
    /// Type of the nested body, if any.
    pub msg_type: MsgType,
    pub node_name: String,
    pub body: Option<Box<Message>>,
}

impl ReturnItem {
    /// A bare return code from a node.
    pub fn rc(node_name: &str, err: u32) -> ReturnItem {
        ReturnItem {
            err,
            msg_type: MsgType::ResponseReturnCode,
            node_name: node_name.to_string(),
            body: None,
        }
    }

    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.err);
        buf.pack_u16(self.msg_type as u16);
        buf.pack_str(Some(&self.node_name));
        match &self.body {
            Some(body) => {
                buf.pack_u8(1);
                body.pack_body(buf);
            }
            None => buf.pack_u8(0),
        }
    }

    pub fn unpack(buf: &mut UnpackBuf) -> SchedResult<ReturnItem> {
        let err = buf.unpack_u32()?;
        let msg_type = MsgType::try_from(buf.unpack_u16()?)?;
        let node_name = buf.unpack_str_req()?;
        let body = if buf.unpack_u8()? != 0 {
            Some(Box::new(Message::unpack_body(msg_type, buf)?))
        } else {
            None
        };
        Ok(ReturnItem {
            err,
            msg_type,
            node_name,
            body,
        })
    }
}

/// Divide `node_cnt` targets into at most `fanout` subgroups, one
/// proxy per subgroup. Returns per-proxy descendant counts: `span[i]`
/// descendants follow proxy `i` in the target list. A zero `fanout`
/// uses the default width.
pub fn span(node_cnt: usize, fanout: usize) -> Vec<usize> {
    let fanout = if fanout == 0 {
        crate::constants::FORWARD_FANOUT
    } else {
        fanout
    };
    if node_cnt == 0 {
        return Vec::new();
    }
    let groups = fanout.min(node_cnt);
    let per = node_cnt / groups;
    let extra = node_cnt % groups;
    (0..groups)
        .map(|i| per + usize::from(i < extra) - 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_even() {
        // 10 nodes into 5 subgroups -> 5 proxies with 1 descendant each
        assert_eq!(span(10, 5), vec![1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_span_remainder() {
        // 7 nodes into 3 subgroups -> groups of 3+2+2
        assert_eq!(span(7, 3), vec![2, 1, 1]);
        let total: usize = span(7, 3).iter().map(|d| d + 1).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_span_small() {
        assert_eq!(span(1, 16), vec![0]);
        assert_eq!(span(0, 16), Vec::<usize>::new());
        // a single subgroup puts every descendant behind one proxy
        assert_eq!(span(3, 1), vec![2]);
    }

    #[test]
    fn test_forward_spec_round_trip() {
        let fwd = ForwardSpec {
            targets: vec!["n1".into(), "n2".into()],
            timeout: 10,
        };
        let mut b = PackBuf::new();
        fwd.pack(&mut b);
        let data = b.into_vec();
        let mut u = UnpackBuf::new(&data);
        assert_eq!(ForwardSpec::unpack(&mut u).unwrap(), fwd);
    }

    #[test]
    fn test_return_item_round_trip() {
        let item = ReturnItem::rc("n3", 8003);
        let mut b = PackBuf::new();
        item.pack(&mut b);
        let data = b.into_vec();
        let mut u = UnpackBuf::new(&data);
        assert_eq!(ReturnItem::unpack(&mut u).unwrap(), item);
    }
}
