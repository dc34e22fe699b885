//! Framed message header.
//!
//! Every message on the wire is `{header, body}` behind an explicit
//! u32 frame length; nothing is delimited by EOF. The header carries
//! the protocol version (checked at decode — a mismatch is a distinct
//! error so state-load can refuse a known-bad file), flags, the body
//! type and length, the forwarding descriptor, an optional return list
//! from downstream nodes, and the originating address.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::codec::buffer::{PackBuf, UnpackBuf};
use crate::codec::forward::{ForwardSpec, ReturnItem};
use crate::codec::msg::{Message, MsgType};
use crate::constants::PROTOCOL_VERSION;
use crate::error::{SchedError, SchedResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub msg_type: MsgType,
    pub body_length: u32,
    pub forward: ForwardSpec,
    pub ret_list: Vec<ReturnItem>,
    pub orig_addr: SocketAddrV4,
}

impl Header {
    pub fn new(msg_type: MsgType) -> Header {
        Header {
            version: PROTOCOL_VERSION,
            flags: 0,
            msg_type,
            body_length: 0,
            forward: ForwardSpec::default(),
            ret_list: Vec::new(),
            orig_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.version);
        buf.pack_u16(self.flags);
        buf.pack_u16(self.msg_type as u16);
        buf.pack_u32(self.body_length);
        self.forward.pack(buf);
        buf.pack_u16(self.ret_list.len() as u16);
        for item in &self.ret_list {
            item.pack(buf);
        }
        buf.pack_addr(self.orig_addr);
    }

    pub fn unpack(buf: &mut UnpackBuf) -> SchedResult<Header> {
        let version = buf.unpack_u16()?;
        if version != PROTOCOL_VERSION {
            return Err(SchedError::VersionMismatch {
                got: version,
                want: PROTOCOL_VERSION,
            });
        }
        let flags = buf.unpack_u16()?;
        let msg_type = MsgType::try_from(buf.unpack_u16()?)?;
        let body_length = buf.unpack_u32()?;
        let forward = ForwardSpec::unpack(buf)?;
        let ret_cnt = buf.unpack_u16()? as usize;
        if ret_cnt > buf.remaining() {
            return Err(SchedError::Decode("return list exceeds buffer".into()));
        }
        let mut ret_list = Vec::with_capacity(ret_cnt);
        for _ in 0..ret_cnt {
            ret_list.push(ReturnItem::unpack(buf)?);
        }
        let orig_addr = buf.unpack_addr()?;
        Ok(Header {
            version,
            flags,
            msg_type,
            body_length,
            forward,
            ret_list,
            orig_addr,
        })
    }
}

/// Encode a complete frame: header (with its body length fixed up),
/// an authentication credential blob, then the packed body. The outer
/// u32 length prefix is added by the transport when writing to a
/// stream. Internal traffic uses an empty credential.
pub fn encode_frame_with_cred(
    msg: &Message,
    forward: ForwardSpec,
    orig_addr: SocketAddrV4,
    cred: &[u8],
) -> Vec<u8> {
    let mut body = PackBuf::new();
    msg.pack_body(&mut body);

    let mut header = Header::new(msg.msg_type());
    header.body_length = body.len() as u32;
    header.forward = forward;
    header.orig_addr = orig_addr;

    let mut out = PackBuf::with_capacity(body.len() + 64 + cred.len());
    header.pack(&mut out);
    out.pack_mem(cred);
    let mut framed = out.into_vec();
    framed.extend_from_slice(body.as_slice());
    framed
}

/// Credential-less frame for controller-internal traffic.
pub fn encode_frame(msg: &Message, forward: ForwardSpec, orig_addr: SocketAddrV4) -> Vec<u8> {
    encode_frame_with_cred(msg, forward, orig_addr, &[])
}

/// Decode a complete frame into header, credential, and body. The body
/// length recorded in the header must match the bytes that follow the
/// credential.
pub fn decode_frame_with_cred(data: &[u8]) -> SchedResult<(Header, Vec<u8>, Message)> {
    let mut buf = UnpackBuf::new(data);
    let header = Header::unpack(&mut buf)?;
    let cred = buf.unpack_mem()?;
    if buf.remaining() != header.body_length as usize {
        return Err(SchedError::Decode(format!(
            "body length mismatch: header says {}, frame carries {}",
            header.body_length,
            buf.remaining()
        )));
    }
    let body = Message::unpack_body(header.msg_type, &mut buf)?;
    Ok((header, cred, body))
}

/// Decode a frame, discarding the credential.
pub fn decode_frame(data: &[u8]) -> SchedResult<(Header, Message)> {
    let (header, _cred, body) = decode_frame_with_cred(data)?;
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::msg::SuspendMsg;

    fn addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6817)
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::RequestSuspend(SuspendMsg { op: 0, job_id: 17 });
        let frame = encode_frame(&msg, ForwardSpec::default(), addr());
        let (header, body) = decode_frame(&frame).unwrap();
        assert_eq!(header.msg_type, MsgType::RequestSuspend);
        assert_eq!(header.orig_addr, addr());
        assert_eq!(body, msg);
    }

    #[test]
    fn test_frame_with_forwarding() {
        let fwd = ForwardSpec {
            targets: vec!["n1".into(), "n2".into(), "n3".into()],
            timeout: 30,
        };
        let frame = encode_frame(&Message::RequestPing, fwd.clone(), addr());
        let (header, _) = decode_frame(&frame).unwrap();
        assert_eq!(header.forward, fwd);
    }

    #[test]
    fn test_version_gate() {
        let msg = Message::RequestPing;
        let mut frame = encode_frame(&msg, ForwardSpec::default(), addr());
        frame[0] = 0x7f; // corrupt the version
        match decode_frame(&frame) {
            Err(SchedError::VersionMismatch { .. }) => {}
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_credential_carried() {
        let msg = Message::rc(0);
        let cred = vec![1, 2, 3, 4];
        let frame = encode_frame_with_cred(&msg, ForwardSpec::default(), addr(), &cred);
        let (_, got_cred, body) = decode_frame_with_cred(&frame).unwrap();
        assert_eq!(got_cred, cred);
        assert_eq!(body, msg);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let msg = Message::rc(0);
        let mut frame = encode_frame(&msg, ForwardSpec::default(), addr());
        frame.push(0); // trailing garbage
        assert!(decode_frame(&frame).is_err());
    }
}
