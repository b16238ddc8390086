//! Framed wire protocol.
//!
//! Every message is one length-prefixed frame over a reliable stream. The
//! write path (put/del) and overlay maintenance go through here; the read
//! path never does, it goes through the fabric. Layouts are explicit
//! little-endian so frames are identical regardless of the host.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use inari_types::{KeyId, NodeId, OverlayKind, RegionDescriptor};

use crate::error::{NetError, NetResult};

/// Upper bound on a single frame; puts above the inline threshold travel
/// by remote read, so frames stay small.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Ask for the node-info region descriptor.
    Init,
    /// Key and value travel in the frame; `data` is `key ++ value`.
    PutInline { key_len: u8, data: Vec<u8> },
    /// Key and value sit in client memory; the server fetches them with a
    /// one-sided read.
    PutRemote { key_len: u32, kv: RegionDescriptor },
    DelInline { key: Vec<u8> },
    DelRemote { key: RegionDescriptor },
    /// Overlay: the sender believes it is our predecessor.
    Predecessor { node: NodeId },
    /// Overlay: rewrite routing entry `index`.
    Update { index: u32, node: NodeId },
    /// Overlay: admit a new node into the keyspace.
    Join { host: String, port: String },
    /// Overlay: ask for the Chord routing-table descriptor.
    ChordTable,
    /// Courtesy notice before the client tears the connection down.
    Disconnect,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Init { info: RegionDescriptor },
    Ack { success: bool },
    Chord { table: RegionDescriptor },
    Network {
        kind: OverlayKind,
        entries: u16,
        table: RegionDescriptor,
    },
    JoinReply { start: KeyId, id: KeyId },
    /// Unsolicited: the node resized and republished its info cell.
    Resize { info: RegionDescriptor },
}

mod tag {
    pub const REQ_INIT: u8 = 1;
    pub const REQ_PUT_INLINE: u8 = 2;
    pub const REQ_PUT_REMOTE: u8 = 3;
    pub const REQ_DEL_INLINE: u8 = 4;
    pub const REQ_DEL_REMOTE: u8 = 5;
    pub const REQ_PREDECESSOR: u8 = 6;
    pub const REQ_UPDATE: u8 = 7;
    pub const REQ_JOIN: u8 = 8;
    pub const REQ_CHORD: u8 = 9;
    pub const REQ_DISCONNECT: u8 = 10;

    pub const RESP_INIT: u8 = 1;
    pub const RESP_ACK: u8 = 2;
    pub const RESP_CHORD: u8 = 3;
    pub const RESP_NETWORK: u8 = 4;
    pub const RESP_JOIN_REPLY: u8 = 5;
    pub const RESP_RESIZE: u8 = 6;

    pub const OVERLAY_FIXED: u8 = 0;
    pub const OVERLAY_CHORD: u8 = 1;
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Request::Init => buf.put_u8(tag::REQ_INIT),
            Request::PutInline { key_len, data } => {
                debug_assert!(data.len() <= u8::MAX as usize);
                buf.put_u8(tag::REQ_PUT_INLINE);
                buf.put_u8(*key_len);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Request::PutRemote { key_len, kv } => {
                buf.put_u8(tag::REQ_PUT_REMOTE);
                buf.put_u32_le(*key_len);
                kv.put(&mut buf);
            }
            Request::DelInline { key } => {
                debug_assert!(key.len() <= u8::MAX as usize);
                buf.put_u8(tag::REQ_DEL_INLINE);
                buf.put_u8(key.len() as u8);
                buf.put_slice(key);
            }
            Request::DelRemote { key } => {
                buf.put_u8(tag::REQ_DEL_REMOTE);
                key.put(&mut buf);
            }
            Request::Predecessor { node } => {
                buf.put_u8(tag::REQ_PREDECESSOR);
                node.put(&mut buf);
            }
            Request::Update { index, node } => {
                buf.put_u8(tag::REQ_UPDATE);
                buf.put_u32_le(*index);
                node.put(&mut buf);
            }
            Request::Join { host, port } => {
                buf.put_u8(tag::REQ_JOIN);
                put_str(&mut buf, host);
                put_str(&mut buf, port);
            }
            Request::ChordTable => buf.put_u8(tag::REQ_CHORD),
            Request::Disconnect => buf.put_u8(tag::REQ_DISCONNECT),
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> NetResult<Self> {
        let buf = &mut buf;
        let t = get_u8(buf)?;
        let req = match t {
            tag::REQ_INIT => Request::Init,
            tag::REQ_PUT_INLINE => {
                let key_len = get_u8(buf)?;
                let len = get_u8(buf)? as usize;
                let data = get_bytes(buf, len)?;
                if (key_len as usize) > data.len() {
                    return Err(NetError::InvalidFrame(format!(
                        "inline put: key of {key_len} bytes in a {} byte blob",
                        data.len()
                    )));
                }
                Request::PutInline { key_len, data }
            }
            tag::REQ_PUT_REMOTE => Request::PutRemote {
                key_len: get_u32(buf)?,
                kv: RegionDescriptor::get(buf)?,
            },
            tag::REQ_DEL_INLINE => {
                let len = get_u8(buf)? as usize;
                Request::DelInline {
                    key: get_bytes(buf, len)?,
                }
            }
            tag::REQ_DEL_REMOTE => Request::DelRemote {
                key: RegionDescriptor::get(buf)?,
            },
            tag::REQ_PREDECESSOR => Request::Predecessor {
                node: NodeId::get(buf)?,
            },
            tag::REQ_UPDATE => Request::Update {
                index: get_u32(buf)?,
                node: NodeId::get(buf)?,
            },
            tag::REQ_JOIN => Request::Join {
                host: get_str(buf)?,
                port: get_str(buf)?,
            },
            tag::REQ_CHORD => Request::ChordTable,
            tag::REQ_DISCONNECT => Request::Disconnect,
            other => {
                return Err(NetError::InvalidFrame(format!("unknown request tag {other}")));
            }
        };
        Ok(req)
    }
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Response::Init { info } => {
                buf.put_u8(tag::RESP_INIT);
                info.put(&mut buf);
            }
            Response::Ack { success } => {
                buf.put_u8(tag::RESP_ACK);
                buf.put_u8(*success as u8);
            }
            Response::Chord { table } => {
                buf.put_u8(tag::RESP_CHORD);
                table.put(&mut buf);
            }
            Response::Network {
                kind,
                entries,
                table,
            } => {
                buf.put_u8(tag::RESP_NETWORK);
                buf.put_u8(match kind {
                    OverlayKind::Fixed => tag::OVERLAY_FIXED,
                    OverlayKind::Chord => tag::OVERLAY_CHORD,
                });
                buf.put_u16_le(*entries);
                table.put(&mut buf);
            }
            Response::JoinReply { start, id } => {
                buf.put_u8(tag::RESP_JOIN_REPLY);
                buf.put_u16_le(start.0);
                buf.put_u16_le(id.0);
            }
            Response::Resize { info } => {
                buf.put_u8(tag::RESP_RESIZE);
                info.put(&mut buf);
            }
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> NetResult<Self> {
        let buf = &mut buf;
        let t = get_u8(buf)?;
        let resp = match t {
            tag::RESP_INIT => Response::Init {
                info: RegionDescriptor::get(buf)?,
            },
            tag::RESP_ACK => Response::Ack {
                success: get_u8(buf)? != 0,
            },
            tag::RESP_CHORD => Response::Chord {
                table: RegionDescriptor::get(buf)?,
            },
            tag::RESP_NETWORK => Response::Network {
                kind: match get_u8(buf)? {
                    tag::OVERLAY_FIXED => OverlayKind::Fixed,
                    tag::OVERLAY_CHORD => OverlayKind::Chord,
                    other => {
                        return Err(NetError::InvalidFrame(format!(
                            "unknown overlay kind {other}"
                        )));
                    }
                },
                entries: get_u16(buf)?,
                table: RegionDescriptor::get(buf)?,
            },
            tag::RESP_JOIN_REPLY => Response::JoinReply {
                start: KeyId(get_u16(buf)?),
                id: KeyId(get_u16(buf)?),
            },
            tag::RESP_RESIZE => Response::Resize {
                info: RegionDescriptor::get(buf)?,
            },
            other => {
                return Err(NetError::InvalidFrame(format!(
                    "unknown response tag {other}"
                )));
            }
        };
        Ok(resp)
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize);
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> NetResult<String> {
    let len = get_u8(buf)? as usize;
    let bytes = get_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|e| NetError::InvalidFrame(e.to_string()))
}

fn get_u8(buf: &mut &[u8]) -> NetResult<u8> {
    if buf.remaining() < 1 {
        return Err(short(1, buf.remaining()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> NetResult<u16> {
    if buf.remaining() < 2 {
        return Err(short(2, buf.remaining()));
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut &[u8]) -> NetResult<u32> {
    if buf.remaining() < 4 {
        return Err(short(4, buf.remaining()));
    }
    Ok(buf.get_u32_le())
}

fn get_bytes(buf: &mut &[u8], len: usize) -> NetResult<Vec<u8>> {
    if buf.remaining() < len {
        return Err(short(len, buf.remaining()));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn short(need: usize, have: usize) -> NetError {
    NetError::InvalidFrame(format!(
        "truncated frame: need {need} more bytes, have {have}"
    ))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> NetResult<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_BYTES {
        return Err(NetError::FrameTooLarge(frame.len()));
    }
    writer.write_u32_le(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A clean EOF before the length prefix
/// maps to `ConnectionLost`.
pub async fn read_frame<R>(reader: &mut R) -> NetResult<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetError::ConnectionLost);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(NetError::FrameTooLarge(len));
    }
    let mut frame = BytesMut::zeroed(len);
    reader.read_exact(&mut frame).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NetError::ConnectionLost
        } else {
            NetError::from(e)
        }
    })?;
    Ok(frame)
}
