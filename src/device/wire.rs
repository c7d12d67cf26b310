//! Fixed-layout little-endian payloads.

use super::Command;
use crate::config::defaults::NAME_LEN;
use crate::error::{Error, Result};
use crate::handoff::{Fd, HandoffKey};
use crate::pin::{PinOutcome, PinStatus};
use rustix::mm::ProtFlags;

/// Cursor over a request payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or_else(|| Error::InvalidArgument("payload too short".into()))?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn read_fd(&mut self) -> Result<Fd> {
        Ok(Fd::from_raw(i32::from_le_bytes(self.take()?)))
    }

    fn read_usize(&mut self) -> Result<usize> {
        let value = self.read_u64()?;
        usize::try_from(value)
            .map_err(|_| Error::InvalidArgument(format!("{value} does not fit in usize")))
    }

    /// A NUL-terminated name field of `NAME_LEN` bytes. A field without a
    /// terminator is cut at `NAME_LEN - 1`.
    fn read_name(&mut self) -> Result<String> {
        let field: [u8; NAME_LEN] = self.take()?;
        let end = field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LEN - 1);
        std::str::from_utf8(&field[..end])
            .map(str::to_owned)
            .map_err(|_| Error::InvalidArgument("name is not valid UTF-8".into()))
    }
}

/// Payload builder.
#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn write_fd(&mut self, fd: Fd) {
        self.buf.extend_from_slice(&fd.as_raw().to_le_bytes());
    }

    fn write_name(&mut self, name: &str) {
        self.buf.extend_from_slice(&encode_name(name));
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode `name` into a NUL-padded `NAME_LEN` field, truncating on a
/// character boundary.
pub(super) fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let mut end = name.len().min(NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Allocate a region and open it.
    CreateRegion {
        /// Advisory name.
        name: String,
        /// Size in bytes.
        size: usize,
    },
    /// Rename a region.
    SetName {
        /// Caller's handle.
        fd: Fd,
        /// New name.
        name: String,
    },
    /// Read a region's name.
    GetName {
        /// Caller's handle.
        fd: Fd,
    },
    /// Resize a region.
    SetSize {
        /// Caller's handle.
        fd: Fd,
        /// New size in bytes.
        size: usize,
    },
    /// Read a region's size.
    GetSize {
        /// Caller's handle.
        fd: Fd,
    },
    /// Narrow a region's protection mask.
    SetProtMask {
        /// Caller's handle.
        fd: Fd,
        /// New mask.
        mask: ProtFlags,
    },
    /// Read a region's protection mask.
    GetProtMask {
        /// Caller's handle.
        fd: Fd,
    },
    /// Pin a range.
    Pin {
        /// Caller's handle.
        fd: Fd,
        /// Byte offset.
        offset: usize,
        /// Byte length; zero means to the end.
        len: usize,
    },
    /// Unpin a range.
    Unpin {
        /// Caller's handle.
        fd: Fd,
        /// Byte offset.
        offset: usize,
        /// Byte length; zero means to the end.
        len: usize,
    },
    /// Query whether a range is pinned.
    GetPinStatus {
        /// Caller's handle.
        fd: Fd,
        /// Byte offset.
        offset: usize,
        /// Byte length; zero means to the end.
        len: usize,
    },
    /// Purge every purge-eligible region.
    PurgeAllCaches,
    /// Offer a region for handoff.
    PublishForHandoff {
        /// Caller's handle.
        fd: Fd,
        /// Offer key.
        key: HandoffKey,
    },
    /// Claim an offered region.
    ClaimHandoff {
        /// Offer key.
        key: HandoffKey,
    },
}

impl Request {
    /// The command carrying this request.
    pub fn command(&self) -> Command {
        match self {
            Request::CreateRegion { .. } => Command::CreateRegion,
            Request::SetName { .. } => Command::SetName,
            Request::GetName { .. } => Command::GetName,
            Request::SetSize { .. } => Command::SetSize,
            Request::GetSize { .. } => Command::GetSize,
            Request::SetProtMask { .. } => Command::SetProtMask,
            Request::GetProtMask { .. } => Command::GetProtMask,
            Request::Pin { .. } => Command::Pin,
            Request::Unpin { .. } => Command::Unpin,
            Request::GetPinStatus { .. } => Command::GetPinStatus,
            Request::PurgeAllCaches => Command::PurgeAllCaches,
            Request::PublishForHandoff { .. } => Command::PublishForHandoff,
            Request::ClaimHandoff { .. } => Command::ClaimHandoff,
        }
    }

    /// Decode `payload` for `command`. The payload length must match the
    /// command's layout exactly.
    pub fn decode(command: Command, payload: &[u8]) -> Result<Self> {
        if payload.len() != command.payload_size() {
            return Err(Error::InvalidArgument(format!(
                "{command} expects a {}-byte payload, got {}",
                command.payload_size(),
                payload.len()
            )));
        }

        let mut r = Reader::new(payload);
        let request = match command {
            Command::CreateRegion => {
                let size = r.read_usize()?;
                let name = r.read_name()?;
                Request::CreateRegion { name, size }
            }
            Command::SetName => Request::SetName {
                fd: r.read_fd()?,
                name: r.read_name()?,
            },
            Command::GetName => Request::GetName { fd: r.read_fd()? },
            Command::SetSize => Request::SetSize {
                fd: r.read_fd()?,
                size: r.read_usize()?,
            },
            Command::GetSize => Request::GetSize { fd: r.read_fd()? },
            Command::SetProtMask => {
                let fd = r.read_fd()?;
                let bits = r.read_u32()?;
                let known = ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC;
                if bits & !known.bits() != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "unknown protection bits {bits:#x}"
                    )));
                }
                Request::SetProtMask {
                    fd,
                    mask: ProtFlags::from_bits_retain(bits),
                }
            }
            Command::GetProtMask => Request::GetProtMask { fd: r.read_fd()? },
            Command::Pin | Command::Unpin | Command::GetPinStatus => {
                let fd = r.read_fd()?;
                let offset = r.read_u32()? as usize;
                let len = r.read_u32()? as usize;
                match command {
                    Command::Pin => Request::Pin { fd, offset, len },
                    Command::Unpin => Request::Unpin { fd, offset, len },
                    _ => Request::GetPinStatus { fd, offset, len },
                }
            }
            Command::PurgeAllCaches => Request::PurgeAllCaches,
            Command::PublishForHandoff => Request::PublishForHandoff {
                fd: r.read_fd()?,
                key: HandoffKey::new(r.read_u64()?),
            },
            Command::ClaimHandoff => Request::ClaimHandoff {
                key: HandoffKey::new(r.read_u64()?),
            },
        };
        Ok(request)
    }

    /// Encode into the command's payload layout.
    ///
    /// Fails if an offset or length does not fit the 32-bit pin fields.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::default();
        match self {
            Request::CreateRegion { name, size } => {
                w.write_u64(*size as u64);
                w.write_name(name);
            }
            Request::SetName { fd, name } => {
                w.write_fd(*fd);
                w.write_name(name);
            }
            Request::GetName { fd } => {
                w.write_fd(*fd);
                w.write_name("");
            }
            Request::SetSize { fd, size } => {
                w.write_fd(*fd);
                w.write_u64(*size as u64);
            }
            Request::GetSize { fd } | Request::GetProtMask { fd } => w.write_fd(*fd),
            Request::SetProtMask { fd, mask } => {
                w.write_fd(*fd);
                w.write_u32(mask.bits());
            }
            Request::Pin { fd, offset, len }
            | Request::Unpin { fd, offset, len }
            | Request::GetPinStatus { fd, offset, len } => {
                w.write_fd(*fd);
                w.write_u32(pin_field(*offset)?);
                w.write_u32(pin_field(*len)?);
            }
            Request::PurgeAllCaches => {}
            Request::PublishForHandoff { fd, key } => {
                w.write_fd(*fd);
                w.write_u64(key.as_raw());
            }
            Request::ClaimHandoff { key } => w.write_u64(key.as_raw()),
        }
        Ok(w.finish())
    }
}

fn pin_field(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::InvalidArgument(format!("{value} does not fit a pin field")))
}

/// Result of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Nothing to report.
    Done,
    /// A handle opened in the caller's table.
    Fd(Fd),
    /// A size in bytes.
    Size(usize),
    /// A region name.
    Name(String),
    /// A protection mask.
    ProtMask(ProtFlags),
    /// Outcome of a pin.
    Pin(PinOutcome),
    /// Whether an unpinned range had been purged.
    Unpin(bool),
    /// Pin status of a range.
    PinStatus(PinStatus),
    /// Pages discarded.
    Purged(usize),
}

impl Reply {
    /// The value returned by a raw control call.
    ///
    /// Pins and unpins return 1 when the range was purged; pin status
    /// returns 1 when any page is pinned.
    pub fn value(&self) -> i64 {
        match self {
            Reply::Done | Reply::Name(_) => 0,
            Reply::Fd(fd) => i64::from(fd.as_raw()),
            Reply::Size(n) | Reply::Purged(n) => i64::try_from(*n).unwrap_or(i64::MAX),
            Reply::ProtMask(mask) => i64::from(mask.bits()),
            Reply::Pin(outcome) => i64::from(outcome.was_purged()),
            Reply::Unpin(was_purged) => i64::from(*was_purged),
            Reply::PinStatus(status) => i64::from(*status == PinStatus::Pinned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            Request::decode(Command::Pin, &[0u8; 8]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(Request::decode(Command::PurgeAllCaches, &[0]).is_err());
    }

    #[test]
    fn test_pin_payload_layout() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3i32.to_le_bytes());
        payload.extend_from_slice(&4096u32.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());

        let request = Request::decode(Command::Pin, &payload).unwrap();
        assert_eq!(
            request,
            Request::Pin {
                fd: Fd::from_raw(3),
                offset: 4096,
                len: 0
            }
        );
        assert_eq!(request.encode().unwrap(), payload);
    }

    #[test]
    fn test_name_field() {
        let request = Request::CreateRegion {
            name: "r1".into(),
            size: 4096,
        };
        let payload = request.encode().unwrap();
        assert_eq!(payload.len(), Command::CreateRegion.payload_size());
        assert_eq!(&payload[8..11], b"r1\0");
        assert_eq!(Request::decode(Command::CreateRegion, &payload).unwrap(), request);
    }

    #[test]
    fn test_unterminated_name_truncated() {
        let mut payload = vec![0u8; Command::SetName.payload_size()];
        payload[4..].fill(b'a');
        match Request::decode(Command::SetName, &payload).unwrap() {
            Request::SetName { name, .. } => assert_eq!(name.len(), NAME_LEN - 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_prot_bits() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&0x80u32.to_le_bytes());
        assert!(matches!(
            Request::decode(Command::SetProtMask, &payload),
            Err(Error::InvalidArgument(_))
        ));

        payload[4..].copy_from_slice(&(ProtFlags::READ | ProtFlags::WRITE).bits().to_le_bytes());
        assert_eq!(
            Request::decode(Command::SetProtMask, &payload).unwrap(),
            Request::SetProtMask {
                fd: Fd::from_raw(0),
                mask: ProtFlags::READ | ProtFlags::WRITE
            }
        );
    }

    #[test]
    fn test_oversized_pin_offset() {
        let request = Request::Unpin {
            fd: Fd::from_raw(0),
            offset: usize::MAX,
            len: 0,
        };
        assert!(request.encode().is_err());
    }

    #[test]
    fn test_reply_values() {
        assert_eq!(Reply::Pin(PinOutcome::WasPurged).value(), 1);
        assert_eq!(Reply::Pin(PinOutcome::Pinned).value(), 0);
        assert_eq!(Reply::Unpin(true).value(), 1);
        assert_eq!(Reply::PinStatus(PinStatus::Unpinned).value(), 0);
        assert_eq!(Reply::Fd(Fd::from_raw(5)).value(), 5);
    }
}
