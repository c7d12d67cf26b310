//! Control command numbers.
//!
//! Request numbers use the Linux `_IOC` layout: bits 0..8 hold the command
//! number, 8..16 the device magic, 16..30 the payload size and 30..32 the
//! copy direction. A request whose encoded size disagrees with the
//! command's payload layout is rejected before anything is decoded.

use crate::config::defaults::NAME_LEN;
use crate::error::{Error, Result};

/// Magic byte identifying this device's requests.
pub const IOC_MAGIC: u8 = 0x77;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const SIZE_SHIFT: u32 = 16;
const DIR_SHIFT: u32 = 30;
const SIZE_MASK: u32 = (1 << 14) - 1;

/// Which way the payload is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    /// No payload.
    None = 0,
    /// Caller to device.
    Write = 1,
    /// Device to caller.
    Read = 2,
    /// Both ways.
    ReadWrite = 3,
}

/// A control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Rename a region: fd `i32`, name `[u8; NAME_LEN]`.
    SetName = 1,
    /// Read a region's name into the payload: fd `i32`, name `[u8; NAME_LEN]`.
    GetName = 2,
    /// Resize a region: fd `i32`, size `u64`.
    SetSize = 3,
    /// Returns the region size: fd `i32`.
    GetSize = 4,
    /// Narrow the protection mask: fd `i32`, mask `u32`.
    SetProtMask = 5,
    /// Returns the protection mask bits: fd `i32`.
    GetProtMask = 6,
    /// Returns 1 if the range was purged: fd `i32`, offset `u32`, len `u32`.
    Pin = 7,
    /// Unpin a range: fd `i32`, offset `u32`, len `u32`.
    Unpin = 8,
    /// Returns 1 if any page is pinned: fd `i32`, offset `u32`, len `u32`.
    GetPinStatus = 9,
    /// Returns the number of pages purged. No payload.
    PurgeAllCaches = 10,
    /// Returns a new fd: size `u64`, name `[u8; NAME_LEN]`.
    CreateRegion = 11,
    /// Offer a region: fd `i32`, key `u64`.
    PublishForHandoff = 12,
    /// Returns a new fd: key `u64`.
    ClaimHandoff = 13,
}

impl Command {
    /// Every command, in number order.
    pub const ALL: [Command; 13] = [
        Command::SetName,
        Command::GetName,
        Command::SetSize,
        Command::GetSize,
        Command::SetProtMask,
        Command::GetProtMask,
        Command::Pin,
        Command::Unpin,
        Command::GetPinStatus,
        Command::PurgeAllCaches,
        Command::CreateRegion,
        Command::PublishForHandoff,
        Command::ClaimHandoff,
    ];

    /// The command number.
    pub const fn nr(self) -> u8 {
        self as u8
    }

    /// Short name used in logs and metrics.
    pub const fn name(self) -> &'static str {
        match self {
            Command::SetName => "set-name",
            Command::GetName => "get-name",
            Command::SetSize => "set-size",
            Command::GetSize => "get-size",
            Command::SetProtMask => "set-prot-mask",
            Command::GetProtMask => "get-prot-mask",
            Command::Pin => "pin",
            Command::Unpin => "unpin",
            Command::GetPinStatus => "get-pin-status",
            Command::PurgeAllCaches => "purge-all-caches",
            Command::CreateRegion => "create-region",
            Command::PublishForHandoff => "publish-for-handoff",
            Command::ClaimHandoff => "claim-handoff",
        }
    }

    /// Exact payload length in bytes.
    pub const fn payload_size(self) -> usize {
        match self {
            Command::SetName | Command::GetName => 4 + NAME_LEN,
            Command::SetSize => 4 + 8,
            Command::GetSize | Command::GetProtMask => 4,
            Command::SetProtMask => 4 + 4,
            Command::Pin | Command::Unpin | Command::GetPinStatus => 4 + 4 + 4,
            Command::PurgeAllCaches => 0,
            Command::CreateRegion => 8 + NAME_LEN,
            Command::PublishForHandoff => 4 + 8,
            Command::ClaimHandoff => 8,
        }
    }

    /// Copy direction of the payload.
    pub const fn direction(self) -> Direction {
        match self {
            Command::PurgeAllCaches => Direction::None,
            Command::GetName => Direction::ReadWrite,
            _ => Direction::Write,
        }
    }

    /// The encoded request number.
    pub const fn request(self) -> u32 {
        ((self.direction() as u32) << DIR_SHIFT)
            | ((self.payload_size() as u32 & SIZE_MASK) << SIZE_SHIFT)
            | ((IOC_MAGIC as u32) << TYPE_SHIFT)
            | ((self.nr() as u32) << NR_SHIFT)
    }

    /// Payload size encoded in a raw request number.
    pub const fn encoded_size(request: u32) -> usize {
        ((request >> SIZE_SHIFT) & SIZE_MASK) as usize
    }

    /// Decode a raw request number, validating magic, number, direction
    /// and payload size.
    pub fn from_request(request: u32) -> Result<Self> {
        let magic = ((request >> TYPE_SHIFT) & 0xff) as u8;
        if magic != IOC_MAGIC {
            return Err(Error::InvalidArgument(format!(
                "request {request:#x} is not for this device"
            )));
        }
        let nr = ((request >> NR_SHIFT) & 0xff) as u8;
        let command = Self::ALL
            .into_iter()
            .find(|c| c.nr() == nr)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown command number {nr}")))?;

        let size = Self::encoded_size(request);
        if size != command.payload_size() {
            return Err(Error::InvalidArgument(format!(
                "{} expects a {}-byte payload, request encodes {size}",
                command.name(),
                command.payload_size()
            )));
        }
        if request >> DIR_SHIFT != command.direction() as u32 {
            return Err(Error::InvalidArgument(format!(
                "{} used with the wrong direction",
                command.name()
            )));
        }
        Ok(command)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
