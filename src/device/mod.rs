//! Control device: the raw request interface.
//!
//! A process opens the [`ControlDevice`] and gets a [`DeviceFile`] bound to
//! itself. Requests are either typed ([`DeviceFile::call`]) or raw
//! ([`DeviceFile::ioctl`]): a request number plus a fixed-size little-endian
//! payload, returning a non-negative value or a negative errno.
//!
//! # Example
//!
//! ```rust
//! use ashfile::device::{Command, ControlDevice, Request};
//! use ashfile::{Service, ServiceConfig};
//!
//! let service = Service::start(ServiceConfig::testing());
//! let device = ControlDevice::new(service.clone());
//! let file = device.open(service.spawn_process().unwrap()).unwrap();
//!
//! let payload = Request::CreateRegion { name: "dev".into(), size: 4096 }
//!     .encode()
//!     .unwrap();
//! let fd = file.ioctl(Command::CreateRegion.request(), &mut payload.clone());
//! assert!(fd >= 0);
//!
//! // A payload of the wrong size is refused with -EINVAL.
//! assert_eq!(file.ioctl(Command::GetSize.request(), &mut [0u8; 2]), -22);
//! ```

mod command;
mod wire;

pub use command::{Command, Direction, IOC_MAGIC};
pub use wire::{Reply, Request};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::handoff::Process;
use crate::observability;
use crate::service::Service;
use std::sync::Arc;

/// Name under which the device would be registered.
pub const DEVICE_NAME: &str = "ashfile";

/// The device node. Opening it binds a [`DeviceFile`] to a process.
#[derive(Debug, Clone)]
pub struct ControlDevice {
    service: Arc<Service>,
}

impl ControlDevice {
    /// Create the device for `service`.
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    /// Open the device on behalf of `process`.
    pub fn open(&self, process: Arc<Process>) -> Result<DeviceFile> {
        self.service.ensure_running()?;
        tracing::trace!(pid = %process.pid(), device = DEVICE_NAME, "device opened");
        Ok(DeviceFile {
            client: self.service.client(process),
        })
    }
}

/// An open device, bound to the process that opened it.
#[derive(Debug, Clone)]
pub struct DeviceFile {
    client: Client,
}

impl DeviceFile {
    /// The client facade this file dispatches to.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Execute a typed request.
    pub fn call(&self, request: Request) -> Result<Reply> {
        let command = request.command();
        let spans = &self.client.service().config().tracing;
        let _span = observability::span_request(spans, self.client.pid(), command.name()).entered();

        let result = self.dispatch(request);
        if let Err(e) = &result {
            observability::trace_rejected(self.client.pid(), command.name(), e);
            observability::record_request_failed(command.name(), e.errno());
        }
        result
    }

    fn dispatch(&self, request: Request) -> Result<Reply> {
        let client = &self.client;
        let reply = match request {
            Request::CreateRegion { name, size } => Reply::Fd(client.create(&name, size)?),
            Request::SetName { fd, name } => {
                client.set_name(fd, &name)?;
                Reply::Done
            }
            Request::GetName { fd } => Reply::Name(client.get_name(fd)?),
            Request::SetSize { fd, size } => {
                client.set_size(fd, size)?;
                Reply::Done
            }
            Request::GetSize { fd } => Reply::Size(client.get_size(fd)?),
            Request::SetProtMask { fd, mask } => {
                client.set_prot_mask(fd, mask)?;
                Reply::Done
            }
            Request::GetProtMask { fd } => Reply::ProtMask(client.get_prot_mask(fd)?),
            Request::Pin { fd, offset, len } => Reply::Pin(client.pin(fd, offset, len)?),
            Request::Unpin { fd, offset, len } => Reply::Unpin(client.unpin(fd, offset, len)?),
            Request::GetPinStatus { fd, offset, len } => {
                Reply::PinStatus(client.pin_status(fd, offset, len)?)
            }
            Request::PurgeAllCaches => {
                client.service().ensure_running()?;
                Reply::Purged(client.service().purge_all())
            }
            Request::PublishForHandoff { fd, key } => {
                client.publish(fd, key)?;
                Reply::Done
            }
            Request::ClaimHandoff { key } => Reply::Fd(client.claim(key)?),
        };
        Ok(reply)
    }

    /// Execute a raw request.
    ///
    /// `payload` must be exactly the size encoded in `request`. Commands
    /// that return data in the payload (get-name) write it back in place.
    /// Returns the reply value, or a negative errno.
    pub fn ioctl(&self, request: u32, payload: &mut [u8]) -> i64 {
        match self.ioctl_inner(request, payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(request, error = %e, "raw request failed");
                i64::from(e.errno())
            }
        }
    }

    fn ioctl_inner(&self, request: u32, payload: &mut [u8]) -> Result<i64> {
        let command = Command::from_request(request)?;
        if payload.len() != Command::encoded_size(request) {
            return Err(Error::InvalidArgument(format!(
                "{command} payload is {} bytes, request encodes {}",
                payload.len(),
                Command::encoded_size(request)
            )));
        }

        let reply = self.call(Request::decode(command, payload)?)?;
        if let Reply::Name(name) = &reply {
            payload[4..].copy_from_slice(&wire::encode_name(name));
        }
        Ok(reply.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::handoff::{Fd, HandoffKey};
    use crate::pin::PinOutcome;

    fn open() -> (Arc<Service>, DeviceFile) {
        let service = Service::start(ServiceConfig::testing());
        let device = ControlDevice::new(Arc::clone(&service));
        let file = device.open(service.spawn_process().unwrap()).unwrap();
        (service, file)
    }

    fn raw(file: &DeviceFile, request: Request) -> i64 {
        let mut payload = request.encode().unwrap();
        file.ioctl(request.command().request(), &mut payload)
    }

    #[test]
    fn test_typed_lifecycle() {
        let (_service, file) = open();
        let Reply::Fd(fd) = file
            .call(Request::CreateRegion {
                name: "typed".into(),
                size: 8192,
            })
            .unwrap()
        else {
            panic!("create did not return a handle");
        };

        assert_eq!(file.call(Request::GetSize { fd }).unwrap(), Reply::Size(8192));
        assert_eq!(
            file.call(Request::Pin { fd, offset: 0, len: 0 }).unwrap(),
            Reply::Pin(PinOutcome::Pinned)
        );
        assert!(matches!(
            file.call(Request::Pin { fd, offset: 1, len: 0 }),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_raw_purge_reports_was_purged() {
        let (_service, file) = open();
        let fd = raw(&file, Request::CreateRegion { name: "raw".into(), size: 4096 });
        let fd = Fd::from_raw(i32::try_from(fd).unwrap());

        assert_eq!(raw(&file, Request::Unpin { fd, offset: 0, len: 0 }), 0);
        assert_eq!(raw(&file, Request::PurgeAllCaches), 1);
        assert_eq!(raw(&file, Request::Unpin { fd, offset: 0, len: 0 }), 1);
        assert_eq!(raw(&file, Request::Pin { fd, offset: 0, len: 0 }), 1);
        assert_eq!(raw(&file, Request::Pin { fd, offset: 0, len: 0 }), 0);
        assert_eq!(raw(&file, Request::GetPinStatus { fd, offset: 0, len: 0 }), 1);
    }

    #[test]
    fn test_raw_get_name_writes_payload() {
        let (_service, file) = open();
        let fd = raw(&file, Request::CreateRegion { name: "named".into(), size: 4096 });
        let fd = Fd::from_raw(i32::try_from(fd).unwrap());

        let mut payload = Request::GetName { fd }.encode().unwrap();
        assert_eq!(file.ioctl(Command::GetName.request(), &mut payload), 0);
        assert_eq!(&payload[4..10], b"named\0");
    }

    #[test]
    fn test_raw_errors_are_negative_errno() {
        let (_service, file) = open();
        assert_eq!(
            raw(&file, Request::ClaimHandoff { key: HandoffKey::DEFAULT }),
            i64::from(Error::NoResourcePublished.errno())
        );
        assert_eq!(
            raw(&file, Request::GetSize { fd: Fd::from_raw(9) }),
            i64::from(Error::BadHandle(Fd::from_raw(9)).errno())
        );
        assert_eq!(file.ioctl(Command::Pin.request(), &mut [0u8; 4]), -22);
    }

    #[test]
    fn test_open_after_shutdown() {
        let service = Service::start(ServiceConfig::testing());
        let device = ControlDevice::new(Arc::clone(&service));
        let process = service.spawn_process().unwrap();
        service.shutdown();
        assert!(matches!(device.open(process), Err(Error::ServiceStopped)));
    }
}
