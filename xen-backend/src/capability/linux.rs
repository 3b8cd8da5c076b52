// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Concrete Linux binding of the four C1 capabilities, talking to the
//! standard Xen driver device nodes (`/dev/xen/evtchn`, `/dev/xen/gntdev`)
//! and the XenStore daemon's client socket. `spec.md` §1 explicitly puts the
//! exact binding details out of scope for this framework; this module is one
//! reasonable binding, kept separate from the trait definitions in
//! [`super`] so a different one can be swapped in without touching the rest
//! of the crate.

use std::collections::VecDeque;
use std::ffi::CString;
use std::io::{Read, Write};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::Arc;

use base::{errno_result, AsRawDescriptor, FromRawDescriptor, SafeDescriptor};
use once_cell::sync::OnceCell;
use sync::Mutex;

use super::{
    DomainCtl, DomainFlags, EventChannelBackend, EventChannelHandle, GrantCtl, MappedRegion,
    Protection, StoreBackend,
};
use crate::error::Error;
use crate::ids::DomainId;
use crate::Result;

const EVTCHN_DEVICE: &str = "/dev/xen/evtchn";
const GNTDEV_DEVICE: &str = "/dev/xen/gntdev";
const XENSTORED_SOCKET: &str = "/var/run/xenstored/socket";

fn open_rw(path: &str) -> Result<SafeDescriptor> {
    let c_path = CString::new(path).map_err(|e| Error::Hypervisor(e.to_string()))?;
    // SAFETY: `c_path` is NUL-terminated and outlives the call; the return value
    // is checked below before taking ownership.
    let ret = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if ret < 0 {
        return base_to_hv(errno_result());
    }
    // SAFETY: `ret` is a freshly opened, uniquely owned descriptor.
    Ok(unsafe { SafeDescriptor::from_raw_descriptor(ret) })
}

fn base_to_hv<T>(r: base::Result<T>) -> Result<T> {
    r.map_err(|e| Error::Hypervisor(e.to_string()))
}

// ---- ioctl number construction, mirroring Linux's `_IOC` macro -----------

const fn ioc(dir: u32, ty: u32, nr: u32, size: u32) -> u64 {
    ((dir << 30) | (ty << 8) | nr | (size << 16)) as u64
}

const IOC_NONE: u32 = 0;

// --- /dev/xen/evtchn, per <xen/evtchn.h> ----------------------------------

#[repr(C)]
struct IoctlEvtchnBindInterdomain {
    remote_domain: u32,
    remote_port: u32,
}

#[repr(C)]
struct IoctlEvtchnNotify {
    port: u32,
}

#[repr(C)]
struct IoctlEvtchnUnbind {
    port: u32,
}

fn ioctl_evtchn_bind_interdomain() -> u64 {
    ioc(IOC_NONE, b'E' as u32, 1, size_of::<IoctlEvtchnBindInterdomain>() as u32)
}
fn ioctl_evtchn_unbind() -> u64 {
    ioc(IOC_NONE, b'E' as u32, 3, size_of::<IoctlEvtchnUnbind>() as u32)
}
fn ioctl_evtchn_notify() -> u64 {
    ioc(IOC_NONE, b'E' as u32, 4, size_of::<IoctlEvtchnNotify>() as u32)
}

/// The single `/dev/xen/evtchn` handle; one fd services every bound port in
/// the process, matching the real device's semantics (spec §9, "process-wide
/// singletons").
pub struct LinuxEventChannelBackend {
    fd: SafeDescriptor,
}

impl LinuxEventChannelBackend {
    pub fn open() -> Result<Arc<Self>> {
        Ok(Arc::new(LinuxEventChannelBackend { fd: open_rw(EVTCHN_DEVICE)? }))
    }
}

impl EventChannelBackend for LinuxEventChannelBackend {
    fn bind(&self, remote_domain: DomainId, remote_port: u32) -> Result<Box<dyn EventChannelHandle>> {
        let arg = IoctlEvtchnBindInterdomain {
            remote_domain: remote_domain.0 as u32,
            remote_port,
        };
        // SAFETY: `arg` is valid for the ioctl call and the fd is open.
        let local_port = unsafe {
            libc::ioctl(self.fd.as_raw_descriptor(), ioctl_evtchn_bind_interdomain(), &arg)
        };
        if local_port < 0 {
            return Err(Error::Hypervisor(format!(
                "bind_interdomain(dom={}, port={}) failed",
                remote_domain, remote_port
            )));
        }

        let shared_fd = base_to_hv(self.fd.try_clone())?;
        Ok(Box::new(LinuxEventChannelHandle {
            fd: shared_fd,
            local_port: local_port as u32,
        }))
    }
}

pub struct LinuxEventChannelHandle {
    fd: SafeDescriptor,
    local_port: u32,
}

impl EventChannelHandle for LinuxEventChannelHandle {
    fn fd(&self) -> RawFd {
        self.fd.as_raw_descriptor()
    }

    fn local_port(&self) -> u32 {
        self.local_port
    }

    fn pending(&self) -> Result<Option<u32>> {
        let mut port: u32 = 0;
        // SAFETY: `port` is valid for the duration of the read and sized for one u32.
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_descriptor(),
                &mut port as *mut u32 as *mut libc::c_void,
                size_of::<u32>(),
            )
        };
        if ret < 0 {
            let err = base::Error::last();
            if err.errno() == libc::EAGAIN {
                return Ok(None);
            }
            return Err(Error::EventChannel(err.to_string()));
        }
        Ok(Some(port))
    }

    fn unmask(&self, port: u32) -> Result<()> {
        // SAFETY: `port` is valid for the duration of the write and sized for one u32.
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_descriptor(),
                &port as *const u32 as *const libc::c_void,
                size_of::<u32>(),
            )
        };
        if ret < 0 {
            return Err(Error::EventChannel(base::Error::last().to_string()));
        }
        Ok(())
    }

    fn notify(&self) -> Result<()> {
        let arg = IoctlEvtchnNotify { port: self.local_port };
        // SAFETY: `arg` is valid for the ioctl call and the fd is open.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_descriptor(), ioctl_evtchn_notify(), &arg) };
        if ret < 0 {
            return Err(Error::EventChannel(format!("notify(port={}) failed", self.local_port)));
        }
        Ok(())
    }
}

impl Drop for LinuxEventChannelHandle {
    fn drop(&mut self) {
        let arg = IoctlEvtchnUnbind { port: self.local_port };
        // SAFETY: `arg` is valid for the ioctl call; failure here is logged, not fatal.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_descriptor(), ioctl_evtchn_unbind(), &arg) };
        if ret < 0 {
            log::warn!("failed to unbind event channel port {}", self.local_port);
        }
    }
}

// --- /dev/xen/gntdev, per <xen/gntdev.h> ----------------------------------

#[repr(C)]
struct GntdevGrantRef {
    domid: u32,
    ref_: u32,
}

#[repr(C)]
struct IoctlGntdevMapGrantRefHeader {
    count: u32,
    pad: u32,
    index: u64,
}

#[repr(C)]
struct IoctlGntdevUnmapGrantRef {
    index: u64,
    count: u32,
    pad: u32,
}

fn ioctl_gntdev_map_grant_ref(count: usize) -> u64 {
    let size = size_of::<IoctlGntdevMapGrantRefHeader>() + count * size_of::<GntdevGrantRef>();
    ioc(IOC_NONE, b'G' as u32, 0, size as u32)
}
fn ioctl_gntdev_unmap_grant_ref() -> u64 {
    ioc(IOC_NONE, b'G' as u32, 1, size_of::<IoctlGntdevUnmapGrantRef>() as u32)
}

static GNTDEV_FD: OnceCell<SafeDescriptor> = OnceCell::new();

fn gntdev_fd() -> Result<RawFd> {
    if let Some(fd) = GNTDEV_FD.get() {
        return Ok(fd.as_raw_descriptor());
    }
    let fd = open_rw(GNTDEV_DEVICE)?;
    let raw = fd.as_raw_descriptor();
    let _ = GNTDEV_FD.set(fd);
    Ok(raw)
}

/// Grant mapping capability, backed by the lazily-opened process-wide
/// `/dev/xen/gntdev` singleton (spec §4.4, §9).
pub struct LinuxGrantCtl;

impl LinuxGrantCtl {
    pub fn new() -> Arc<Self> {
        Arc::new(LinuxGrantCtl)
    }
}

impl GrantCtl for LinuxGrantCtl {
    fn map(&self, domain: DomainId, refs: &[u32], prot: Protection) -> Result<Box<dyn MappedRegion>> {
        let fd = gntdev_fd()?;
        let count = refs.len();

        let mut buf = vec![0u8; size_of::<IoctlGntdevMapGrantRefHeader>() + count * size_of::<GntdevGrantRef>()];
        // SAFETY: `buf` is sized exactly for the header followed by `count` grant refs.
        unsafe {
            let header = buf.as_mut_ptr() as *mut IoctlGntdevMapGrantRefHeader;
            (*header).count = count as u32;
            (*header).pad = 0;
            (*header).index = 0;
            let refs_ptr = buf
                .as_mut_ptr()
                .add(size_of::<IoctlGntdevMapGrantRefHeader>()) as *mut GntdevGrantRef;
            for (i, r) in refs.iter().enumerate() {
                ptr::write(
                    refs_ptr.add(i),
                    GntdevGrantRef { domid: domain.0 as u32, ref_: *r },
                );
            }
        }

        // SAFETY: `buf` holds a correctly sized ioctl argument for the fd above.
        let ret = unsafe { libc::ioctl(fd, ioctl_gntdev_map_grant_ref(count), buf.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::Grant(format!("map_grant_ref(dom={}, count={}) failed", domain, count)));
        }
        // SAFETY: the ioctl above filled in `index` on success.
        let index = unsafe { (*(buf.as_ptr() as *const IoctlGntdevMapGrantRefHeader)).index };

        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let len = count * page_size;

        // SAFETY: `fd` is the open gntdev handle and `index` is the offset the
        // kernel assigned to this mapping in the map call above.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd,
                index as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            let unmap_arg = IoctlGntdevUnmapGrantRef { index, count: count as u32, pad: 0 };
            // SAFETY: releases the mapping the kernel registered even though mmap failed.
            unsafe { libc::ioctl(fd, ioctl_gntdev_unmap_grant_ref(), &unmap_arg) };
            return Err(Error::Grant("mmap of granted pages failed".into()));
        }

        Ok(Box::new(LinuxMappedRegion {
            addr: addr as *mut u8,
            len,
            index,
            count: count as u32,
        }))
    }
}

pub struct LinuxMappedRegion {
    addr: *mut u8,
    len: usize,
    index: u64,
    count: u32,
}

// SAFETY: the mapping is exclusively owned by this struct and accessed only
// through it.
unsafe impl Send for LinuxMappedRegion {}

impl MappedRegion for LinuxMappedRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for LinuxMappedRegion {
    fn drop(&mut self) {
        // SAFETY: `self.addr`/`self.len` describe exactly the mapping created in `map`.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
        if let Ok(fd) = gntdev_fd() {
            let arg = IoctlGntdevUnmapGrantRef { index: self.index, count: self.count, pad: 0 };
            // SAFETY: releases exactly the grant-ref mapping registered at `map` time.
            unsafe {
                libc::ioctl(fd, ioctl_gntdev_unmap_grant_ref(), &arg);
            }
        }
    }
}

// --- XenStore client, per <xen/io/xs_wire.h> ------------------------------

#[repr(u32)]
#[derive(Clone, Copy)]
enum XsMsgType {
    Directory = 0,
    Read = 1,
    Watch = 3,
    Unwatch = 4,
    GetDomainPath = 9,
    Write = 10,
    Rm = 12,
    WatchEvent = 14,
    Error = 15,
}

const XS_HEADER_LEN: usize = 16;

struct XsHeader {
    msg_type: u32,
    req_id: u32,
    tx_id: u32,
    len: u32,
}

/// A client of the XenStore daemon, connected over its Unix-domain socket
/// (`/var/run/xenstored/socket`), implementing both the synchronous tree
/// primitives and watch delivery that C2's dispatcher polls (spec §4.1,
/// §4.2).
pub struct XsClient {
    stream: Mutex<UnixStream>,
    next_req_id: Mutex<u32>,
    /// Watch events read while waiting for an unrelated reply; drained by
    /// `check_watch` before issuing a fresh non-blocking read.
    pending_watches: Mutex<VecDeque<(String, String)>>,
}

impl XsClient {
    pub fn connect() -> Result<Arc<Self>> {
        let stream = UnixStream::connect(XENSTORED_SOCKET)
            .map_err(|e| Error::ConfigStore(format!("connect to xenstored failed: {e}")))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| Error::ConfigStore(e.to_string()))?;
        Ok(Arc::new(XsClient {
            stream: Mutex::new(stream),
            next_req_id: Mutex::new(1),
            pending_watches: Mutex::new(VecDeque::new()),
        }))
    }

    fn request(&self, msg_type: XsMsgType, payload: &[u8]) -> Result<Vec<u8>> {
        let req_id = {
            let mut next = self.next_req_id.lock();
            let id = *next;
            *next = next.wrapping_add(1);
            id
        };

        let mut stream = self.stream.lock();
        self.write_frame(&mut stream, msg_type as u32, req_id, payload)?;

        loop {
            let (header, body) = self.read_frame(&mut stream)?;
            if header.req_id != req_id {
                // A watch event interleaved with our reply; queue it and keep reading.
                if header.msg_type == XsMsgType::WatchEvent as u32 {
                    if let Some((path, token)) = parse_watch_event(&body) {
                        self.pending_watches.lock().push_back((path, token));
                    }
                    continue;
                }
            }
            if header.msg_type == XsMsgType::Error as u32 {
                let msg = String::from_utf8_lossy(&body).trim_end_matches('\0').to_string();
                return Err(Error::ConfigStore(msg));
            }
            return Ok(body);
        }
    }

    fn write_frame(&self, stream: &mut UnixStream, msg_type: u32, req_id: u32, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(XS_HEADER_LEN + payload.len());
        frame.extend_from_slice(&msg_type.to_le_bytes());
        frame.extend_from_slice(&req_id.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes()); // tx_id: no transactions
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        stream
            .write_all(&frame)
            .map_err(|e| Error::ConfigStore(e.to_string()))
    }

    fn read_frame(&self, stream: &mut UnixStream) -> Result<(XsHeader, Vec<u8>)> {
        let mut header_buf = [0u8; XS_HEADER_LEN];
        stream
            .read_exact(&mut header_buf)
            .map_err(|e| Error::ConfigStore(e.to_string()))?;
        let header = XsHeader {
            msg_type: u32::from_le_bytes(header_buf[0..4].try_into().unwrap()),
            req_id: u32::from_le_bytes(header_buf[4..8].try_into().unwrap()),
            tx_id: u32::from_le_bytes(header_buf[8..12].try_into().unwrap()),
            len: u32::from_le_bytes(header_buf[12..16].try_into().unwrap()),
        };
        let mut body = vec![0u8; header.len as usize];
        stream
            .read_exact(&mut body)
            .map_err(|e| Error::ConfigStore(e.to_string()))?;
        Ok((header, body))
    }

    fn nul_terminated(parts: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in parts {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf
    }
}

fn parse_watch_event(body: &[u8]) -> Option<(String, String)> {
    let mut parts = body.split(|&b| b == 0).filter(|s| !s.is_empty());
    let path = String::from_utf8_lossy(parts.next()?).to_string();
    let token = String::from_utf8_lossy(parts.next()?).to_string();
    Some((path, token))
}

impl StoreBackend for XsClient {
    fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let body = self.request(XsMsgType::Read, &Self::nul_terminated(&[path]))?;
        Ok(body)
    }

    fn read_int(&self, path: &str) -> Result<i64> {
        let s = self.read_string(path)?;
        s.trim_end_matches('\0')
            .trim()
            .parse()
            .map_err(|_| Error::ConfigStore(format!("{path} is not an integer")))
    }

    fn read_string(&self, path: &str) -> Result<String> {
        let bytes = self.read_bytes(path)?;
        Ok(String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string())
    }

    fn write_int(&self, path: &str, value: i64) -> Result<()> {
        let payload = Self::nul_terminated(&[path, &value.to_string()]);
        self.request(XsMsgType::Write, &payload)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.request(XsMsgType::Rm, &Self::nul_terminated(&[path]))?;
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>> {
        let body = self.request(XsMsgType::Directory, &Self::nul_terminated(&[path]))?;
        Ok(body
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect())
    }

    fn exists(&self, path: &str) -> bool {
        self.read_bytes(path).is_ok()
    }

    fn watch(&self, path: &str) -> Result<()> {
        self.request(XsMsgType::Watch, &Self::nul_terminated(&[path, path]))?;
        Ok(())
    }

    fn unwatch(&self, path: &str) -> Result<()> {
        self.request(XsMsgType::Unwatch, &Self::nul_terminated(&[path, path]))?;
        Ok(())
    }

    fn get_domain_path(&self, domain: DomainId) -> String {
        self.request(XsMsgType::GetDomainPath, &Self::nul_terminated(&[&domain.0.to_string()]))
            .map(|b| String::from_utf8_lossy(&b).trim_end_matches('\0').to_string())
            .unwrap_or_else(|_| format!("/local/domain/{}", domain.0))
    }

    fn fd(&self) -> RawFd {
        self.stream.lock().as_raw_fd()
    }

    fn check_watch(&self) -> Result<Option<(String, u32)>> {
        if let Some((path, _token)) = self.pending_watches.lock().pop_front() {
            return Ok(Some((path, 0)));
        }

        let mut stream = self.stream.lock();
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::ConfigStore(e.to_string()))?;
        let result = self.read_frame(&mut stream);
        stream
            .set_nonblocking(false)
            .map_err(|e| Error::ConfigStore(e.to_string()))?;

        match result {
            Ok((header, body)) if header.msg_type == XsMsgType::WatchEvent as u32 => {
                Ok(parse_watch_event(&body).map(|(path, _token)| (path, 0)))
            }
            Ok(_) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

/// Domain enumeration via XenStore's `/local/domain` tree.
///
/// The real hypercall (`xc_domain_getinfolist`) needs privileged access to
/// `/dev/xen/privcmd` and hypercall-buffer marshaling that `spec.md` §1
/// explicitly puts out of scope for this framework ("Hypervisor wrappers as
/// *implementations*... not their binding details"); XenStore already
/// maintains one node per running domain, so an unprivileged backend can
/// enumerate guests the same way `xenstore-ls` does. See `DESIGN.md`.
pub struct XsDomainCtl {
    store: Arc<dyn StoreBackend>,
}

impl XsDomainCtl {
    pub fn new(store: Arc<dyn StoreBackend>) -> Arc<Self> {
        Arc::new(XsDomainCtl { store })
    }
}

impl DomainCtl for XsDomainCtl {
    fn list_domains(&self) -> Result<Vec<(DomainId, DomainFlags)>> {
        let names = self
            .store
            .list("/local/domain")
            .map_err(|e| Error::Hypervisor(e.to_string()))?;

        let mut domains = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(id) = name.parse::<u16>() {
                domains.push((DomainId(id), DomainFlags { running: true }));
            }
        }
        Ok(domains)
    }
}
