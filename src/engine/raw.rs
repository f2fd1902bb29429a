//! Raw-link `Engine`: an `AF_PACKET` socket with a BPF classifier,
//! bound non-blocking with `SIGIO` delivery.
//!
//! Grounded on `original_source/include/engine.hh`'s raw-socket
//! construction sequence (ifindex lookup, hardware address lookup, BPF
//! attach, non-blocking+async configuration) and on the teacher's comfort
//! with raw `libc` FFI for low-level resource management
//! (`circular_buffer.rs`'s `mmap`/`munmap` pair is the closest precedent
//! in this codebase for unsafe syscall wrapping).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use crate::address::PhysicalAddress;
use crate::buffer::{Buffer, BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::header::ETHERTYPE;

use super::Engine;

// Only one `RawEngine` may be active per process at a time: the SIGIO
// handler is async-signal-safe only because it touches a single known
// semaphore, matching the one-engine-per-vehicle-process model in
// spec.md §5.
static ACTIVE_SEM: AtomicPtr<libc::sem_t> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn on_sigio(_signum: libc::c_int) {
    let sem = ACTIVE_SEM.load(Ordering::Relaxed);
    if !sem.is_null() {
        // SAFETY: `sem` was sem_init'd by the active RawEngine and is
        // never freed while ACTIVE_SEM still points at it (stop() clears
        // ACTIVE_SEM before deallocating). sem_post is async-signal-safe.
        unsafe {
            libc::sem_post(sem);
        }
    }
}

fn ifreq_with_name(name: &str) -> Result<libc::ifreq> {
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    if name.len() >= req.ifr_name.len() {
        return Err(Error::InterfaceLookup {
            iface: name.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interface name too long",
            ),
        });
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    Ok(req)
}

fn ioctl_index(fd: RawFd, name: &str) -> Result<i32> {
    let mut req = ifreq_with_name(name)?;
    // SAFETY: `req` is a valid, zero-initialized `ifreq` with a
    // null-terminated interface name; `fd` is a valid open socket.
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut req) };
    if rc < 0 {
        return Err(Error::InterfaceLookup {
            iface: name.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: SIOCGIFINDEX fills ifr_ifru.ifru_ivalue on success.
    Ok(unsafe { req.ifr_ifru.ifru_ivalue })
}

fn ioctl_hwaddr(fd: RawFd, name: &str) -> Result<PhysicalAddress> {
    let mut req = ifreq_with_name(name)?;
    // SAFETY: see ioctl_index.
    let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut req) };
    if rc < 0 {
        return Err(Error::InterfaceLookup {
            iface: name.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    let mut mac = [0u8; 6];
    // SAFETY: SIOCGIFHWADDR fills ifr_ifru.ifru_hwaddr.sa_data; the first
    // 6 bytes are the hardware address for Ethernet-family interfaces.
    let sa_data = unsafe { req.ifr_ifru.ifru_hwaddr.sa_data };
    for (d, s) in mac.iter_mut().zip(sa_data.iter()) {
        *d = *s as u8;
    }
    Ok(PhysicalAddress::new(mac))
}

/// BPF classic-BPF program accepting only frames whose Ethertype (offset
/// 12, after dst+src) equals `ETHERTYPE`.
fn ethertype_filter() -> [libc::sock_filter; 3] {
    const BPF_LD: u16 = 0x00;
    const BPF_H: u16 = 0x08;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;
    [
        libc::sock_filter {
            code: BPF_LD | BPF_H | BPF_ABS,
            jt: 0,
            jf: 0,
            k: 12,
        },
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: ETHERTYPE as u32,
        },
        libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: 0xFFFF_FFFF,
        },
    ]
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Shared {
    fd: RawFd,
    sem: *mut libc::sem_t,
    running: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

// SAFETY: `sem` points at heap-allocated, process-local memory that is
// only ever touched through `libc::sem_*` calls, all of which are safe to
// call from multiple threads.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Raw-link transport: one `AF_PACKET` socket per interface, a BPF
/// classifier, and a dedicated reader thread gated on a semaphore that
/// the process's `SIGIO` handler posts to.
pub struct RawEngine {
    shared: Arc<Shared>,
    mac: PhysicalAddress,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RawEngine {
    /// Bind a raw `AF_PACKET` socket to `interface_name`, attach the
    /// fixed-ethertype BPF filter, and configure it for `SIGIO`-driven
    /// non-blocking reads. Fails fatally on any setup step (spec.md §4.2).
    pub fn new(interface_name: &str) -> Result<Self> {
        // SAFETY: a plain socket() syscall with fixed, valid arguments.
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETHERTYPE as u16).to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(Error::SocketCreate(std::io::Error::last_os_error()));
        }

        let ifindex = match ioctl_index(fd, interface_name) {
            Ok(v) => v,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let mac = match ioctl_hwaddr(fd, interface_name) {
            Ok(v) => v,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (ETHERTYPE as u16).to_be();
        sll.sll_ifindex = ifindex;
        // SAFETY: `sll` is a validly initialized sockaddr_ll; `fd` is open.
        let rc = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(sll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::SocketBind(e));
        }

        let filter = ethertype_filter();
        let prog = libc::sock_fprog {
            len: filter.len() as u16,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };
        // SAFETY: `prog` references `filter`, which outlives this call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                std::ptr::addr_of!(prog).cast(),
                std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::BpfAttach(e));
        }

        // SAFETY: fd is open; F_GETFL/F_SETFL/F_SETOWN are ordinary fcntl
        // operations on a valid descriptor.
        let setup_failed = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            flags < 0
                || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK | libc::O_ASYNC) < 0
                || libc::fcntl(fd, libc::F_SETOWN, libc::getpid()) < 0
        };
        if setup_failed {
            let e = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::SocketConfig(e));
        }

        let sem = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        // SAFETY: `sem` was just allocated and is not yet shared.
        let rc = unsafe { libc::sem_init(sem, 0, 0) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            unsafe {
                drop(Box::from_raw(sem));
                libc::close(fd);
            }
            return Err(Error::SharedMemInit(format!("sem_init failed: {e}")));
        }
        ACTIVE_SEM.store(sem, Ordering::Relaxed);

        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = on_sigio as usize;
        action.sa_flags = libc::SA_RESTART;
        // SAFETY: `action` is fully initialized; SIGIO is a valid signal
        // number.
        let rc = unsafe { libc::sigaction(libc::SIGIO, &action, std::ptr::null_mut()) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            ACTIVE_SEM.store(std::ptr::null_mut(), Ordering::Relaxed);
            unsafe {
                libc::sem_destroy(sem);
                drop(Box::from_raw(sem));
                libc::close(fd);
            }
            return Err(Error::SignalHandler(e));
        }

        debug!("raw engine bound to {interface_name} (ifindex {ifindex}, mac {mac})");

        Ok(Self {
            shared: Arc::new(Shared {
                fd,
                sem,
                running: AtomicBool::new(true),
                callback: Mutex::new(None),
            }),
            mac,
            reader: Mutex::new(None),
        })
    }

    fn ensure_reader(&self) {
        let mut reader = self
            .reader
            .lock()
            .expect("raw engine reader mutex poisoned");
        if reader.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *reader = Some(std::thread::spawn(move || loop {
            // SAFETY: `shared.sem` is valid for the lifetime of `shared`.
            let rc = unsafe { libc::sem_wait(shared.sem) };
            if rc != 0 {
                continue;
            }
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            if let Some(cb) = shared.callback.lock().expect("raw engine callback mutex poisoned").as_ref() {
                cb();
            }
        }));
    }
}

impl Engine for RawEngine {
    fn mac_address(&self) -> PhysicalAddress {
        self.mac
    }

    fn send(&self, dest: PhysicalAddress, buf: &Buffer) -> i64 {
        let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (ETHERTYPE as u16).to_be();
        sll.sll_halen = 6;
        sll.sll_addr[..6].copy_from_slice(&dest.octets());

        let data = buf.as_slice();
        // SAFETY: `sll` is a valid sockaddr_ll; `data` is a valid slice
        // for the duration of the call.
        let n = unsafe {
            libc::sendto(
                self.shared.fd,
                data.as_ptr().cast(),
                data.len(),
                0,
                std::ptr::addr_of!(sll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if n < 0 {
            warn!(
                "raw engine send failed: {}",
                std::io::Error::last_os_error()
            );
            return -1;
        }
        if (n as usize) != data.len() {
            warn!("raw engine partial send: {n} of {} bytes", data.len());
            return -1;
        }
        n as i64
    }

    fn receive(&self, buf: &mut Buffer) -> i64 {
        let cap = BUFFER_SIZE;
        // SAFETY: `buf.data_mut()` is a valid, writable buffer of `cap`
        // bytes for the duration of the call.
        let n = unsafe {
            libc::recv(
                self.shared.fd,
                buf.data_mut().as_mut_ptr().cast(),
                cap,
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return 0;
            }
            error!("raw engine receive failed: {err}");
            return -1;
        }
        buf.set_size(n as usize);
        n as i64
    }

    fn bind(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self
            .shared
            .callback
            .lock()
            .expect("raw engine callback mutex poisoned") = Some(callback);
        self.ensure_reader();
    }

    fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            ACTIVE_SEM.store(std::ptr::null_mut(), Ordering::Relaxed);
            // SAFETY: sem is valid; one extra post wakes a blocked reader
            // so it observes `running == false`.
            unsafe {
                libc::sem_post(self.shared.sem);
            }
            if let Some(handle) = self
                .reader
                .lock()
                .expect("raw engine reader mutex poisoned")
                .take()
            {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RawEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // SAFETY: `fd` and `sem` are owned exclusively by this `Shared`
        // and are not used after this point.
        unsafe {
            libc::close(self.fd);
            libc::sem_destroy(self.sem);
            drop(Box::from_raw(self.sem));
        }
    }
}
