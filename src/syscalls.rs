// src/syscalls.rs
//
// Thin wrappers over the raw Linux syscall surface the reactor runs on:
// listener setup, non-blocking accept, scatter/gather socket I/O, epoll,
// the self-pipe wakeup channel and read-only file mappings.
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::ptr;

pub use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to INADDR_ANY:port.
///
/// `linger` turns on SO_LINGER with a one second drain window, so close
/// blocks briefly trying to flush unsent data instead of discarding it.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<c_int> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let opt_linger = libc::linger {
            l_onoff: if linger { 1 } else { 0 },
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt_linger as *const _ as *const c_void,
            mem::size_of_val(&opt_linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection, non-blocking and with the peer address.
/// Returns `Ok(None)` when the accept queue is drained.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<(c_int, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let peer = SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port)));
            Ok(Some((fd, peer)))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// One-shot send used for canned overload replies on sockets that never
/// make it into the connection table.
pub fn send_flat(fd: c_int, data: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::send(fd, data.as_ptr() as *const c_void, data.len(), libc::MSG_NOSIGNAL);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Scatter read: one readv over two segments. The caller sizes the first
/// segment to its writable region and the second to scratch space.
pub fn read_vectored(fd: c_int, first: &mut [u8], second: &mut [u8]) -> io::Result<usize> {
    let iovecs = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut c_void,
            iov_len: second.len(),
        },
    ];

    unsafe {
        let res = libc::readv(fd, iovecs.as_ptr(), 2);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub fn write_fd(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Gather write over up to 8 segments in a single syscall.
pub fn write_vectored(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    if bufs.is_empty() {
        return Ok(0);
    }

    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    /// Watch a file descriptor. Interest bits (including EPOLLET and
    /// EPOLLONESHOT) are chosen entirely by the caller.
    pub fn add(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Re-arm or change interest on an already-watched descriptor. This is
    /// how one-shot watches are revived after they fire.
    pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Wait for events; `timeout_ms < 0` blocks indefinitely. EINTR reports
    /// zero events so the caller can re-check its shutdown flag.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Self-Pipe Wakeup ----

/// Create the worker-to-reactor wakeup pipe. Both ends are non-blocking:
/// the reactor drains the read end, workers nudge the write end.
/// Returns (read_fd, write_fd).
pub fn create_wake_pipe() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Nudge the reactor out of its epoll wait. A full pipe means wakeups are
/// already pending, so EAGAIN is not an error here.
pub fn wake(pipe_write_fd: c_int) {
    let byte = [1u8];
    unsafe {
        libc::write(pipe_write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Drain every pending wakeup byte from the pipe's read end.
pub fn drain_wake(pipe_read_fd: c_int) {
    let mut buf = [0u8; 64];
    unsafe {
        loop {
            let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, buf.len());
            if n <= 0 {
                break;
            }
        }
    }
}

// ---- File Mappings ----

/// A read-only, privately mapped file region. Unmapped on drop.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

impl MappedFile {
    /// Open `path` and map `len` bytes read-only. The descriptor is closed
    /// immediately after mapping; the mapping keeps the pages alive.
    /// `len` must be non-zero (mmap rejects empty mappings).
    pub fn open(path: &Path, len: usize) -> io::Result<MappedFile> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;

        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let ptr = libc::mmap(ptr::null_mut(), len, libc::PROT_READ, libc::MAP_PRIVATE, fd, 0);
            libc::close(fd);

            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            Ok(MappedFile { ptr, len })
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// The mapping is immutable and page-backed; moving it between threads is
// sound even though it holds a raw pointer.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}
