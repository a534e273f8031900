//! Transport: a framed byte stream over TCP or a tunnel child process,
//! optionally wrapped in TLS (spec §4.1).

mod tls;
mod x509;

pub use tls::CertPolicy;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::process::{Child, Command, Stdio};

use rustls_connector::rustls::{ClientSession, StreamOwned};
use rustls_connector::RustlsConnector;

use crate::error::{Result, SyncError};

/// Shared contract for the byte-stream backing the line buffer. Blocking
/// `read`/`write`, plus a best-effort `pending()` probe used to drain
/// pipelined responses without a dedicated reader thread (spec §4.1, §5).
pub trait Transport: Read + Write {
    /// Best-effort count of bytes immediately available without
    /// blocking.
    fn pending(&mut self) -> Result<usize>;
}

/// A plaintext or TLS-wrapped TCP connection.
pub enum TcpTransport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientSession, TcpStream>>),
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| SyncError::store_bad(format!("unreachable: {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true).ok();
        Ok(TcpTransport::Plain(stream))
    }

    pub fn connect_tls(host: &str, port: u16, policy: &CertPolicy) -> Result<Self> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| SyncError::store_bad(format!("unreachable: {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true).ok();
        let connector = tls::build_connector(policy)?;
        let tls_stream = connector
            .connect(host, stream)
            .map_err(|e| SyncError::store_bad(format!("TLS handshake failed: {}", e)))?;
        tls::verify_peer(&tls_stream, policy)?;
        Ok(TcpTransport::Tls(Box::new(tls_stream)))
    }

    /// Promote a plaintext connection to TLS in-place (`STARTTLS`, spec
    /// §4.1 `start_tls`). Must only be called before any authentication
    /// command has been issued.
    pub fn start_tls(self, host: &str, policy: &CertPolicy) -> Result<Self> {
        match self {
            TcpTransport::Plain(stream) => {
                let connector = tls::build_connector(policy)?;
                let tls_stream = connector
                    .connect(host, stream)
                    .map_err(|e| SyncError::store_bad(format!("TLS handshake failed: {}", e)))?;
                tls::verify_peer(&tls_stream, policy)?;
                Ok(TcpTransport::Tls(Box::new(tls_stream)))
            }
            TcpTransport::Tls(_) => Err(SyncError::fatal("start_tls called on an already-TLS transport")),
        }
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            TcpTransport::Plain(s) => s.read(buf),
            TcpTransport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TcpTransport::Plain(s) => s.write(buf),
            TcpTransport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TcpTransport::Plain(s) => s.flush(),
            TcpTransport::Tls(s) => s.flush(),
        }
    }
}

impl Transport for TcpTransport {
    fn pending(&mut self) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = match self {
                TcpTransport::Plain(s) => s.as_raw_fd(),
                TcpTransport::Tls(s) => s.get_ref().as_raw_fd(),
            };
            let mut n: libc::c_int = 0;
            let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
            if rc < 0 {
                return Err(SyncError::store_bad(format!(
                    "FIONREAD failed: {}",
                    io::Error::last_os_error()
                )));
            }
            Ok(n.max(0) as usize)
        }
        #[cfg(not(unix))]
        {
            Ok(0)
        }
    }
}

/// A child-process tunnel (`/bin/sh -c <cmd>`) with its stdio wired to us
/// (spec §4.1 `spawn_tunnel`).
pub struct TunnelTransport {
    child: Child,
}

impl TunnelTransport {
    pub fn spawn(cmd: &str) -> Result<Self> {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SyncError::store_bad(format!("failed to spawn tunnel {:?}: {}", cmd, e)))?;
        Ok(TunnelTransport { child })
    }
}

impl Read for TunnelTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.child
            .stdout
            .as_mut()
            .expect("tunnel stdout piped")
            .read(buf)
    }
}

impl Write for TunnelTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.child
            .stdin
            .as_mut()
            .expect("tunnel stdin piped")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.child.stdin.as_mut().expect("tunnel stdin piped").flush()
    }
}

impl Transport for TunnelTransport {
    fn pending(&mut self) -> Result<usize> {
        Ok(0)
    }
}

impl Drop for TunnelTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Either backing transport, boxed so the IMAP driver doesn't need to be
/// generic over it.
pub enum AnyTransport {
    Tcp(TcpTransport),
    Tunnel(TunnelTransport),
}

impl Read for AnyTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AnyTransport::Tcp(t) => t.read(buf),
            AnyTransport::Tunnel(t) => t.read(buf),
        }
    }
}

impl Write for AnyTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            AnyTransport::Tcp(t) => t.write(buf),
            AnyTransport::Tunnel(t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            AnyTransport::Tcp(t) => t.flush(),
            AnyTransport::Tunnel(t) => t.flush(),
        }
    }
}

impl Transport for AnyTransport {
    fn pending(&mut self) -> Result<usize> {
        match self {
            AnyTransport::Tcp(t) => t.pending(),
            AnyTransport::Tunnel(t) => t.pending(),
        }
    }
}

impl AnyTransport {
    /// Promote a plain TCP transport to TLS. No-op failure for tunnels,
    /// which never carry TLS themselves.
    pub fn start_tls(self, host: &str, policy: &CertPolicy) -> Result<Self> {
        match self {
            AnyTransport::Tcp(t) => Ok(AnyTransport::Tcp(t.start_tls(host, policy)?)),
            AnyTransport::Tunnel(_) => Err(SyncError::fatal("start_tls called on a tunnel transport")),
        }
    }
}
