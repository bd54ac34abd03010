//! Supervisor ↔ task control socket.
//!
//! A `socketpair` carries exactly three frame kinds during launch:
//!
//! | frame | wire format                                          |
//! |-------|------------------------------------------------------|
//! | pid   | 4 bytes little-endian                                |
//! | ack   | 1 zero byte                                          |
//! | error | varint length, then `code: i32 LE`, `errno: i32 LE`, UTF-8 text |
//!
//! Every pid is answered by exactly one ack before the next stage runs.
//! On the success path the task execs with the socket close-on-exec, so
//! the supervisor reads EOF where a final error frame would be; EOF is
//! therefore decoded as `Success`.

use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::unistd::Pid;

use crate::error::{Error, ErrorKind, Result};

const ACK_BYTE: u8 = 0;
/// Upper bound on an error frame; anything bigger is a protocol violation.
const MAX_ERROR_FRAME: u32 = 64 * 1024;

/// One end of the launch control socket.
#[derive(Debug)]
pub struct ControlSocket {
    stream: UnixStream,
}

impl ControlSocket {
    /// Create the supervisor/task pair.
    pub fn pair() -> Result<(ControlSocket, ControlSocket)> {
        let (a, b) = UnixStream::pair().map_err(Error::from)?;
        Ok((ControlSocket { stream: a }, ControlSocket { stream: b }))
    }

    pub fn from_stream(stream: UnixStream) -> ControlSocket {
        ControlSocket { stream }
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Bound every read during launch; `None` blocks forever.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Error::from)
    }

    /// Writes go through `send(2)` with `MSG_NOSIGNAL`: a peer that died
    /// mid-protocol surfaces as `EPIPE`, not `SIGPIPE`.
    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        let fd = self.stream.as_raw_fd();
        while !buf.is_empty() {
            let n = unsafe {
                libc::send(
                    fd,
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EINTR {
                    continue;
                }
                return Err(Error::from_kernel(errno as i32, "control socket send"));
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }

    pub fn send_pid(&mut self, pid: Pid) -> Result<()> {
        let buf = encode_pid(pid.as_raw());
        self.write_all(&buf)
    }

    pub fn recv_pid(&mut self) -> Result<Pid> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).map_err(Error::from)?;
        Ok(Pid::from_raw(decode_pid(&buf)))
    }

    pub fn send_ack(&mut self) -> Result<()> {
        self.write_all(&[ACK_BYTE])
    }

    pub fn recv_ack(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf).map_err(Error::from)?;
        if buf[0] != ACK_BYTE {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad ack byte {:#x}", buf[0]),
            ));
        }
        Ok(())
    }

    pub fn send_error(&mut self, err: &Error) -> Result<()> {
        let frame = encode_error(err);
        self.write_all(&frame)
    }

    /// Read the stage-2 report. EOF means the task exec'd successfully.
    pub fn recv_error(&mut self) -> Result<Error> {
        let mut len: u32 = 0;
        let mut shift = 0u32;
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read_exact(&mut byte) {
                Ok(()) => {}
                // EOF before any length byte: close-on-exec fired.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && shift == 0 => {
                    return Ok(Error::success());
                }
                Err(e) => return Err(Error::from(e)),
            }
            len |= ((byte[0] & 0x7f) as u32) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::new(ErrorKind::InvalidData, "oversized varint"));
            }
        }
        if len < 8 || len > MAX_ERROR_FRAME {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad error frame length {}", len),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).map_err(Error::from)?;
        decode_error_payload(&payload)
    }
}

/// LEB128, as used for the error frame length.
pub fn encode_varint(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn encode_pid(pid: i32) -> [u8; 4] {
    pid.to_le_bytes()
}

pub fn decode_pid(buf: &[u8; 4]) -> i32 {
    i32::from_le_bytes(*buf)
}

/// `[varint len][code i32 LE][errno i32 LE][text]`.
pub fn encode_error(err: &Error) -> Vec<u8> {
    let text = err.msg.as_bytes();
    let len = (8 + text.len()) as u32;
    let mut frame = encode_varint(len);
    frame.reserve(len as usize);
    frame.extend_from_slice(&err.kind.as_code().to_le_bytes());
    frame.extend_from_slice(&err.errno.to_le_bytes());
    frame.extend_from_slice(text);
    frame
}

pub fn decode_error_payload(payload: &[u8]) -> Result<Error> {
    if payload.len() < 8 {
        return Err(Error::new(ErrorKind::InvalidData, "short error payload"));
    }
    let code = i32::from_le_bytes(payload[0..4].try_into().unwrap());
    let errno = i32::from_le_bytes(payload[4..8].try_into().unwrap());
    let text = String::from_utf8_lossy(&payload[8..]).into_owned();
    Ok(Error {
        kind: ErrorKind::from_code(code),
        errno,
        msg: text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_frames_are_little_endian() {
        assert_eq!(encode_pid(1), [1, 0, 0, 0]);
        assert_eq!(encode_pid(0x01020304), [4, 3, 2, 1]);
        assert_eq!(decode_pid(&encode_pid(-1)), -1);
    }

    #[test]
    fn varint_lengths() {
        assert_eq!(encode_varint(0), vec![0]);
        assert_eq!(encode_varint(8), vec![8]);
        assert_eq!(encode_varint(127), vec![0x7f]);
        assert_eq!(encode_varint(128), vec![0x80, 0x01]);
        assert_eq!(encode_varint(300), vec![0xac, 0x02]);
    }

    #[test]
    fn error_frames_round_trip() {
        let err = Error::with_errno(ErrorKind::Unknown, libc::ESRCH, "setns(net) failed");
        let frame = encode_error(&err);
        // Short frames carry a single-byte varint length.
        let len = frame[0] as usize;
        assert!(len < 0x80);
        assert_eq!(len, frame.len() - 1);
        let decoded = decode_error_payload(&frame[1..]).unwrap();
        assert_eq!(decoded.kind, ErrorKind::Unknown);
        assert_eq!(decoded.errno, libc::ESRCH);
        assert_eq!(decoded.msg, "setns(net) failed");
    }

    #[test]
    fn success_round_trips_empty() {
        let frame = encode_error(&Error::success());
        assert_eq!(frame[0], 8);
        let decoded = decode_error_payload(&frame[1..]).unwrap();
        assert!(decoded.is_success());
        assert!(decoded.msg.is_empty());
    }

    #[test]
    fn long_error_frames_use_multibyte_varint() {
        let err = Error::new(ErrorKind::InvalidState, "x".repeat(200));
        let frame = encode_error(&err);
        assert_eq!(frame[0] & 0x80, 0x80);

        let (mut sup, mut task) = ControlSocket::pair().unwrap();
        task.send_error(&err).unwrap();
        drop(task);
        let got = sup.recv_error().unwrap();
        assert_eq!(got.kind, ErrorKind::InvalidState);
        assert_eq!(got.msg.len(), 200);
    }

    #[test]
    fn socket_pair_carries_protocol() {
        let (mut sup, mut task) = ControlSocket::pair().unwrap();

        task.send_pid(Pid::from_raw(4321)).unwrap();
        assert_eq!(sup.recv_pid().unwrap().as_raw(), 4321);
        sup.send_ack().unwrap();
        task.recv_ack().unwrap();

        let err = Error::with_errno(ErrorKind::Permission, libc::EACCES, "denied");
        task.send_error(&err).unwrap();
        let got = sup.recv_error().unwrap();
        assert_eq!(got.kind, ErrorKind::Permission);
        assert_eq!(got.errno, libc::EACCES);
    }

    #[test]
    fn eof_reads_as_success() {
        let (mut sup, task) = ControlSocket::pair().unwrap();
        drop(task);
        assert!(sup.recv_error().unwrap().is_success());
    }

    #[test]
    fn recv_timeout_applies() {
        let (sup, _task) = ControlSocket::pair().unwrap();
        sup.set_recv_timeout(Some(Duration::from_millis(50))).unwrap();
        let mut sup = sup;
        let err = sup.recv_pid().unwrap_err();
        // EAGAIN/EWOULDBLOCK from the timeout.
        assert_ne!(err.errno, 0);
    }
}
