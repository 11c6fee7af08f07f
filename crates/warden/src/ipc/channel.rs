//! Unix datagram channel between the supervisor and one worker
//!
//! Provides [`Channel`], a connected `SOCK_DGRAM` socket pair end. Datagram
//! sockets keep message boundaries, so one [`Message`] is always one
//! `send`/`recv` call of exactly [`MESSAGE_SIZE`] bytes.

use crate::error::ProtocolError;
use crate::ipc::message::{Message, MESSAGE_SIZE};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

/// One end of a private worker channel.
///
/// Created by the spawner before fork. The supervisor keeps one end, the
/// worker inherits the other through fork.
pub struct Channel {
    socket: UnixDatagram,
}

impl Channel {
    /// Create a connected channel pair.
    ///
    /// Returns `(supervisor_end, worker_end)`. The supervisor end is switched
    /// to non-blocking mode so a spurious readiness event never stalls the
    /// event loop.
    #[must_use = "both channel ends must be used"]
    pub fn pair() -> io::Result<(Self, Self)> {
        let (s1, s2) = UnixDatagram::pair()?;
        s1.set_nonblocking(true)?;
        Ok((Channel { socket: s1 }, Channel { socket: s2 }))
    }

    /// Wrap an existing datagram socket.
    #[must_use]
    pub fn from_socket(socket: UnixDatagram) -> Self {
        Channel { socket }
    }

    /// Send one message in a single write.
    ///
    /// Anything other than a full `MESSAGE_SIZE` write is a protocol failure
    /// and is not retried.
    pub fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let wire = msg.encode();
        let written = self.socket.send(&wire.0).map_err(ProtocolError::Send)?;
        if written != MESSAGE_SIZE {
            return Err(ProtocolError::ShortWrite {
                written,
                expected: MESSAGE_SIZE,
            });
        }
        Ok(())
    }

    /// Receive one message.
    ///
    /// Returns `Ok(None)` when the channel is non-blocking and no datagram is
    /// queued. A datagram of any size other than `MESSAGE_SIZE` is rejected;
    /// the buffer is one byte larger than a message so oversized datagrams are
    /// detected rather than silently truncated to a valid length.
    pub fn receive(&self) -> Result<Option<Message>, ProtocolError> {
        let mut buf = vec![0u8; MESSAGE_SIZE + 1];
        let received = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(ProtocolError::Recv(e)),
        };

        if received != MESSAGE_SIZE {
            return Err(ProtocolError::BadLength {
                received,
                expected: MESSAGE_SIZE,
            });
        }

        let mut raw = [0u8; MESSAGE_SIZE];
        raw.copy_from_slice(&buf[..MESSAGE_SIZE]);
        Ok(Some(Message::decode(&raw)))
    }

    /// Get the raw file descriptor for this channel.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroI32;

    #[test]
    fn test_channel_pair_roundtrip() {
        let (supervisor, worker) = Channel::pair().expect("Failed to create channel pair");

        let mut msg = Message::new();
        msg.set_data(Some(b"+15550100"));
        worker.send(&msg).expect("Failed to send message");

        let received = supervisor
            .receive()
            .expect("Failed to receive message")
            .expect("No message queued");
        assert!(received.is_success());
        assert_eq!(received.data(), b"+15550100");
    }

    #[test]
    fn test_error_message_roundtrip() {
        let (supervisor, worker) = Channel::pair().expect("Failed to create channel pair");

        let mut msg = Message::new();
        msg.set_error(NonZeroI32::new(13).unwrap(), Some("db locked"));
        worker.send(&msg).expect("Failed to send message");

        let received = supervisor.receive().unwrap().unwrap();
        assert_eq!(received.status_code(), 13);
        assert_eq!(received.text(), "db locked");
    }

    #[test]
    fn test_receive_empty_nonblocking() {
        let (supervisor, _worker) = Channel::pair().expect("Failed to create channel pair");
        assert!(supervisor.receive().expect("receive failed").is_none());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let (s1, s2) = UnixDatagram::pair().expect("Failed to create socket pair");
        s1.set_nonblocking(true).unwrap();
        let supervisor = Channel::from_socket(s1);

        s2.send(&[0u8; 100]).unwrap();
        match supervisor.receive() {
            Err(ProtocolError::BadLength { received, .. }) => assert_eq!(received, 100),
            other => panic!("expected BadLength, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let (s1, s2) = UnixDatagram::pair().expect("Failed to create socket pair");
        s1.set_nonblocking(true).unwrap();
        let supervisor = Channel::from_socket(s1);

        s2.send(&vec![0u8; MESSAGE_SIZE + 64]).unwrap();
        assert!(matches!(
            supervisor.receive(),
            Err(ProtocolError::BadLength { .. })
        ));
    }

    #[test]
    fn test_hostile_length_clamped_on_receive() {
        let (s1, s2) = UnixDatagram::pair().expect("Failed to create socket pair");
        let supervisor = Channel::from_socket(s1);

        let mut raw = vec![0xAAu8; MESSAGE_SIZE];
        raw[0..4].copy_from_slice(&0i32.to_ne_bytes());
        raw[4..8].copy_from_slice(&(-42i32).to_ne_bytes());
        s2.send(&raw).unwrap();

        let msg = supervisor.receive().unwrap().unwrap();
        assert_eq!(msg.data().len(), crate::ipc::PAYLOAD_CAPACITY - 1);
        assert!(msg.data().iter().all(|b| *b == 0xAA));
    }
}
