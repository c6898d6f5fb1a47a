//! Network update invitation protocol
//!
//! The uploader sends a one-line UDP invitation to the update port:
//!
//! ```text
//! <command> <port> <size> <md5>\n
//! ```
//!
//! The board answers `OK`, opens a TCP connection back to the uploader on
//! `<port>` and receives `<size>` bytes of image. Every chunk is acknowledged
//! with its length in decimal; a final `OK` confirms the image was accepted.

use core::fmt::Write as _;

use heapless::String;
use md5::{Digest, Md5};

use crate::update::UpdateTarget;
use crate::BoardError;

/// Reply to an accepted invitation and to a completed transfer
pub const ACCEPTED: &[u8] = b"OK";

const COMMAND_APPLICATION: u16 = 0;
const COMMAND_FILESYSTEM: u16 = 100;
const MD5_HEX_LEN: usize = 32;
const HEX: &[u8; 16] = b"0123456789abcdef";

/// A parsed update invitation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub target: UpdateTarget,
    /// Uploader's TCP port for the image stream
    pub port: u16,
    /// Image size in bytes
    pub size: u32,
    /// Expected image digest, lowercase hex
    pub md5: String<MD5_HEX_LEN>,
}

impl Invitation {
    pub fn parse(datagram: &[u8]) -> Result<Self, BoardError> {
        let text = core::str::from_utf8(datagram).map_err(|_| BoardError::ProtocolError)?;
        let mut fields = text.split_ascii_whitespace();

        let mut next = || fields.next().ok_or(BoardError::ProtocolError);
        let command = next()?;
        let port = next()?;
        let size = next()?;
        let md5 = next()?;
        if fields.next().is_some() {
            return Err(BoardError::ProtocolError);
        }

        let target = match command.parse::<u16>() {
            Ok(COMMAND_APPLICATION) => UpdateTarget::Application,
            Ok(COMMAND_FILESYSTEM) => UpdateTarget::Filesystem,
            _ => return Err(BoardError::ProtocolError),
        };

        let port = port.parse::<u16>().map_err(|_| BoardError::ProtocolError)?;
        let size = size.parse::<u32>().map_err(|_| BoardError::ProtocolError)?;
        if port == 0 || size == 0 {
            return Err(BoardError::ProtocolError);
        }

        if md5.len() != MD5_HEX_LEN || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BoardError::ProtocolError);
        }
        let mut digest = String::new();
        for c in md5.chars() {
            digest
                .push(c.to_ascii_lowercase())
                .map_err(|_| BoardError::ProtocolError)?;
        }

        Ok(Self {
            target,
            port,
            size,
            md5: digest,
        })
    }
}

/// Acknowledgement for a received chunk: its byte count in decimal
pub fn chunk_ack(len: usize) -> String<20> {
    let mut ack = String::new();
    // usize::MAX has 20 digits, so this cannot fail
    let _ = write!(ack, "{}", len);
    ack
}

/// Byte accounting and digest for one image transfer
#[derive(Clone)]
pub struct Transfer {
    received: u32,
    size: u32,
    expected: String<MD5_HEX_LEN>,
    digest: Md5,
}

impl Transfer {
    pub fn new(invitation: &Invitation) -> Self {
        Self {
            received: 0,
            size: invitation.size,
            expected: invitation.md5.clone(),
            digest: Md5::new(),
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Account for a chunk. More data than announced is a protocol error and
    /// leaves the transfer untouched.
    pub fn record(&mut self, chunk: &[u8]) -> Result<u32, BoardError> {
        let len = u32::try_from(chunk.len()).map_err(|_| BoardError::ProtocolError)?;
        let received = self
            .received
            .checked_add(len)
            .filter(|&total| total <= self.size)
            .ok_or(BoardError::ProtocolError)?;
        self.digest.update(chunk);
        self.received = received;
        Ok(received)
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.size
    }

    /// Check a complete image against the digest from the invitation
    pub fn verify(&self) -> Result<(), BoardError> {
        if !self.is_complete() {
            return Err(BoardError::UpdateError);
        }

        let digest = self.digest.clone().finalize();
        let matches = digest
            .iter()
            .zip(self.expected.as_bytes().chunks_exact(2))
            .all(|(byte, hex)| hex == [HEX[usize::from(byte >> 4)], HEX[usize::from(byte & 0x0f)]]);
        if matches { Ok(()) } else { Err(BoardError::UpdateError) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn parses_application_invitation() {
        let line = format!("0 48266 372416 {}\n", DIGEST);
        let invitation = Invitation::parse(line.as_bytes()).unwrap();

        assert_eq!(invitation.target, UpdateTarget::Application);
        assert_eq!(invitation.port, 48266);
        assert_eq!(invitation.size, 372416);
        assert_eq!(invitation.md5.as_str(), DIGEST);
    }

    #[test]
    fn parses_filesystem_invitation_and_lowercases_digest() {
        let line = format!("100 3232 1024 {}", DIGEST.to_ascii_uppercase());
        let invitation = Invitation::parse(line.as_bytes()).unwrap();

        assert_eq!(invitation.target, UpdateTarget::Filesystem);
        assert_eq!(invitation.md5.as_str(), DIGEST);
    }

    #[test]
    fn rejects_malformed_invitations() {
        let bad = [
            "".to_owned(),
            "0 48266 372416".to_owned(),
            format!("7 48266 372416 {}", DIGEST),
            format!("0 70000 372416 {}", DIGEST),
            format!("0 0 372416 {}", DIGEST),
            format!("0 48266 0 {}", DIGEST),
            format!("0 48266 -5 {}", DIGEST),
            "0 48266 372416 not-a-digest".to_owned(),
            format!("0 48266 372416 {}0", DIGEST),
            format!("0 48266 372416 {} extra", DIGEST),
        ];

        for line in bad {
            assert_eq!(Invitation::parse(line.as_bytes()), Err(BoardError::ProtocolError), "{line:?}");
        }
        assert_eq!(Invitation::parse(&[0xff, 0x20, 0x30]), Err(BoardError::ProtocolError));
    }

    #[test]
    fn acks_are_decimal_lengths() {
        assert_eq!(chunk_ack(0).as_str(), "0");
        assert_eq!(chunk_ack(1460).as_str(), "1460");
        assert_eq!(chunk_ack(usize::MAX).len(), usize::MAX.to_string().len());
    }

    /// MD5 of "hello world"
    const HELLO_DIGEST: &str = "5eb63bbbe01eeed093cb22bb8f5acdc3";

    fn invitation(size: u32, md5: &str) -> Invitation {
        Invitation::parse(format!("0 48266 {} {}", size, md5).as_bytes()).unwrap()
    }

    #[test]
    fn transfer_tracks_bytes_and_rejects_overrun() {
        let mut transfer = Transfer::new(&invitation(3000, DIGEST));
        let chunk = [0u8; 1460];

        assert_eq!(transfer.record(&chunk), Ok(1460));
        assert_eq!(transfer.record(&chunk), Ok(2920));
        assert!(!transfer.is_complete());
        assert_eq!(transfer.record(&chunk[..81]), Err(BoardError::ProtocolError));
        assert_eq!(transfer.received(), 2920);
        assert_eq!(transfer.record(&chunk[..80]), Ok(3000));
        assert!(transfer.is_complete());
    }

    #[test]
    fn complete_image_matching_digest_verifies() {
        let mut transfer = Transfer::new(&invitation(11, &HELLO_DIGEST.to_ascii_uppercase()));

        transfer.record(b"hello ").unwrap();
        assert_eq!(transfer.verify(), Err(BoardError::UpdateError));
        transfer.record(b"world").unwrap();

        assert_eq!(transfer.verify(), Ok(()));
    }

    #[test]
    fn corrupted_image_fails_verification() {
        let mut transfer = Transfer::new(&invitation(11, HELLO_DIGEST));

        transfer.record(b"hello").unwrap();
        transfer.record(b"_world").unwrap();

        assert!(transfer.is_complete());
        assert_eq!(transfer.verify(), Err(BoardError::UpdateError));
    }

    #[test]
    fn rejected_chunk_does_not_touch_digest() {
        let mut transfer = Transfer::new(&invitation(11, HELLO_DIGEST));

        transfer.record(b"hello ").unwrap();
        assert!(transfer.record(b"world and more").is_err());
        transfer.record(b"world").unwrap();

        assert_eq!(transfer.verify(), Ok(()));
    }
}
