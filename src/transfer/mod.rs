//! Device side of the serial file-transfer protocol.
//!
//! Frames open with the 10-byte magic `ESP32_XFER` and a command byte.
//! Chunk frames carry `offset:u32 · length:u32 · crc32:u32` and the
//! payload; a failed per-chunk CRC is answered with `NACK <offset>` and
//! the sender retries. The whole-file CRC32 is verified at end-session
//! against the value announced in the file-info frame; a mismatch
//! deletes the file on device.

use std::io::{Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::{
    checksum::Crc32,
    config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE},
    storage::{FileHandle, FileSystem, OpenMode, StorageError},
};

/// Frame magic.
pub const FRAME_MAGIC: &[u8; 10] = b"ESP32_XFER";

const HEADER_LEN: usize = FRAME_MAGIC.len() + 1;
const CHUNK_META_LEN: usize = 3 * 4;

/// Protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartSession = 0x01,
    FileInfo = 0x02,
    FileChunk = 0x03,
    EndSession = 0x04,
}

/// Wire responses the device sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ready,
    Ack(u32),
    Nack(u32),
    Ok,
    Error,
}

impl Response {
    /// ASCII form written to the serial link.
    pub fn to_wire(self) -> String {
        match self {
            Response::Ready => "READY".to_string(),
            Response::Ack(offset) => format!("ACK {offset}"),
            Response::Nack(offset) => format!("NACK {offset}"),
            Response::Ok => "OK".to_string(),
            Response::Error => "ERROR".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("frame too short ({0} bytes)")]
    ShortFrame(usize),
    #[error("bad frame magic")]
    BadMagic,
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("command out of order: {0}")]
    OutOfOrder(&'static str),
    #[error("chunk size {0} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}")]
    InvalidChunkSize(usize),
    #[error("chunk length field disagrees with payload")]
    LengthMismatch,
    #[error("file crc mismatch: expected {expected:#010x}, got {got:#010x}")]
    FileCrcMismatch { expected: u32, got: u32 },
    #[error("file size mismatch: expected {expected}, got {got}")]
    FileSizeMismatch { expected: u64, got: u64 },
    #[error("file name is not utf-8")]
    BadFileName,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed inbound frame.
#[derive(Debug)]
pub enum Frame<'a> {
    StartSession,
    FileInfo {
        name: &'a str,
        size: u32,
        crc32: u32,
        chunk_size: u16,
    },
    FileChunk {
        offset: u32,
        crc32: u32,
        payload: &'a [u8],
    },
    EndSession,
}

/// Parses one frame off the wire.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame<'_>, TransferError> {
    if bytes.len() < HEADER_LEN {
        return Err(TransferError::ShortFrame(bytes.len()));
    }
    if &bytes[..FRAME_MAGIC.len()] != FRAME_MAGIC {
        return Err(TransferError::BadMagic);
    }
    let command = bytes[FRAME_MAGIC.len()];
    let body = &bytes[HEADER_LEN..];
    match command {
        0x01 => Ok(Frame::StartSession),
        0x02 => {
            if body.len() < 1 {
                return Err(TransferError::ShortFrame(bytes.len()));
            }
            let name_len = body[0] as usize;
            if body.len() < 1 + name_len + 10 {
                return Err(TransferError::ShortFrame(bytes.len()));
            }
            let name = std::str::from_utf8(&body[1..1 + name_len])
                .map_err(|_| TransferError::BadFileName)?;
            let rest = &body[1 + name_len..];
            Ok(Frame::FileInfo {
                name,
                size: LittleEndian::read_u32(&rest[0..4]),
                crc32: LittleEndian::read_u32(&rest[4..8]),
                chunk_size: LittleEndian::read_u16(&rest[8..10]),
            })
        }
        0x03 => {
            if body.len() < CHUNK_META_LEN {
                return Err(TransferError::ShortFrame(bytes.len()));
            }
            let offset = LittleEndian::read_u32(&body[0..4]);
            let length = LittleEndian::read_u32(&body[4..8]) as usize;
            let crc32 = LittleEndian::read_u32(&body[8..12]);
            let payload = &body[CHUNK_META_LEN..];
            if payload.len() != length {
                return Err(TransferError::LengthMismatch);
            }
            Ok(Frame::FileChunk {
                offset,
                crc32,
                payload,
            })
        }
        0x04 => Ok(Frame::EndSession),
        other => Err(TransferError::UnknownCommand(other)),
    }
}

/// Sender-side frame builders, used by the PC tool and the tests.
pub mod frames {
    use super::*;

    fn header(command: Command) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(FRAME_MAGIC);
        out.push(command as u8);
        out
    }

    pub fn start_session() -> Vec<u8> {
        header(Command::StartSession)
    }

    pub fn file_info(name: &str, size: u32, crc32: u32, chunk_size: u16) -> Vec<u8> {
        let mut out = header(Command::FileInfo);
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        let mut meta = [0u8; 10];
        LittleEndian::write_u32(&mut meta[0..4], size);
        LittleEndian::write_u32(&mut meta[4..8], crc32);
        LittleEndian::write_u16(&mut meta[8..10], chunk_size);
        out.extend_from_slice(&meta);
        out
    }

    pub fn file_chunk(offset: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = header(Command::FileChunk);
        let mut meta = [0u8; CHUNK_META_LEN];
        LittleEndian::write_u32(&mut meta[0..4], offset);
        LittleEndian::write_u32(&mut meta[4..8], payload.len() as u32);
        LittleEndian::write_u32(&mut meta[8..12], Crc32::of(payload));
        out.extend_from_slice(&meta);
        out.extend_from_slice(payload);
        out
    }

    pub fn end_session() -> Vec<u8> {
        header(Command::EndSession)
    }
}

enum State {
    Idle,
    SessionOpen,
    Receiving {
        path: String,
        size: u64,
        expected_crc: u32,
        handle: FileHandle,
    },
}

/// The receiver state machine.
///
/// Feed raw frames through [`TransferReceiver::handle_frame`]; protocol
/// outcomes (ACK/NACK) come back as [`Response`] values, while local
/// failures and verification errors surface as [`TransferError`] for
/// the caller to translate into an `ERROR` line.
pub struct TransferReceiver {
    state: State,
}

impl TransferReceiver {
    pub fn new() -> Self {
        TransferReceiver { state: State::Idle }
    }

    /// Whether a session is currently open.
    pub fn in_session(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn handle_frame(
        &mut self,
        fs: &mut FileSystem,
        bytes: &[u8],
    ) -> Result<Response, TransferError> {
        let frame = parse_frame(bytes)?;
        match frame {
            Frame::StartSession => {
                self.state = State::SessionOpen;
                log::debug!("transfer session opened");
                Ok(Response::Ready)
            }
            Frame::FileInfo {
                name,
                size,
                crc32,
                chunk_size,
            } => {
                if matches!(self.state, State::Idle) {
                    return Err(TransferError::OutOfOrder("file-info before start-session"));
                }
                if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&(chunk_size as usize)) {
                    return Err(TransferError::InvalidChunkSize(chunk_size as usize));
                }
                let handle = fs.open(name, OpenMode::Write)?;
                log::info!("receiving {name} ({size} B, {chunk_size} B chunks)");
                self.state = State::Receiving {
                    path: name.to_string(),
                    size: size as u64,
                    expected_crc: crc32,
                    handle,
                };
                Ok(Response::Ready)
            }
            Frame::FileChunk {
                offset,
                crc32,
                payload,
            } => {
                let handle = match &mut self.state {
                    State::Receiving { handle, .. } => handle,
                    _ => return Err(TransferError::OutOfOrder("chunk before file-info")),
                };
                if Crc32::of(payload) != crc32 {
                    log::warn!("chunk at {offset} failed crc, asking for retry");
                    return Ok(Response::Nack(offset));
                }
                handle.seek(SeekFrom::Start(offset as u64))?;
                handle.write_all(payload)?;
                Ok(Response::Ack(offset))
            }
            Frame::EndSession => {
                let (path, size, expected_crc) = match &mut self.state {
                    State::Receiving {
                        path,
                        size,
                        expected_crc,
                        handle,
                    } => {
                        handle.flush()?;
                        (path.clone(), *size, *expected_crc)
                    }
                    State::SessionOpen => {
                        self.state = State::Idle;
                        return Ok(Response::Ok);
                    }
                    State::Idle => {
                        return Err(TransferError::OutOfOrder("end-session before start"))
                    }
                };
                // Drop the handle before reading the file back.
                self.state = State::Idle;
                let written = fs.read_all(&path)?;
                if written.len() as u64 != size {
                    fs.remove(&path)?;
                    return Err(TransferError::FileSizeMismatch {
                        expected: size,
                        got: written.len() as u64,
                    });
                }
                let got = Crc32::of(&written);
                if got != expected_crc {
                    log::error!("file crc mismatch on {path}, deleting");
                    fs.remove(&path)?;
                    return Err(TransferError::FileCrcMismatch {
                        expected: expected_crc,
                        got,
                    });
                }
                log::info!("{path} received and verified ({size} B)");
                Ok(Response::Ok)
            }
        }
    }
}

impl Default for TransferReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageConfig, StorageKind};

    fn flash() -> FileSystem {
        FileSystem::mount(
            StorageKind::FlashLog,
            &StorageConfig {
                flash_capacity: 256 * 1024,
                ..StorageConfig::default()
            },
        )
    }

    fn payload(bytes: usize) -> Vec<u8> {
        (0..bytes).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn happy_path_transfer() {
        let mut fs = flash();
        let mut receiver = TransferReceiver::new();
        let data = payload(1000);
        let crc = Crc32::of(&data);

        assert_eq!(
            receiver
                .handle_frame(&mut fs, &frames::start_session())
                .unwrap(),
            Response::Ready
        );
        assert_eq!(
            receiver
                .handle_frame(
                    &mut fs,
                    &frames::file_info("/data/in.bin", data.len() as u32, crc, 220)
                )
                .unwrap(),
            Response::Ready
        );
        for (index, chunk) in data.chunks(220).enumerate() {
            let offset = (index * 220) as u32;
            assert_eq!(
                receiver
                    .handle_frame(&mut fs, &frames::file_chunk(offset, chunk))
                    .unwrap(),
                Response::Ack(offset)
            );
        }
        assert_eq!(
            receiver
                .handle_frame(&mut fs, &frames::end_session())
                .unwrap(),
            Response::Ok
        );
        assert_eq!(fs.read_all("/data/in.bin").unwrap(), data);
    }

    #[test]
    fn corrupted_chunk_is_nacked_and_retried() {
        let mut fs = flash();
        let mut receiver = TransferReceiver::new();
        let data = payload(440);
        let crc = Crc32::of(&data);
        receiver
            .handle_frame(&mut fs, &frames::start_session())
            .unwrap();
        receiver
            .handle_frame(&mut fs, &frames::file_info("/f.bin", 440, crc, 220))
            .unwrap();

        // First chunk arrives with a flipped bit in the payload.
        let mut bad = frames::file_chunk(0, &data[..220]);
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert_eq!(
            receiver.handle_frame(&mut fs, &bad).unwrap(),
            Response::Nack(0)
        );

        // Retry clean, then the rest.
        assert_eq!(
            receiver
                .handle_frame(&mut fs, &frames::file_chunk(0, &data[..220]))
                .unwrap(),
            Response::Ack(0)
        );
        receiver
            .handle_frame(&mut fs, &frames::file_chunk(220, &data[220..]))
            .unwrap();
        assert_eq!(
            receiver
                .handle_frame(&mut fs, &frames::end_session())
                .unwrap(),
            Response::Ok
        );
        assert_eq!(fs.read_all("/f.bin").unwrap(), data);
    }

    #[test]
    fn wrong_file_crc_deletes_the_file() {
        let mut fs = flash();
        let mut receiver = TransferReceiver::new();
        let data = payload(300);
        receiver
            .handle_frame(&mut fs, &frames::start_session())
            .unwrap();
        receiver
            .handle_frame(&mut fs, &frames::file_info("/f.bin", 300, 0xDEAD_BEEF, 300))
            .unwrap();
        receiver
            .handle_frame(&mut fs, &frames::file_chunk(0, &data))
            .unwrap();
        assert!(matches!(
            receiver.handle_frame(&mut fs, &frames::end_session()),
            Err(TransferError::FileCrcMismatch { .. })
        ));
        assert!(!fs.exists("/f.bin"));
    }

    #[test]
    fn out_of_order_frames_are_rejected() {
        let mut fs = flash();
        let mut receiver = TransferReceiver::new();
        assert!(matches!(
            receiver.handle_frame(&mut fs, &frames::file_chunk(0, b"xx")),
            Err(TransferError::OutOfOrder(_))
        ));
        assert!(matches!(
            receiver.handle_frame(&mut fs, b"NOT_A_MAGIC frame"),
            Err(TransferError::BadMagic)
        ));
    }

    #[test]
    fn chunk_size_bounds_are_enforced() {
        let mut fs = flash();
        let mut receiver = TransferReceiver::new();
        receiver
            .handle_frame(&mut fs, &frames::start_session())
            .unwrap();
        assert!(matches!(
            receiver.handle_frame(&mut fs, &frames::file_info("/f", 10, 0, 100)),
            Err(TransferError::InvalidChunkSize(100))
        ));
    }
}
