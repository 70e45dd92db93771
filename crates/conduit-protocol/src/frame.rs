// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for admin link framing.
//!
//! Every message on a link connection is one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: payload (protobuf for control messages, raw bytes for data)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::{Command, CommandAck, Hello};

/// Largest payload accepted on a link (1 MB). Telemetry reports and
/// commands are far below this; anything larger is a broken peer.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types carried on an admin link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Session opening sent by the worker
    Hello = 1,
    /// Named command pushed by the repository
    Command = 2,
    /// Worker's answer to a command
    CommandAck = 3,
    /// Opaque data block (telemetry reports)
    Data = 4,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        Ok(match value {
            1 => MessageType::Hello,
            2 => MessageType::Command,
            3 => MessageType::CommandAck,
            4 => MessageType::Data,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// Errors raised while framing link traffic
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte link limit")]
    TooLarge(usize),

    #[error("unknown link message type {0}")]
    UnknownType(u16),

    #[error("expected a {expected:?} frame, received {actual:?}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed control message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("link closed by peer")]
    Closed,
}

/// Parsed fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    length: usize,
    message_type: MessageType,
}

impl Header {
    fn parse(mut raw: &[u8]) -> Result<Self, FrameError> {
        let length = raw.get_u32() as usize;
        let message_type = MessageType::try_from(raw.get_u16())?;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        Ok(Self {
            length,
            message_type,
        })
    }
}

/// One link message: its type and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn hello(hello: &Hello) -> Result<Self, FrameError> {
        Self::control(MessageType::Hello, hello)
    }

    pub fn command(command: &Command) -> Result<Self, FrameError> {
        Self::control(MessageType::Command, command)
    }

    pub fn command_ack(ack: &CommandAck) -> Result<Self, FrameError> {
        Self::control(MessageType::CommandAck, ack)
    }

    /// Wrap an opaque block (a telemetry report) without re-encoding it.
    pub fn data(payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        Self::checked(MessageType::Data, payload.into())
    }

    fn control<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        Self::checked(message_type, Bytes::from(msg.encode_to_vec()))
    }

    fn checked(message_type: MessageType, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Decode the payload as a control message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Decode the payload after checking the frame carries `expected`
    pub fn decode_as<M: Message + Default>(&self, expected: MessageType) -> Result<M, FrameError> {
        if self.message_type != expected {
            return Err(FrameError::WrongType {
                expected,
                actual: self.message_type,
            });
        }
        self.decode()
    }

    /// Header followed by payload, ready for the wire
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one complete frame from the front of `bytes`.
    pub fn parse(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let header = Header::parse(&bytes.split_to(HEADER_SIZE))?;
        if bytes.len() < header.length {
            return Err(FrameError::Truncated {
                needed: header.length,
                available: bytes.len(),
            });
        }
        Ok(Self {
            message_type: header.message_type,
            payload: bytes.split_to(header.length),
        })
    }
}

/// Frame reader/writer over one half (or both halves) of a link stream.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame. A clean EOF between frames is [`FrameError::Closed`].
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut raw = [0u8; HEADER_SIZE];
        if let Err(e) = self.stream.read_exact(&mut raw).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::Closed,
                _ => e.into(),
            });
        }
        let header = Header::parse(&raw)?;

        let mut payload = BytesMut::zeroed(header.length);
        self.stream.read_exact(&mut payload).await?;
        Ok(Frame {
            message_type: header.message_type,
            payload: payload.freeze(),
        })
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write and flush one frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        self.stream.write_all(&frame.encode()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
