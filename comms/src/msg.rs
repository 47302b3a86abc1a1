use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A flat gradient vector taking part in an all-reduce.
    Gradient(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Sent by a non-root rank right after connecting to the rendezvous.
    Join { rank: usize, world_size: usize },
    /// Sent by rank 0 once every rank has joined.
    Ready { world_size: usize },
    /// Enter (peer to root) or leave (root to peer) a barrier.
    Barrier,
    /// A rank failed, every peer must stop.
    Abort { rank: usize, reason: String },
}

/// The application layer message for the process group.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Short name of the message kind, for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join { .. }) => "control/join",
            Msg::Control(Command::Ready { .. }) => "control/ready",
            Msg::Control(Command::Barrier) => "control/barrier",
            Msg::Control(Command::Abort { .. }) => "control/abort",
            Msg::Data(Payload::Gradient(_)) => "data/gradient",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind_byte<T>(byte: u8) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind byte {byte}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&(0 as Header).to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(1 as Header).to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Gradient(grad)) => {
                buf.extend_from_slice(&(2 as Header).to_be_bytes());
                Ok(Some(bytemuck::cast_slice(grad)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(header) as u8;

        match kind {
            0 => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            1 => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            2 => {
                let rest: &'a [u8] = rest;
                let nums = bytemuck::try_cast_slice(rest).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad f32 payload: {e}"))
                })?;

                Ok(Self::Data(Payload::Gradient(nums)))
            }
            byte => Self::invalid_kind_byte(byte),
        }
    }
}
