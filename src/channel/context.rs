use core::cell::RefCell;
use core::str::from_utf8;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::{
    blocking_mutex,
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::Channel,
    mutex::Mutex,
    pipe::Pipe,
};
use heapless::{String, Vec};

use super::link::LinkSignal;
use crate::parser::{AtParser, AT_BUF_SIZE};
use crate::urc::UrcChannel;
use crate::Error;

/// Longest outbound command line, including the trailing carriage return.
pub const COMMAND_MAX_LEN: usize = 80;

pub(crate) const COMMAND_QUEUE_LEN: usize = 4;
pub(crate) const RAW_CHUNK_LEN: usize = 256;
pub(crate) const PIPE_LEN: usize = 2048;

pub(crate) type ParserLock<const N: usize> =
    blocking_mutex::Mutex<CriticalSectionRawMutex, RefCell<AtParser<N>>>;

/// One queued write to the device.
pub enum RawCommand {
    Text(String<COMMAND_MAX_LEN>),
    Binary(Vec<u8, RAW_CHUNK_LEN>),
}

impl RawCommand {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawCommand::Text(s) => s.as_bytes(),
            RawCommand::Binary(b) => b,
        }
    }
}

/// A collected command response: the intermediate lines joined by `\n`,
/// without the final "OK" (an empty body is normal), or the final error
/// line as its last line.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response<const N: usize = AT_BUF_SIZE> {
    bytes: Vec<u8, N>,
}

impl<const N: usize> Response<N> {
    pub(crate) fn from_body(body: &[u8]) -> Self {
        let take = usize::min(body.len(), N);
        Response {
            bytes: Vec::from_slice(&body[..take]).unwrap_or_else(|_| Vec::new()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        from_utf8(&self.bytes).map_err(|_| Error::InvalidUtf8)
    }

    /// The individual lines of the body.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Shared state between the channel handle and its pumps.
///
/// Designed to live in a `static`, like the contexts of the pump tasks it
/// feeds.
pub struct ChannelContext<const N: usize = AT_BUF_SIZE> {
    pub(crate) parser: ParserLock<N>,
    pub(crate) command_lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) commands: Channel<CriticalSectionRawMutex, RawCommand, COMMAND_QUEUE_LEN>,
    /// One-slot completion channel: the reader task posts the outcome, the
    /// command caller takes it. Drained before every command.
    pub(crate) responses: Channel<CriticalSectionRawMutex, Result<Response<N>, Error>, 1>,
    pub(crate) urcs: UrcChannel,
    pub(crate) link: LinkSignal,
    pub(crate) open: AtomicBool,
    pub(crate) tx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN>,
    pub(crate) rx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN>,
}

impl<const N: usize> ChannelContext<N> {
    pub const fn new() -> Self {
        ChannelContext {
            parser: blocking_mutex::Mutex::new(RefCell::new(AtParser::new())),
            command_lock: Mutex::new(()),
            commands: Channel::new(),
            responses: Channel::new(),
            urcs: UrcChannel::new(),
            link: LinkSignal::new(),
            open: AtomicBool::new(false),
            tx_pipe: Pipe::new(),
            rx_pipe: Pipe::new(),
        }
    }

    pub(crate) fn with_parser<R>(&self, f: impl FnOnce(&mut AtParser<N>) -> R) -> R {
        self.parser.lock(|parser| f(&mut parser.borrow_mut()))
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// The URC broadcast of this channel. Subscribe from the task that
    /// drains unsolicited lines.
    pub fn urcs(&self) -> &UrcChannel {
        &self.urcs
    }
}

impl<const N: usize> Default for ChannelContext<N> {
    fn default() -> Self {
        Self::new()
    }
}
