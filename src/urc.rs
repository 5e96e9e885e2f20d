//! Queued delivery of unsolicited result codes.
//!
//! URCs are published from the reader task without blocking it; consumers
//! drain them from their own tasks through a [UrcSubscriber]. A subscriber
//! that falls behind observes [Lagged] instead of stalling the reader.

use core::str::from_utf8;

use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    pubsub::{PubSubBehavior, PubSubChannel, Subscriber, WaitResult},
};
use heapless::Vec;

use crate::log;
use crate::Error;

/// Longest URC line delivered intact; longer lines are truncated.
pub const URC_LINE_LEN: usize = 256;
/// URCs buffered per subscriber before old ones are dropped.
pub const URC_QUEUE_LEN: usize = 8;
pub const URC_SUBSCRIBERS: usize = 4;

type Channel = PubSubChannel<CriticalSectionRawMutex, UrcLine, URC_QUEUE_LEN, URC_SUBSCRIBERS, 0>;

/// One unsolicited line, as received (without its line ending).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UrcLine {
    bytes: Vec<u8, URC_LINE_LEN>,
}

impl UrcLine {
    pub(crate) fn from_line(line: &[u8]) -> Self {
        if line.len() > URC_LINE_LEN {
            log::warn!("truncating {} byte URC", line.len());
        }
        let take = usize::min(line.len(), URC_LINE_LEN);
        UrcLine {
            bytes: Vec::from_slice(&line[..take]).unwrap_or_else(|_| Vec::new()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        from_utf8(&self.bytes).map_err(|_| Error::InvalidUtf8)
    }
}

/// The subscriber missed this many URCs since the last call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Lagged(pub u64);

/// Broadcast channel the reader task publishes URCs into.
pub struct UrcChannel {
    channel: Channel,
}

impl UrcChannel {
    pub const fn new() -> Self {
        UrcChannel {
            channel: PubSubChannel::new(),
        }
    }

    /// Publish without waiting; the oldest queued URC is dropped if a
    /// subscriber's queue is full.
    pub(crate) fn publish(&self, line: &[u8]) {
        self.channel.publish_immediate(UrcLine::from_line(line));
    }

    /// Claim one of the [URC_SUBSCRIBERS] subscriber slots.
    pub fn subscribe(&self) -> UrcSubscriber<'_> {
        UrcSubscriber {
            subscriber: self
                .channel
                .subscriber()
                .expect("not enough URC subscriber slots"),
        }
    }
}

impl Default for UrcChannel {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UrcSubscriber<'a> {
    subscriber: Subscriber<'a, CriticalSectionRawMutex, UrcLine, URC_QUEUE_LEN, URC_SUBSCRIBERS, 0>,
}

impl UrcSubscriber<'_> {
    /// Wait for the next URC. Returns `Err(Lagged)` once if URCs were
    /// dropped because this subscriber fell behind; the call after that
    /// delivers again.
    pub async fn next_urc(&mut self) -> Result<UrcLine, Lagged> {
        match self.subscriber.next_message().await {
            WaitResult::Message(urc) => Ok(urc),
            WaitResult::Lagged(missed) => Err(Lagged(missed)),
        }
    }
}
