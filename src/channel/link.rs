use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    pubsub::{PubSubBehavior, PubSubChannel, Subscriber},
};

/// Lifecycle of the serial link behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// The transport is up and the IO pump moves bytes.
    Open,
    /// The transport stays constructed but the IO pump is parked.
    Suspended,
    /// The transport is torn down.
    Closed,
}

pub const LINK_SIGNAL_LISTENERS: usize = 2;

/// A PubSub channel for signaling link state transitions to the IO pump.
pub struct LinkSignal {
    channel: PubSubChannel<CriticalSectionRawMutex, LinkState, 2, LINK_SIGNAL_LISTENERS, 0>,
}

pub struct LinkListener<'a> {
    listener: Subscriber<'a, CriticalSectionRawMutex, LinkState, 2, LINK_SIGNAL_LISTENERS, 0>,
}

impl LinkSignal {
    pub const fn new() -> Self {
        Self {
            channel: PubSubChannel::new(),
        }
    }

    pub(crate) fn listen(&self) -> LinkListener<'_> {
        LinkListener {
            listener: self
                .channel
                .subscriber()
                .expect("not enough LinkSignal listeners"),
        }
    }

    pub(crate) fn broadcast(&self, state: LinkState) {
        self.channel.publish_immediate(state);
    }
}

impl LinkListener<'_> {
    pub(crate) async fn next_state(&mut self) -> LinkState {
        self.listener.next_message_pure().await
    }
}
