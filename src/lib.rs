//! Transport-agnostic AT command channel.
//!
//! The crate is split the way the wire protocol is: a pure, byte-fed
//! [parser](crate::parser::AtParser) that classifies every line a device
//! produces, and a [dispatcher](crate::AtChannel) that serializes commands
//! over one serial link, matches them with collected responses and
//! broadcasts unsolicited result codes.
//!
//! Plug in a UART by implementing [BuildIo]/[SplitIo] for your HAL's types,
//! then wire everything up with [spawn_at_channel].

#![no_std]
#![allow(clippy::unnecessary_lazy_evaluations)]
#![allow(clippy::single_component_path_imports)]

pub mod channel;
mod error;
pub mod parser;
pub mod pump;
pub mod urc;

#[cfg(all(feature = "log", feature = "defmt"))]
compile_error!("'log' and 'defmt' features are mutually exclusive");
#[cfg(not(any(feature = "log", feature = "defmt")))]
compile_error!("please enable a logging feature, e.g. 'log' or 'defmt'");
#[cfg(feature = "defmt")]
pub(crate) use defmt as log;
#[cfg(feature = "log")]
pub(crate) use log;

use embedded_io_async::{Read, Write};

pub use channel::{
    AtChannel, ChannelContext, LinkState, Response, COMMAND_MAX_LEN, DEFAULT_COMMAND_TIMEOUT,
};
pub use error::Error;
pub use parser::{
    generic_line_class, AtParser, LineClass, LineScanner, ParserSink, AT_BUF_SIZE, DATA_PROMPT,
};
pub use urc::{Lagged, UrcChannel, UrcLine, UrcSubscriber};

/// This trait is for building a `BuildIo::IO` that implements [SplitIo].
///
/// It lets users plug in UART driver types from whatever HAL they're using.
/// The IO pump constructs the IO when the link opens and drops it when the
/// link closes, so enabling and releasing the hardware belongs in
/// [BuildIo::build] and the IO's `Drop`.
pub trait BuildIo {
    type IO<'d>: SplitIo
    where
        Self: 'd;

    /// Construct a `BuildIo::IO` that implements [SplitIo].
    fn build(&mut self) -> Self::IO<'_>;
}

/// Split self into a reader and a writer, so that receiving and
/// transmitting can be driven concurrently.
pub trait SplitIo {
    type Reader<'u>: Read
    where
        Self: 'u;
    type Writer<'u>: Write
    where
        Self: 'u;

    fn split(&mut self) -> (Self::Reader<'_>, Self::Writer<'_>);
}

/// This macro sets up an AT channel, statically allocating its context and
/// spawning its pump tasks.
///
/// You can call [AtChannel::new] directly if you want more control over
/// initialization.
#[macro_export]
macro_rules! spawn_at_channel {
    ($spawner:expr, $io_ty:ty as $io:expr $(,)?) => {{
        static CONTEXT: $crate::ChannelContext = $crate::ChannelContext::new();

        let spawner: &::embassy_executor::Spawner = $spawner;
        let (channel, io_pump, rx_pump, tx_pump) = $crate::AtChannel::new($io, &CONTEXT);

        mod __tasks {
            use super::*;
            use $crate::pump_task;
            pump_task!(io_pump, $crate::pump::RawIoPump<'static, $io_ty>);
            pump_task!(rx_pump, $crate::pump::RxPump<'static>);
            pump_task!(tx_pump, $crate::pump::TxPump<'static>);
        }

        spawner.must_spawn(__tasks::io_pump(io_pump));
        spawner.must_spawn(__tasks::rx_pump(rx_pump));
        spawner.must_spawn(__tasks::tx_pump(tx_pump));

        channel
    }};
}
