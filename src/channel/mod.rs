//! The command dispatcher: serializes commands over one serial channel,
//! matches them with the responses the reader collects, and hands
//! unsolicited lines to the URC broadcast.

pub(crate) mod context;
pub(crate) mod link;

use core::fmt;
use core::fmt::Write as _;
use core::sync::atomic::Ordering;

use embassy_time::{with_timeout, Duration, Timer};
use heapless::{String, Vec};

use crate::log;
use crate::parser::{LineScanner, DATA_PROMPT};
use crate::pump::{EventSink, RawIoPump, RxPump, TxPump};
use crate::urc::UrcSubscriber;
use crate::{BuildIo, Error};

pub use context::{ChannelContext, RawCommand, Response, COMMAND_MAX_LEN};
pub use link::{LinkSignal, LinkState};

/// Applied to every command unless [AtChannel::set_timeout] changes it.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Scratch size for the expected reply of [AtChannel::config].
const CONFIG_PROBE_LEN: usize = 32;

static HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Handle for issuing AT commands over one serial channel.
///
/// Created together with its three pump tasks by [AtChannel::new]; nothing
/// moves until the pumps are spawned and [open](AtChannel::open) is called.
/// At most one command is in flight at a time; concurrent callers are
/// serialized.
pub struct AtChannel<'c, const N: usize = { crate::parser::AT_BUF_SIZE }> {
    context: &'c ChannelContext<N>,
    timeout: Option<Duration>,
}

impl<'c, const N: usize> AtChannel<'c, N> {
    /// Construct the channel handle and its pumps. Spawn the pumps (see
    /// [pump_task](crate::pump_task) and
    /// [spawn_at_channel](crate::spawn_at_channel)), then call
    /// [open](AtChannel::open).
    pub fn new<IO: BuildIo>(
        io: IO,
        context: &'c ChannelContext<N>,
    ) -> (Self, RawIoPump<'c, IO>, RxPump<'c, N>, TxPump<'c>) {
        let io_pump = RawIoPump {
            io,
            rx: &context.rx_pipe,
            tx: &context.tx_pipe,
            link: context.link.listen(),
            state: LinkState::Closed,
        };

        let rx_pump = RxPump {
            reader: &context.rx_pipe,
            parser: &context.parser,
            sink: EventSink {
                responses: context.responses.sender(),
                urcs: &context.urcs,
            },
        };

        let tx_pump = TxPump {
            writer: &context.tx_pipe,
            commands: context.commands.receiver(),
        };

        let channel = AtChannel {
            context,
            timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        };

        (channel, io_pump, rx_pump, tx_pump)
    }

    /// Bring the link up: the IO pump constructs the transport and starts
    /// moving bytes. Stale completions from before the link went down are
    /// drained so they cannot satisfy the next command.
    pub fn open(&self) {
        while self.context.responses.try_receive().is_ok() {}
        self.context.with_parser(|parser| parser.reset());
        self.context.open.store(true, Ordering::Relaxed);
        self.context.link.broadcast(LinkState::Open);
    }

    /// Tear the link down. An in-flight command fails with
    /// [Error::Closed] instead of waiting out its timeout.
    pub fn close(&self) {
        self.context.open.store(false, Ordering::Relaxed);
        self.context.link.broadcast(LinkState::Closed);
        let _ = self.context.responses.try_send(Err(Error::Closed));
        self.context.with_parser(|parser| parser.reset());
    }

    /// Park the IO pump, e.g. while the device is powered down. The
    /// channel still counts as open; commands sent while suspended run
    /// into their timeout.
    pub fn suspend(&self) {
        self.context.link.broadcast(LinkState::Suspended);
    }

    /// Un-park the IO pump after [suspend](AtChannel::suspend).
    pub fn resume(&self) {
        if self.context.is_open() {
            self.context.link.broadcast(LinkState::Open);
        }
    }

    /// Install the session-wide line classifier, consulted for every line
    /// after the per-command one. `None` restores the built-in tables.
    pub fn set_line_scanner(&self, scanner: Option<LineScanner>) {
        self.context
            .with_parser(|parser| parser.set_session_scanner(scanner));
    }

    /// Install a classifier for the next command only.
    pub fn set_command_scanner(&self, scanner: LineScanner) {
        self.context
            .with_parser(|parser| parser.set_command_scanner(scanner));
    }

    /// The next command also terminates on the bare data prompt
    /// ([DATA_PROMPT]), which the modem emits without a line ending.
    pub fn expect_dataprompt(&self) {
        self.context
            .with_parser(|parser| parser.expect_dataprompt(DATA_PROMPT));
    }

    /// Like [expect_dataprompt](AtChannel::expect_dataprompt) with a
    /// device-specific prompt sequence.
    pub fn expect_prompt(&self, prompt: &'static [u8]) {
        self.context
            .with_parser(|parser| parser.expect_dataprompt(prompt));
    }

    /// Cap how long [command](AtChannel::command) waits for its response.
    /// `None` waits indefinitely (until [close](AtChannel::close)).
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Subscribe to unsolicited result codes. Drain from a task that does
    /// not issue commands on this channel, or accept that URCs queue up
    /// while a command is waiting.
    pub fn urc_subscriber(&self) -> UrcSubscriber<'c> {
        self.context.urcs.subscribe()
    }

    /// Send `cmd` with a trailing carriage return appended and wait for
    /// the response.
    pub async fn command(&self, cmd: &str) -> Result<Response<N>, Error> {
        self.command_fmt(format_args!("{cmd}")).await
    }

    /// [command](AtChannel::command), formatting the line into the bounded
    /// command scratch first. Fails with [Error::Overflow] before touching
    /// the transport if the line does not fit.
    pub async fn command_fmt(&self, args: fmt::Arguments<'_>) -> Result<Response<N>, Error> {
        let line = format_command(args)?;
        log::debug!("<< {}", &line.as_str()[..line.len() - 1]);
        self.run_command(RawCommand::Text(line)).await
    }

    /// Send raw bytes as a command, without formatting and without a
    /// carriage return, and wait for the response.
    pub async fn command_raw(&self, bytes: &[u8]) -> Result<Response<N>, Error> {
        log::debug!("<< [{} bytes]", bytes.len());

        let _guard = self.context.command_lock.lock().await;
        self.arm()?;
        self.enqueue_raw(bytes).await;
        self.collect_response().await
    }

    async fn run_command(&self, command: RawCommand) -> Result<Response<N>, Error> {
        let _guard = self.context.command_lock.lock().await;
        self.arm()?;
        self.context.commands.send(command).await;
        self.collect_response().await
    }

    /// Check the link and arm the parser. Must happen before any command
    /// byte reaches the device.
    fn arm(&self) -> Result<(), Error> {
        if !self.context.is_open() {
            // Drop per-command settings installed for this command.
            self.context.with_parser(|parser| parser.reset());
            return Err(Error::Closed);
        }
        while self.context.responses.try_receive().is_ok() {}
        self.context.with_parser(|parser| parser.await_response());
        Ok(())
    }

    async fn collect_response(&self) -> Result<Response<N>, Error> {
        let outcome = match self.timeout {
            Some(timeout) => with_timeout(timeout, self.context.responses.receive()).await,
            None => Ok(self.context.responses.receive().await),
        };

        match outcome {
            Err(_) => {
                // Abandon the partial response; anything the device still
                // sends for this command is delivered as a URC.
                self.context.with_parser(|parser| parser.reset());
                log::warn!("command timed out");
                Err(Error::Timeout)
            }
            Ok(result) => {
                if !self.context.is_open() {
                    return Err(Error::Closed);
                }
                result
            }
        }
    }

    /// Write a line to the device without engaging the parser or waiting
    /// for any response.
    pub async fn send(&self, line: &str) -> Result<(), Error> {
        self.send_fmt(format_args!("{line}")).await
    }

    /// [send](AtChannel::send), formatting into the bounded command
    /// scratch. No carriage return is appended.
    pub async fn send_fmt(&self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        let mut line = String::new();
        line.write_fmt(args).map_err(|_| Error::Overflow)?;
        if !self.context.is_open() {
            return Err(Error::Closed);
        }
        log::debug!("S< {}", line.as_str());
        self.context.commands.send(RawCommand::Text(line)).await;
        Ok(())
    }

    /// Write raw bytes to the device, fire and forget.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        if !self.context.is_open() {
            return Err(Error::Closed);
        }
        log::debug!("R< [{} bytes]", bytes.len());
        self.enqueue_raw(bytes).await;
        Ok(())
    }

    /// Write bytes encoded as uppercase ASCII hex pairs, chunked through
    /// the command scratch.
    pub async fn send_hex(&self, bytes: &[u8]) -> Result<(), Error> {
        if !self.context.is_open() {
            return Err(Error::Closed);
        }
        log::debug!("H< [{} bytes]", bytes.len());
        for chunk in bytes.chunks(COMMAND_MAX_LEN / 2) {
            self.context
                .commands
                .send(RawCommand::Binary(hex_chunk(chunk)))
                .await;
        }
        Ok(())
    }

    async fn enqueue_raw(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(context::RAW_CHUNK_LEN) {
            let mut copy = Vec::new();
            copy.extend_from_slice(chunk).unwrap();
            self.context.commands.send(RawCommand::Binary(copy)).await;
        }
    }

    /// Set a configuration option and read it back until the device
    /// confirms it, retrying up to `attempts` times with a one second
    /// pause between rounds.
    ///
    /// `Err(Error::Unconfirmed)` means every attempt went through but the
    /// device never reported the requested value.
    pub async fn config(&self, option: &str, value: &str, attempts: usize) -> Result<(), Error> {
        for attempt in 0..attempts {
            // The set may fail spuriously; only the read-back counts.
            let _ = self.command_fmt(format_args!("AT+{option}={value}")).await;

            let response = self.command_fmt(format_args!("AT+{option}?")).await?;
            let probe = config_probe(option, value)?;
            if response.as_bytes().starts_with(probe.as_bytes()) {
                return Ok(());
            }

            log::warn!("config {} not confirmed, attempt {}", option, attempt + 1);
            if attempt + 1 < attempts {
                Timer::after(Duration::from_secs(1)).await;
            }
        }

        Err(Error::Unconfirmed)
    }
}

/// Format one outbound command line and terminate it with the modem-style
/// carriage return.
fn format_command(args: fmt::Arguments<'_>) -> Result<String<COMMAND_MAX_LEN>, Error> {
    let mut line = String::new();
    line.write_fmt(args).map_err(|_| Error::Overflow)?;
    line.push('\r').map_err(|_| Error::Overflow)?;
    Ok(line)
}

/// The reply prefix that confirms `AT+option?` returned `value`.
fn config_probe(option: &str, value: &str) -> Result<String<CONFIG_PROBE_LEN>, Error> {
    let mut probe = String::new();
    write!(probe, "+{option}: {value}").map_err(|_| Error::Overflow)?;
    Ok(probe)
}

fn hex_chunk(bytes: &[u8]) -> Vec<u8, { context::RAW_CHUNK_LEN }> {
    let mut out = Vec::new();
    for &byte in bytes {
        let _ = out.push(HEX_DIGITS[usize::from(byte >> 4)]);
        let _ = out.push(HEX_DIGITS[usize::from(byte & 0xf)]);
    }
    out
}
