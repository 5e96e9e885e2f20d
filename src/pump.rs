use core::str::from_utf8;

use embassy_futures::select::{select3, Either3};
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    channel::{Receiver, Sender},
    pipe::Pipe,
};
use embedded_io_async::{Read, Write};

use crate::channel::{LinkState, RawCommand, Response};
use crate::channel::context::{ParserLock, COMMAND_QUEUE_LEN, PIPE_LEN};
use crate::channel::link::LinkListener;
use crate::log;
use crate::parser::ParserSink;
use crate::urc::UrcChannel;
use crate::{BuildIo, Error, SplitIo};

pub const PUMP_COUNT: usize = 3;

/// One step of a background task's work loop. Drive it forever with
/// [pump_task](crate::pump_task).
#[allow(async_fn_in_trait)]
pub trait Pump {
    type Err;

    async fn pump(&mut self) -> Result<(), Self::Err>;
}

/// Bridges parser events onto the dispatcher's channels. Everything here
/// is non-blocking; it runs inside the parser lock.
pub(crate) struct EventSink<'context, const N: usize> {
    pub(crate) responses: Sender<'context, CriticalSectionRawMutex, Result<Response<N>, Error>, 1>,
    pub(crate) urcs: &'context UrcChannel,
}

impl<const N: usize> ParserSink for EventSink<'_, N> {
    fn handle_response(&mut self, body: &[u8]) {
        match from_utf8(body) {
            Ok(text) => log::debug!(">> {:?}", text),
            Err(_) => log::debug!(">> [{} bytes]", body.len()),
        }

        if self
            .responses
            .try_send(Ok(Response::from_body(body)))
            .is_err()
        {
            // Nobody armed a command, or the caller gave up long ago.
            log::warn!("dropping response no one is waiting for");
        }
    }

    fn handle_urc(&mut self, line: &[u8]) {
        match from_utf8(line) {
            Ok(text) => log::debug!("urc {:?}", text),
            Err(_) => log::debug!("urc [{} bytes]", line.len()),
        }
        self.urcs.publish(line);
    }
}

/// The reader task: drives the parser from received bytes.
pub struct RxPump<'context, const N: usize = { crate::parser::AT_BUF_SIZE }> {
    pub(crate) reader: &'context Pipe<CriticalSectionRawMutex, PIPE_LEN>,
    pub(crate) parser: &'context ParserLock<N>,
    pub(crate) sink: EventSink<'context, N>,
}

impl<const N: usize> Pump for RxPump<'_, N> {
    type Err = Error;

    async fn pump(&mut self) -> Result<(), Self::Err> {
        let mut buf = [0u8; 256];
        let received = Read::read(&mut self.reader, &mut buf)
            .await
            .map_err(|_| Error::Serial)?;

        let sink = &mut self.sink;
        self.parser
            .lock(|parser| parser.borrow_mut().feed(&buf[..received], sink));

        Ok(())
    }
}

/// Drains queued outbound commands into the TX pipe.
pub struct TxPump<'context> {
    pub(crate) writer: &'context Pipe<CriticalSectionRawMutex, PIPE_LEN>,
    pub(crate) commands: Receiver<'context, CriticalSectionRawMutex, RawCommand, COMMAND_QUEUE_LEN>,
}

impl Pump for TxPump<'_> {
    type Err = Error;

    async fn pump(&mut self) -> Result<(), Self::Err> {
        let command = self.commands.receive().await;

        // `Writer` is infallible. It is fine to ignore these errors.
        let _ = Write::write_all(&mut self.writer, command.as_bytes()).await;
        let _ = Write::flush(&mut self.writer).await;

        Ok(())
    }
}

/// Owns the serial IO and moves bytes between it and the RX/TX pipes.
///
/// The IO is constructed when the link opens and dropped when it closes,
/// so the transport's own teardown runs on [close](crate::AtChannel::close).
/// While suspended or closed the pump parks and costs nothing.
pub struct RawIoPump<'context, IO> {
    pub(crate) io: IO,
    /// sends received bytes to the reader task
    pub(crate) rx: &'context Pipe<CriticalSectionRawMutex, PIPE_LEN>,
    /// reads outbound bytes queued by the TX pump
    pub(crate) tx: &'context Pipe<CriticalSectionRawMutex, PIPE_LEN>,
    pub(crate) link: LinkListener<'context>,
    pub(crate) state: LinkState,
}

impl<IO: BuildIo> RawIoPump<'_, IO> {
    async fn open_pump(&mut self) -> Result<(), Error> {
        let mut io = self.io.build();
        let (mut reader, mut writer) = io.split();

        loop {
            let mut tx_buf = [0u8; 256];
            let mut rx_buf = [0u8; 256];

            match select3(
                Read::read(&mut self.tx, &mut tx_buf),
                reader.read(&mut rx_buf),
                self.link.next_state(),
            )
            .await
            {
                Either3::First(queued) => {
                    let bytes = queued.map_err(|_| Error::Serial)?;
                    writer
                        .write_all(&tx_buf[..bytes])
                        .await
                        .map_err(|_| Error::Serial)?;
                    writer.flush().await.map_err(|_| Error::Serial)?;
                }
                Either3::Second(result) => {
                    let bytes = result.map_err(|_| Error::Serial)?;

                    match from_utf8(&rx_buf[..bytes]) {
                        Ok(text) => log::trace!("bytes read {:?}", text),
                        Err(_) => log::trace!("read invalid {:?}", &rx_buf[..bytes]),
                    }

                    let _ = Write::write_all(&mut self.rx, &rx_buf[..bytes]).await;
                    let _ = Write::flush(&mut self.rx).await;
                }
                Either3::Third(state) => {
                    self.state = state;
                    if state != LinkState::Open {
                        // Drop the IO; its teardown is the transport's own.
                        break Ok(());
                    }
                }
            }
        }
    }

    async fn parked_pump(&mut self) {
        self.state = self.link.next_state().await;
    }
}

impl<IO: BuildIo> Pump for RawIoPump<'_, IO> {
    type Err = Error;

    async fn pump(&mut self) -> Result<(), Self::Err> {
        if self.state == LinkState::Open {
            self.open_pump().await?;
        } else {
            self.parked_pump().await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll};

    use embassy_sync::blocking_mutex;
    use embassy_sync::channel::Channel;
    use embassy_sync::pipe::Pipe;
    use heapless::Vec;

    use super::*;
    use crate::channel::context::ParserLock;
    use crate::channel::link::LinkSignal;
    use crate::parser::AtParser;
    use crate::test::{block_on, noop_waker, ScriptIo};

    type ResponseChannel = Channel<CriticalSectionRawMutex, Result<Response<64>, Error>, 1>;

    #[test]
    fn event_sink_posts_the_completion_and_drops_extras() {
        let responses: ResponseChannel = Channel::new();
        let urcs = UrcChannel::new();
        let mut sink = EventSink {
            responses: responses.sender(),
            urcs: &urcs,
        };

        sink.handle_response(b"+CSQ: 9,99");
        let delivered = responses.try_receive().unwrap().unwrap();
        assert_eq!(delivered.as_bytes(), b"+CSQ: 9,99");

        // A completion nobody collects is dropped, never queued behind.
        sink.handle_response(b"first");
        sink.handle_response(b"second");
        assert_eq!(
            responses.try_receive().unwrap().unwrap().as_bytes(),
            b"first"
        );
        assert!(responses.try_receive().is_err());
    }

    #[test]
    fn event_sink_broadcasts_urcs_not_responses() {
        let responses: ResponseChannel = Channel::new();
        let urcs = UrcChannel::new();
        let mut subscriber = urcs.subscribe();
        let mut sink = EventSink {
            responses: responses.sender(),
            urcs: &urcs,
        };

        sink.handle_urc(b"RING");

        let urc = block_on(subscriber.next_urc()).unwrap();
        assert_eq!(urc.as_bytes(), b"RING");
        assert!(responses.try_receive().is_err());
    }

    #[test]
    fn rx_pump_drives_the_parser_from_the_pipe() {
        let rx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN> = Pipe::new();
        let parser: ParserLock<64> = blocking_mutex::Mutex::new(RefCell::new(AtParser::new()));
        let responses: ResponseChannel = Channel::new();
        let urcs = UrcChannel::new();
        let mut subscriber = urcs.subscribe();
        let mut pump = RxPump {
            reader: &rx_pipe,
            parser: &parser,
            sink: EventSink {
                responses: responses.sender(),
                urcs: &urcs,
            },
        };

        parser.lock(|parser| parser.borrow_mut().await_response());
        block_on(Write::write_all(
            &mut &rx_pipe,
            b"+CSQ: 9,0\r\nOK\r\nRING\r\n",
        ))
        .unwrap();
        block_on(pump.pump()).unwrap();

        assert_eq!(
            responses.try_receive().unwrap().unwrap().as_bytes(),
            b"+CSQ: 9,0"
        );
        assert_eq!(block_on(subscriber.next_urc()).unwrap().as_bytes(), b"RING");
        assert!(parser.lock(|parser| parser.borrow().is_idle()));
    }

    #[test]
    fn tx_pump_drains_commands_into_the_pipe() {
        let tx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN> = Pipe::new();
        let commands: Channel<CriticalSectionRawMutex, RawCommand, COMMAND_QUEUE_LEN> =
            Channel::new();
        let mut pump = TxPump {
            writer: &tx_pipe,
            commands: commands.receiver(),
        };

        assert!(commands
            .try_send(RawCommand::Binary(Vec::from_slice(b"AT\r").unwrap()))
            .is_ok());
        block_on(pump.pump()).unwrap();

        let mut buf = [0u8; 16];
        let received = block_on(Read::read(&mut &tx_pipe, &mut buf)).unwrap();
        assert_eq!(&buf[..received], b"AT\r");
    }

    #[test]
    fn raw_io_pump_moves_bytes_until_the_link_drops() {
        let rx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN> = Pipe::new();
        let tx_pipe: Pipe<CriticalSectionRawMutex, PIPE_LEN> = Pipe::new();
        let link = LinkSignal::new();
        let written = RefCell::new(Vec::new());
        let mut pump = RawIoPump {
            io: ScriptIo {
                rx: b"OK\r\n",
                written: &written,
            },
            rx: &rx_pipe,
            tx: &tx_pipe,
            link: link.listen(),
            state: LinkState::Open,
        };

        block_on(Write::write_all(&mut &tx_pipe, b"AT\r")).unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        {
            let mut fut = pin!(pump.pump());
            for _ in 0..4 {
                assert!(fut.as_mut().poll(&mut cx).is_pending());
            }

            // Outbound bytes reached the serial side, inbound bytes the
            // reader pipe.
            assert_eq!(written.borrow().as_slice(), b"AT\r" as &[u8]);
            let mut buf = [0u8; 16];
            let received = block_on(Read::read(&mut &rx_pipe, &mut buf)).unwrap();
            assert_eq!(&buf[..received], b"OK\r\n");

            link.broadcast(LinkState::Closed);
            assert_eq!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(())));
        }
        assert_eq!(pump.state, LinkState::Closed);

        // Parked while the link is down, tracking the next state change.
        link.broadcast(LinkState::Open);
        block_on(pump.pump()).unwrap();
        assert_eq!(pump.state, LinkState::Open);
    }
}

/// Declare an embassy task that drives one pump forever, logging and
/// swallowing its errors.
#[macro_export]
macro_rules! pump_task {
    ($name:ident, $type:ty) => {
        #[embassy_executor::task]
        pub(crate) async fn $name(mut pump: $type) {
            use $crate::pump::Pump;
            loop {
                if let Err(err) = pump.pump().await {
                    #[cfg(feature = "log")]
                    log::error!("error pumping {} {:?}", stringify!($name), err);
                    #[cfg(feature = "defmt")]
                    defmt::error!("error pumping {} {:?}", stringify!($name), err);
                }
            }
        }
    };
}
