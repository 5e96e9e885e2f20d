use core::str::from_utf8;

use heapless::Vec;

use crate::log;

/// Default capacity of the parser's response buffer.
pub const AT_BUF_SIZE: usize = 1024;

/// The two-byte marker a modem emits when it wants a raw payload.
pub const DATA_PROMPT: &[u8] = b"> ";

/// Classification of a single line received from the modem.
///
/// A line scanner returning `None` defers to the next scanner in the chain
/// (per-command, then session, then [generic_line_class]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineClass {
    /// Part of the response body, more lines follow.
    Intermediate,
    /// Terminates the response without becoming part of it ("OK").
    FinalOk,
    /// Terminates the response and is delivered as its last line ("ERROR").
    Final,
    /// Unsolicited result code, not part of any response.
    Urc,
    /// The line is final and announces `n` raw bytes that follow it.
    RawDataFollows(usize),
    /// Like [LineClass::RawDataFollows], but the payload arrives as ASCII
    /// hex pairs decoding to `n` bytes.
    HexDataFollows(usize),
}

/// A line classifier. Returns `None` to defer to the next classifier.
pub type LineScanner = fn(&[u8]) -> Option<LineClass>;

/// Receiver of parser events.
///
/// Both callbacks run synchronously inside [AtParser::feed] and must not
/// block.
pub trait ParserSink {
    /// A complete response has been collected. `body` holds the
    /// intermediate lines joined by `\n`, without the final "OK".
    fn handle_response(&mut self, body: &[u8]);

    /// An unsolicited line arrived, either explicitly classified as URC or
    /// received while no command was outstanding.
    fn handle_urc(&mut self, line: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No command outstanding, every line is a URC.
    Idle,
    /// A command is outstanding, collect its response.
    ReadLine,
    /// Like ReadLine, but the bare data prompt also terminates.
    DataPrompt,
    /// Capturing a fixed-length binary payload.
    RawData,
    /// Capturing a fixed-length payload encoded as ASCII hex pairs.
    HexData,
}

static OK_RESPONSES: &[&[u8]] = &[b"OK", b"> "];
static ERROR_RESPONSES: &[&[u8]] = &[b"ERROR", b"NO CARRIER", b"+CME ERROR:", b"+CMS ERROR:"];
static URC_RESPONSES: &[&[u8]] = &[b"RING"];

fn prefix_in_table(line: &[u8], table: &[&[u8]]) -> bool {
    table.iter().any(|prefix| line.starts_with(prefix))
}

/// The built-in fallback classifier, consulted when no installed scanner
/// claims a line.
pub fn generic_line_class(line: &[u8]) -> LineClass {
    if prefix_in_table(line, URC_RESPONSES) {
        LineClass::Urc
    } else if prefix_in_table(line, ERROR_RESPONSES) {
        LineClass::Final
    } else if prefix_in_table(line, OK_RESPONSES) {
        LineClass::FinalOk
    } else {
        LineClass::Intermediate
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Byte-fed AT response parser.
///
/// Consumes arbitrary byte slices, segments them into lines on `\r`/`\n`,
/// classifies every line and assembles the response of the command in
/// flight. Holds no IO; events leave through the [ParserSink] passed to
/// [feed](AtParser::feed).
///
/// The buffer layout is two cursors over one fixed array: bytes before
/// `current` are committed lines of the response in progress (separated by
/// `\n`), bytes from `current` up to the end form the line under
/// construction.
pub struct AtParser<const N: usize = AT_BUF_SIZE> {
    state: State,
    command_scanner: Option<LineScanner>,
    session_scanner: Option<LineScanner>,
    /// Armed by [expect_dataprompt](AtParser::expect_dataprompt) for the
    /// next command, cleared on reset.
    prompt: Option<&'static [u8]>,
    data_left: usize,
    /// High nibble of the hex pair being decoded, if one is pending.
    nibble: Option<u8>,
    buf: Vec<u8, N>,
    current: usize,
}

impl<const N: usize> AtParser<N> {
    pub const fn new() -> Self {
        AtParser {
            state: State::Idle,
            command_scanner: None,
            session_scanner: None,
            prompt: None,
            data_left: 0,
            nibble: None,
            buf: Vec::new(),
            current: 0,
        }
    }

    /// Restore the idle state, dropping any partial response and the
    /// per-command scanner. The session scanner survives.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.command_scanner = None;
        self.prompt = None;
        self.data_left = 0;
        self.nibble = None;
        self.buf.clear();
        self.current = 0;
    }

    /// Arm the parser for the response to a command about to be sent.
    ///
    /// Must be called before the command bytes reach the device. Enters the
    /// data-prompt state if [expect_dataprompt](AtParser::expect_dataprompt)
    /// was called since the last reset.
    pub fn await_response(&mut self) {
        self.state = match self.prompt {
            Some(_) => State::DataPrompt,
            None => State::ReadLine,
        };
    }

    /// The next command terminates on `prompt` (typically [DATA_PROMPT])
    /// as well as on a final line. One-shot, cleared on reset.
    pub fn expect_dataprompt(&mut self, prompt: &'static [u8]) {
        self.prompt = Some(prompt);
    }

    /// Install a classifier consulted first for every line of the next
    /// command's response. Cleared on reset.
    pub fn set_command_scanner(&mut self, scanner: LineScanner) {
        self.command_scanner = Some(scanner);
    }

    /// Install the session-wide classifier, consulted after the per-command
    /// one. Survives resets.
    pub fn set_session_scanner(&mut self, scanner: Option<LineScanner>) {
        self.session_scanner = scanner;
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Drive the state machine with received bytes, emitting events into
    /// `sink`. Feeding one big slice or the same bytes split at arbitrary
    /// points produces identical event sequences.
    pub fn feed<S: ParserSink>(&mut self, bytes: &[u8], sink: &mut S) {
        let mut i = 0;
        while i < bytes.len() {
            match self.state {
                State::Idle | State::ReadLine | State::DataPrompt => {
                    let ch = bytes[i];
                    i += 1;

                    if ch != b'\r' && ch != b'\n' {
                        // Separate from the previously committed line.
                        if !self.buf.is_empty() && self.current == self.buf.len() {
                            self.append(b'\n');
                            self.current = self.buf.len();
                        }
                        self.append(ch);
                    }

                    if ch == b'\n' {
                        self.handle_line(sink);
                    } else if self.state == State::DataPrompt
                        && &self.buf[self.current..] == self.prompt.unwrap_or(DATA_PROMPT)
                    {
                        // The prompt arrives without a line ending.
                        self.handle_line(sink);
                    }
                }

                State::RawData => {
                    if self.data_left > 0 {
                        self.append(bytes[i]);
                        i += 1;
                        self.data_left -= 1;
                    }
                    if self.data_left == 0 {
                        self.finish_data();
                    }
                }

                State::HexData => {
                    if self.data_left > 0 {
                        let ch = bytes[i];
                        i += 1;
                        if let Some(value) = hex_value(ch) {
                            match self.nibble.take() {
                                None => self.nibble = Some(value),
                                Some(high) => {
                                    self.append(high << 4 | value);
                                    self.data_left -= 1;
                                }
                            }
                        }
                    }
                    if self.data_left == 0 {
                        self.finish_data();
                    }
                }
            }
        }
    }

    /// Append one byte, keeping one byte of headroom. Overflowing bytes are
    /// silently dropped; a response larger than the buffer is delivered
    /// truncated.
    fn append(&mut self, ch: u8) {
        if self.buf.len() < N - 1 {
            let _ = self.buf.push(ch);
        }
    }

    /// The captured payload ends: terminate it, commit, and expect the
    /// textual final response.
    fn finish_data(&mut self) {
        self.append(b'\n');
        self.current = self.buf.len();
        self.state = State::ReadLine;
    }

    fn classify(&self, line: &[u8]) -> LineClass {
        self.command_scanner
            .and_then(|scan| scan(line))
            .or_else(|| self.session_scanner.and_then(|scan| scan(line)))
            .unwrap_or_else(|| generic_line_class(line))
    }

    /// A full line has been collected; classify and dispose of it.
    fn handle_line<S: ParserSink>(&mut self, sink: &mut S) {
        // Consecutive CR/LF produce empty lines, never emitted.
        if self.buf.len() == self.current {
            return;
        }

        let class = self.classify(&self.buf[self.current..]);

        match from_utf8(&self.buf[self.current..]) {
            Ok(line) => log::trace!("line {:?} ({:?})", line, class),
            Err(_) => log::trace!("line {:?} ({:?})", &self.buf[self.current..], class),
        }

        // Expected URCs and all lines outside a command go to the URC
        // handler and leave the response buffer untouched.
        if class == LineClass::Urc || self.state == State::Idle {
            sink.handle_urc(&self.buf[self.current..]);
            if self.current > 0 {
                // Also drop the separator written before this line.
                self.current -= 1;
            }
            self.buf.truncate(self.current);
            return;
        }

        match class {
            LineClass::FinalOk => {
                // The final "OK" is not part of the response body.
                if self.current > 0 {
                    self.current -= 1;
                }
                self.buf.truncate(self.current);
                sink.handle_response(&self.buf);
                self.reset();
            }
            LineClass::Final => {
                self.current = self.buf.len();
                sink.handle_response(&self.buf);
                self.reset();
            }
            LineClass::Intermediate => {
                self.current = self.buf.len();
            }
            LineClass::RawDataFollows(len) => {
                self.current = self.buf.len();
                self.data_left = len;
                self.state = State::RawData;
            }
            LineClass::HexDataFollows(len) => {
                self.current = self.buf.len();
                self.data_left = len;
                self.nibble = None;
                self.state = State::HexData;
            }
            // Handled above.
            LineClass::Urc => {}
        }
    }
}

impl<const N: usize> Default for AtParser<N> {
    fn default() -> Self {
        Self::new()
    }
}
