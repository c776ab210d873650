//! A Hayes AT command interpreter.
//!
//! Pure state machine: it is fed device-sourced bytes and produces reply
//! bytes plus at most one control event per call. It never touches I/O;
//! the supervisor owns it and writes its output to the device.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Most characters a command line may hold before it is discarded.
const COMMAND_BUFFER_LIMIT: usize = 255;

/// Register defaults, applied on construction, `ATZ` and `AT&F`.
const REGISTER_DEFAULTS: [(usize, u8); 13] = [
    (0, 0),   // auto-answer rings (0 disables)
    (1, 0),   // ring count
    (2, 43),  // escape character '+'
    (3, 13),  // CR
    (4, 10),  // LF
    (5, 8),   // BS
    (6, 2),   // dial tone wait
    (7, 50),  // carrier wait
    (8, 2),   // comma pause
    (9, 6),   // carrier detect time
    (10, 14), // carrier loss time
    (11, 95), // DTMF duration
    (12, 50), // escape guard time, 1/50 s
];

/// The operating mode of the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// AT parsing is active, no data path.
    Command,

    /// The data path is open; bytes pass through untouched.
    Online,

    /// The data path is open but suspended; AT parsing is active.
    OnlineCommand,
}

/// A side-effect request emitted by the interpreter.
///
/// At most one is produced per [`Modem::feed`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemAction {
    /// `ATD`/`ATA`: open the remote session. The dialled digits are
    /// carried along but do not affect the destination.
    Dial(String),

    /// `ATH0` (or a reset) while a carrier is up: drop the session.
    Hangup,

    /// `ATO`: resume the suspended data path.
    Resume,
}

/// What one [`Modem::feed`] call produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    /// Bytes to write back to the device (echo, info text, result codes).
    pub output: Vec<u8>,

    /// A control event for the supervisor, if any.
    pub action: Option<ModemAction>,
}

/// A Hayes result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Command line accepted.
    Ok,

    /// Carrier established, with the speed when known.
    Connect(Option<u32>),

    /// Incoming ring.
    Ring,

    /// No carrier (established or establishable).
    NoCarrier,

    /// Command line rejected.
    Error,

    /// No dial tone on the line.
    NoDialtone,

    /// The far end is busy.
    Busy,

    /// The far end did not pick up.
    NoAnswer,
}

impl ResultCode {
    fn numeric(&self) -> u8 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Connect(_) => 1,
            ResultCode::Ring => 2,
            ResultCode::NoCarrier => 3,
            ResultCode::Error => 4,
            ResultCode::NoDialtone => 6,
            ResultCode::Busy => 7,
            ResultCode::NoAnswer => 8,
        }
    }

    fn verbose(&self) -> String {
        match self {
            ResultCode::Ok => "OK".into(),
            ResultCode::Connect(None) => "CONNECT".into(),
            ResultCode::Connect(Some(speed)) => format!("CONNECT {speed}"),
            ResultCode::Ring => "RING".into(),
            ResultCode::NoCarrier => "NO CARRIER".into(),
            ResultCode::Error => "ERROR".into(),
            ResultCode::NoDialtone => "NO DIALTONE".into(),
            ResultCode::Busy => "BUSY".into(),
            ResultCode::NoAnswer => "NO ANSWER".into(),
        }
    }
}

/// Watches the online byte stream for `<guard> +++ <guard>`.
///
/// The three escape characters are forwarded to the remote regardless;
/// confirmation only happens once the trailing guard silence has elapsed,
/// which the pump checks via [`Modem::escape_deadline`].
#[derive(Debug, Default)]
struct EscapeTracker {
    /// When the last device-sourced byte was seen. `None` right after
    /// entering online, which counts as silence.
    last_byte_at: Option<Instant>,

    /// Consecutive escape characters seen after a guard silence.
    run: u8,
}

impl EscapeTracker {
    fn arm(&mut self) {
        self.last_byte_at = None;
        self.run = 0;
    }

    fn observe(&mut self, bytes: &[u8], now: Instant, escape_char: u8, guard: Duration) {
        let mut quiet = match self.last_byte_at {
            None => true,
            Some(at) => now.duration_since(at) >= guard,
        };

        for &byte in bytes {
            if byte == escape_char {
                if quiet {
                    self.run = 1;
                } else if (1..3).contains(&self.run) {
                    self.run += 1;
                } else {
                    // A fourth escape character spoils the sequence.
                    self.run = 0;
                }
            } else {
                self.run = 0;
            }

            // Bytes within one chunk arrive back to back.
            quiet = false;
        }

        if !bytes.is_empty() {
            self.last_byte_at = Some(now);
        }
    }

    fn deadline(&self, guard: Duration) -> Option<Instant> {
        if self.run == 3 {
            self.last_byte_at.map(|at| at + guard)
        } else {
            None
        }
    }

    fn confirm(&mut self, now: Instant, guard: Duration) -> bool {
        let confirmed = self.run == 3
            && self
                .last_byte_at
                .map(|at| now.duration_since(at) >= guard)
                .unwrap_or(false);

        if confirmed {
            self.run = 0;
        }

        confirmed
    }
}

/// The emulated modem.
#[derive(Debug)]
pub struct Modem {
    mode: Mode,
    registers: [u8; 256],
    echo: bool,
    verbose: bool,
    quiet: bool,

    line: Vec<u8>,
    overflowed: bool,

    /// Set while a dial is in flight; local input is suppressed until
    /// the supervisor reports the outcome.
    dialling: bool,

    last_dialled: Option<String>,
    connect_speed: u32,
    escape: EscapeTracker,

    // Stored by their commands but otherwise inert.
    speaker_mode: u8,
    speaker_volume: u8,
    dcd_mode: u8,
    dtr_mode: u8,
    flow_mode: u8,
    dsr_mode: u8,
}

impl Modem {
    /// A modem in command mode with factory defaults.
    pub fn new(connect_speed: u32) -> Self {
        let mut modem = Self {
            mode: Mode::Command,
            registers: [0; 256],
            echo: true,
            verbose: true,
            quiet: false,
            line: Vec::with_capacity(COMMAND_BUFFER_LIMIT),
            overflowed: false,
            dialling: false,
            last_dialled: None,
            connect_speed,
            escape: EscapeTracker::default(),
            speaker_mode: 1,
            speaker_volume: 2,
            dcd_mode: 0,
            dtr_mode: 2,
            flow_mode: 0,
            dsr_mode: 0,
        };

        modem.soft_reset();
        modem
    }

    /// The current operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether a dial is in flight and awaiting the supervisor's verdict.
    pub fn is_dialling(&self) -> bool {
        self.dialling
    }

    fn guard(&self) -> Duration {
        // S12 counts in fiftieths of a second.
        Duration::from_millis(u64::from(self.registers[12]) * 20)
    }

    /// Process device-sourced bytes.
    ///
    /// In command modes this assembles and executes AT lines. Online it
    /// only observes the stream for the escape sequence; the bytes
    /// themselves keep flowing through the pump.
    pub fn feed(&mut self, input: &[u8], now: Instant) -> Reply {
        if self.mode == Mode::Online {
            let escape_char = self.registers[2];
            let guard = self.guard();
            self.escape.observe(input, now, escape_char, guard);
            return Reply::default();
        }

        let mut reply = Reply::default();

        for &byte in input {
            if self.dialling || reply.action.is_some() {
                // One event per call; anything typed during a dial is
                // dropped until the supervisor reports back.
                break;
            }

            reply.action = self.push_byte(byte, &mut reply.output);
        }

        reply
    }

    /// When the pump should check back for escape confirmation.
    pub fn escape_deadline(&self) -> Option<Instant> {
        if self.mode == Mode::Online {
            self.escape.deadline(self.guard())
        } else {
            None
        }
    }

    /// Confirm a pending escape sequence once its trailing guard silence
    /// has elapsed. Returns the bytes to write to the device.
    pub fn confirm_escape(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.mode == Mode::Online && self.escape.confirm(now, self.guard()) {
            debug!("Escape sequence confirmed, suspending data mode");
            self.mode = Mode::OnlineCommand;
            Some(self.render_result(ResultCode::Ok))
        } else {
            None
        }
    }

    /// The supervisor reports that the dial came up. Returns the CONNECT
    /// message and switches online.
    pub fn dial_succeeded(&mut self) -> Vec<u8> {
        self.dialling = false;
        self.mode = Mode::Online;
        self.line.clear();
        self.overflowed = false;
        self.escape.arm();

        self.render_result(ResultCode::Connect(Some(self.connect_speed)))
    }

    /// The supervisor reports that the dial failed. Returns the result
    /// code bytes; the modem stays in command mode.
    pub fn dial_failed(&mut self, code: ResultCode) -> Vec<u8> {
        self.dialling = false;
        self.mode = Mode::Command;

        self.render_result(code)
    }

    /// The carrier dropped while (suspended-)online.
    pub fn carrier_lost(&mut self) -> Vec<u8> {
        self.dialling = false;
        self.mode = Mode::Command;

        self.render_result(ResultCode::NoCarrier)
    }

    fn soft_reset(&mut self) {
        self.echo = true;
        self.verbose = true;
        self.quiet = false;
        self.line.clear();
        self.overflowed = false;
        self.dialling = false;
        self.speaker_mode = 1;
        self.speaker_volume = 2;
        self.dcd_mode = 0;
        self.dtr_mode = 2;
        self.flow_mode = 0;
        self.dsr_mode = 0;

        self.registers = [0; 256];
        for (register, value) in REGISTER_DEFAULTS {
            self.registers[register] = value;
        }
    }

    fn push_byte(&mut self, byte: u8, out: &mut Vec<u8>) -> Option<ModemAction> {
        let cr = self.registers[3];
        let lf = self.registers[4];
        let bs = self.registers[5];

        if byte == cr {
            if self.echo {
                out.push(byte);
            }
            return self.execute_line(out);
        }

        if byte == lf {
            return None;
        }

        if byte == bs {
            if self.line.pop().is_some() && self.echo {
                out.extend_from_slice(&[bs, b' ', bs]);
            }
            return None;
        }

        if self.line.len() < COMMAND_BUFFER_LIMIT {
            self.line.push(byte);
        } else {
            self.overflowed = true;
        }

        if self.echo && (0x20..0x7f).contains(&byte) {
            out.push(byte);
        }

        None
    }

    fn execute_line(&mut self, out: &mut Vec<u8>) -> Option<ModemAction> {
        let line = std::mem::take(&mut self.line);
        let overflowed = std::mem::replace(&mut self.overflowed, false);

        if overflowed {
            debug!("Command line overflowed, rejecting");
            out.extend_from_slice(&self.render_result(ResultCode::Error));
            return None;
        }

        let line: Vec<u8> = line
            .iter()
            .copied()
            .skip_while(|b| b.is_ascii_whitespace())
            .collect();

        if line.is_empty() {
            return None;
        }

        trace!(line = %String::from_utf8_lossy(&line), "Executing command line");

        if line.len() < 2 || !line[..2].eq_ignore_ascii_case(b"AT") {
            out.extend_from_slice(&self.render_result(ResultCode::Error));
            return None;
        }

        let body = line[2..].to_vec();
        let (code, action) = self.run_commands(&body, out);

        if self.dialling {
            // The dial's result code arrives with the supervisor's
            // verdict, not now.
            return action;
        }

        out.extend_from_slice(&self.render_result(code));
        action
    }

    /// Execute the commands of one line, left to right. The line's result
    /// is the worst outcome: an error stops execution and wins.
    fn run_commands(&mut self, body: &[u8], out: &mut Vec<u8>) -> (ResultCode, Option<ModemAction>) {
        let mut i = 0;
        let mut action = None;

        while i < body.len() {
            let command = body[i].to_ascii_uppercase();
            i += 1;

            match command {
                b' ' | b'\t' => {}
                b'E' => match digit(body, &mut i).unwrap_or(0) {
                    0 => self.echo = false,
                    1 => self.echo = true,
                    _ => return (ResultCode::Error, action),
                },
                b'Q' => match digit(body, &mut i).unwrap_or(0) {
                    0 => self.quiet = false,
                    1 => self.quiet = true,
                    _ => return (ResultCode::Error, action),
                },
                b'V' => match digit(body, &mut i).unwrap_or(0) {
                    0 => self.verbose = false,
                    1 => self.verbose = true,
                    _ => return (ResultCode::Error, action),
                },
                b'H' => match digit(body, &mut i).unwrap_or(0) {
                    0 => {
                        if self.mode == Mode::OnlineCommand {
                            self.mode = Mode::Command;
                            return (ResultCode::NoCarrier, Some(ModemAction::Hangup));
                        }
                        // Already on hook.
                    }
                    1 => {}
                    _ => return (ResultCode::Error, action),
                },
                b'Z' => {
                    let _ = digit(body, &mut i);
                    let had_carrier = self.mode == Mode::OnlineCommand;
                    self.soft_reset();
                    self.mode = Mode::Command;
                    if had_carrier {
                        return (ResultCode::Ok, Some(ModemAction::Hangup));
                    }
                }
                b'&' => {
                    let Some(&sub) = body.get(i) else {
                        return (ResultCode::Error, action);
                    };
                    i += 1;

                    match sub.to_ascii_uppercase() {
                        b'F' => {
                            let _ = digit(body, &mut i);
                            let had_carrier = self.mode == Mode::OnlineCommand;
                            self.soft_reset();
                            self.mode = Mode::Command;
                            if had_carrier {
                                return (ResultCode::Ok, Some(ModemAction::Hangup));
                            }
                        }
                        b'C' => self.dcd_mode = digit(body, &mut i).unwrap_or(1),
                        b'D' => self.dtr_mode = digit(body, &mut i).unwrap_or(2),
                        b'K' => self.flow_mode = digit(body, &mut i).unwrap_or(0),
                        b'S' => self.dsr_mode = digit(body, &mut i).unwrap_or(0),
                        _ => return (ResultCode::Error, action),
                    }
                }
                b'I' => {
                    let Some(text) = identity(digit(body, &mut i).unwrap_or(0)) else {
                        return (ResultCode::Error, action);
                    };
                    out.extend_from_slice(&self.render_info(text));
                }
                b'S' => {
                    if !self.run_register_command(body, &mut i, out) {
                        return (ResultCode::Error, action);
                    }
                }
                b'D' => {
                    if self.mode == Mode::OnlineCommand {
                        // One carrier at a time.
                        return (ResultCode::Error, action);
                    }

                    let number = parse_dial_string(&body[i..]);
                    i = body.len();

                    let number = if number.eq_ignore_ascii_case("L") {
                        self.last_dialled.clone().unwrap_or_default()
                    } else {
                        number
                    };

                    if !number.is_empty() {
                        self.last_dialled = Some(number.clone());
                    }

                    debug!(%number, "Dial requested");
                    self.dialling = true;
                    action = Some(ModemAction::Dial(number));
                }
                b'A' => {
                    if self.mode == Mode::OnlineCommand {
                        return (ResultCode::Error, action);
                    }

                    // No ring line exists here; answering dials the
                    // configured server directly.
                    i = body.len();
                    debug!("Answer requested, dialling server");
                    self.dialling = true;
                    action = Some(ModemAction::Dial(String::new()));
                }
                b'O' => {
                    let _ = digit(body, &mut i);
                    if self.mode != Mode::OnlineCommand {
                        return (ResultCode::Error, action);
                    }
                    i = body.len();
                    self.mode = Mode::Online;
                    self.escape.arm();
                    action = Some(ModemAction::Resume);
                }
                b'X' | b'M' | b'L' => {
                    let value = digit(body, &mut i).unwrap_or(0);
                    match command {
                        b'M' => self.speaker_mode = value,
                        b'L' => self.speaker_volume = value,
                        _ => {} // Result code set selector, accepted.
                    }
                }
                _ => return (ResultCode::Error, action),
            }
        }

        (ResultCode::Ok, action)
    }

    /// `Sn?` and `Sn=v`. Returns false on malformed input.
    fn run_register_command(&mut self, body: &[u8], i: &mut usize, out: &mut Vec<u8>) -> bool {
        let Some(register) = number(body, i) else {
            return false;
        };
        if register > 255 {
            return false;
        }
        let register = register as usize;

        match body.get(*i) {
            Some(b'?') => {
                *i += 1;
                let value = self.registers[register];
                out.extend_from_slice(&self.render_info(&format!("{value:03}")));
                true
            }
            Some(b'=') => {
                *i += 1;
                let Some(value) = number(body, i) else {
                    return false;
                };
                if value > 255 {
                    return false;
                }
                self.registers[register] = value as u8;
                true
            }
            _ => false,
        }
    }

    fn render_result(&self, code: ResultCode) -> Vec<u8> {
        if self.quiet {
            return Vec::new();
        }

        let cr = self.registers[3];
        let lf = self.registers[4];

        if self.verbose {
            let mut bytes = vec![cr, lf];
            bytes.extend_from_slice(code.verbose().as_bytes());
            bytes.push(cr);
            bytes.push(lf);
            bytes
        } else {
            let mut bytes = code.numeric().to_string().into_bytes();
            bytes.push(cr);
            bytes
        }
    }

    /// Information text, framed like verbose responses. Not a result
    /// code, so `Q1` does not suppress it.
    fn render_info(&self, text: &str) -> Vec<u8> {
        let cr = self.registers[3];
        let lf = self.registers[4];

        let mut bytes = vec![cr, lf];
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(cr);
        bytes.push(lf);
        bytes
    }
}

fn digit(body: &[u8], i: &mut usize) -> Option<u8> {
    let byte = *body.get(*i)?;
    if byte.is_ascii_digit() {
        *i += 1;
        Some(byte - b'0')
    } else {
        None
    }
}

fn number(body: &[u8], i: &mut usize) -> Option<u32> {
    let mut value: Option<u32> = None;

    while let Some(d) = digit(body, i) {
        let next = value.unwrap_or(0).saturating_mul(10).saturating_add(u32::from(d));
        value = Some(next);
    }

    value
}

/// The dialled "number": everything after `D`, minus the dial modifier
/// and separators.
fn parse_dial_string(rest: &[u8]) -> String {
    let mut chars: Vec<u8> = rest
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'-')
        .collect();

    if let Some(first) = chars.first() {
        if matches!(first.to_ascii_uppercase(), b'T' | b'P') {
            chars.remove(0);
        }
    }

    String::from_utf8_lossy(&chars).into_owned()
}

fn identity(n: u8) -> Option<&'static str> {
    match n {
        0 => Some(concat!("Vesper PPP Bridge v", env!("CARGO_PKG_VERSION"))),
        1 => Some("Vesper Bridge ROM 2.0"),
        2 => Some("ROM checksum A5B2C3D4"),
        3 => Some("Vesper PPP Bridge - Hayes compatible"),
        4 => Some("Vesper PPP Bridge - Enhanced command set"),
        _ => None,
    }
}
