//! Typed RSP packets.
//!
//! Every supported command and reply is a variant of [`Packet`]. Commands
//! carry their type character(s) at the front of the body and parse without
//! help; replies are not self-describing, so decoding one needs a
//! [`ReplyHint`] from the caller. Serialisation is direct per variant.

use std::fmt::Write as _;
use std::str;

use crate::blob::Blob;

/// Which focused-thread slot an `H` command updates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadSubject {
    /// `Hc`: thread used by `c` and `s`.
    ContinueAndStep,
    /// `Hg`: thread used by all other thread-scoped operations.
    GeneralOps,
}

/// The stop-reply family (`S`, `W`, `X`, `O`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReply {
    Signalled { signal: u8 },
    Exited { exit_code: u8, pid: Option<u32> },
    Terminated { signal: u8, pid: Option<u32> },
    StillRunning,
}

/// Hint for decoding a reply whose body does not name its own type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplyHint {
    /// Raw hex payload: replies to `m`, `g` and `qXfer` raw reads.
    Blob,
    /// Reply to `qSupported`.
    QuerySupported,
    /// Reply to `qXfer:features:read`.
    QXfer,
    /// Reply to `qfThreadInfo` / `qsThreadInfo`.
    ThreadInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    /// The empty packet; the protocol's "command not supported" reply.
    Empty,

    // --- commands ---
    /// `?`
    GetStopReason,
    /// `c`
    Continue,
    /// `s`
    Step,
    /// `g`
    ReadRegisters,
    /// `G<hex>`
    WriteRegisters { data: Blob },
    /// `m<addr>,<len>`
    ReadMemory { addr: u64, len: usize },
    /// `M<addr>,<len>:<hex>`
    WriteMemory { addr: u64, data: Blob },
    /// `Hc<tid>` / `Hg<tid>`; `-1` means all threads, `0` any thread.
    SetCurrentThread { subject: ThreadSubject, thread_id: i64 },
    /// `qC`
    GetCurrentThread,
    /// `T<tid>`
    IsThreadAlive { thread_id: u32 },
    /// `qfThreadInfo` / `qsThreadInfo`
    GetThreadInfo { get_more: bool },
    /// `qSupported:name+;name=value;...`
    QuerySupported { features: Vec<(String, String)> },
    /// `qXfer:features:read:<annex>:<offset>,<length>`
    QXferFeaturesRead { annex: String, offset: u32, length: u32 },
    /// `qOffsets`
    GetOffsets,

    // --- replies ---
    /// `OK`
    Ok,
    /// `E<hh>`
    Error { code: u8 },
    /// `S<hh>` / `W<hh>[;process:<pid>]` / `X<hh>[;process:<pid>]` / `O`
    Stop(StopReply),
    /// `O<hex>`: console output. Received only, never synthesised here.
    ConsoleOutput { data: Blob },
    /// Bare hex payload (reply to `m`, `g`, ...).
    BlobReply { data: Blob },
    /// `PacketSize=<hex>;name+;...`
    QuerySupportedReply { features: Vec<(String, String)> },
    /// `l<body>` / `m<body>`
    QXferReply { eom: bool, body: Blob },
    /// `QC<tid>`
    CurrentThread { thread_id: u32 },
    /// `m<tid>,<tid>,...` / `l`
    ThreadInfoReply { thread_ids: Vec<u32>, eom: bool },
    /// `Text=<hex>;Data=<hex>`
    OffsetsReply { text: u64, data: u64 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Recognised type whose arguments do not parse.
    Malformed,
    /// Type prefix not recognised; answered with the empty packet.
    Unsupported,
}

impl Packet {
    /// Parses a packet body. `hint` must be supplied when `message` is a
    /// reply that does not carry a type prefix.
    pub fn parse(message: &Blob, hint: Option<ReplyHint>) -> Result<Packet, ParseError> {
        let mut message = message.clone();
        message.trim_spaces();

        if let Some(hint) = hint {
            return parse_hinted_reply(&message, hint);
        }

        if message.is_empty() {
            return Ok(Packet::Empty);
        }

        let bytes = message.to_vec();
        if bytes == b"OK" {
            return Ok(Packet::Ok);
        }
        // An 'X' body with a ',' is the binary write command, which is not
        // supported; without one it is the terminated stop reply.
        if bytes[0] == b'X' && bytes.contains(&b',') {
            return Err(ParseError::Unsupported);
        }

        match bytes[0] {
            b'?' if bytes.len() == 1 => Ok(Packet::GetStopReason),
            b'c' if bytes.len() == 1 => Ok(Packet::Continue),
            b's' if bytes.len() == 1 => Ok(Packet::Step),
            b'g' if bytes.len() == 1 => Ok(Packet::ReadRegisters),
            b'G' => {
                let data = hex_blob(&bytes[1..])?;
                Ok(Packet::WriteRegisters { data })
            }
            b'm' => parse_read_memory(&bytes[1..]),
            b'M' => parse_write_memory(&bytes[1..]),
            b'H' => parse_set_current_thread(&bytes[1..]),
            b'T' => Ok(Packet::IsThreadAlive {
                thread_id: hex_u32(&bytes[1..])?,
            }),
            b'S' => Ok(Packet::Stop(StopReply::Signalled {
                signal: hex_u8(&bytes[1..])?,
            })),
            b'W' => parse_exit_stop(&bytes[1..], false),
            b'X' => parse_exit_stop(&bytes[1..], true),
            b'O' if bytes.len() == 1 => Ok(Packet::Stop(StopReply::StillRunning)),
            b'O' => Ok(Packet::ConsoleOutput {
                data: hex_blob(&bytes[1..])?,
            }),
            b'E' => Ok(Packet::Error {
                code: hex_u8(&bytes[1..])?,
            }),
            b'Q' if bytes.starts_with(b"QC") => Ok(Packet::CurrentThread {
                thread_id: hex_u32(&bytes[2..])?,
            }),
            b'q' => parse_query(&bytes),
            _ => Err(ParseError::Unsupported),
        }
    }

    pub fn to_blob(&self) -> Blob {
        let mut out = Blob::new();
        match self {
            Packet::Empty => {}
            Packet::GetStopReason => out.push_back(b'?'),
            Packet::Continue => out.push_back(b'c'),
            Packet::Step => out.push_back(b's'),
            Packet::ReadRegisters => out.push_back(b'g'),
            Packet::WriteRegisters { data } => {
                let _ = write!(out, "G{}", data.to_hex());
            }
            Packet::ReadMemory { addr, len } => {
                let _ = write!(out, "m{addr:x},{len:x}");
            }
            Packet::WriteMemory { addr, data } => {
                let _ = write!(out, "M{addr:x},{:x}:{}", data.len(), data.to_hex());
            }
            Packet::SetCurrentThread { subject, thread_id } => {
                let prefix = match subject {
                    ThreadSubject::ContinueAndStep => "Hc",
                    ThreadSubject::GeneralOps => "Hg",
                };
                if *thread_id == -1 {
                    let _ = write!(out, "{prefix}-1");
                } else {
                    let _ = write!(out, "{prefix}{thread_id:x}");
                }
            }
            Packet::GetCurrentThread => {
                let _ = write!(out, "qC");
            }
            Packet::IsThreadAlive { thread_id } => {
                let _ = write!(out, "T{thread_id:x}");
            }
            Packet::GetThreadInfo { get_more } => {
                let _ = write!(
                    out,
                    "{}",
                    if *get_more { "qsThreadInfo" } else { "qfThreadInfo" }
                );
            }
            Packet::QuerySupported { features } => {
                let _ = write!(out, "qSupported:");
                write_features(&mut out, features);
            }
            Packet::QXferFeaturesRead {
                annex,
                offset,
                length,
            } => {
                let _ = write!(out, "qXfer:features:read:{annex}:{offset:x},{length:x}");
            }
            Packet::GetOffsets => {
                let _ = write!(out, "qOffsets");
            }
            Packet::Ok => {
                let _ = write!(out, "OK");
            }
            Packet::Error { code } => {
                let _ = write!(out, "E{code:02x}");
            }
            Packet::Stop(stop) => write_stop_reply(&mut out, stop),
            Packet::ConsoleOutput { data } => {
                let _ = write!(out, "O{}", data.to_hex());
            }
            Packet::BlobReply { data } => {
                let _ = write!(out, "{}", data.to_hex());
            }
            Packet::QuerySupportedReply { features } => write_features(&mut out, features),
            Packet::QXferReply { eom, body } => {
                out.push_back(if *eom { b'l' } else { b'm' });
                out.append(body);
            }
            Packet::CurrentThread { thread_id } => {
                let _ = write!(out, "QC{thread_id:x}");
            }
            Packet::ThreadInfoReply { thread_ids, eom } => {
                if *eom || thread_ids.is_empty() {
                    out.push_back(b'l');
                } else {
                    out.push_back(b'm');
                    for (i, tid) in thread_ids.iter().enumerate() {
                        if i != 0 {
                            out.push_back(b',');
                        }
                        let _ = write!(out, "{tid:x}");
                    }
                }
            }
            Packet::OffsetsReply { text, data } => {
                let _ = write!(out, "Text={text:x};Data={data:x}");
            }
        }
        out
    }
}

fn parse_hinted_reply(message: &Blob, hint: ReplyHint) -> Result<Packet, ParseError> {
    let bytes = message.to_vec();
    match hint {
        ReplyHint::Blob => Ok(Packet::BlobReply {
            data: hex_blob(&bytes)?,
        }),
        ReplyHint::QuerySupported => Ok(Packet::QuerySupportedReply {
            features: parse_features(&bytes)?,
        }),
        ReplyHint::QXfer => match bytes.split_first() {
            Some((&(c @ (b'l' | b'm')), body)) => Ok(Packet::QXferReply {
                eom: c == b'l',
                body: Blob::from(body),
            }),
            _ => Err(ParseError::Malformed),
        },
        ReplyHint::ThreadInfo => match bytes.split_first() {
            Some((&(c @ (b'l' | b'm')), rest)) => {
                let mut thread_ids = Vec::new();
                for token in Blob::from(rest).split(b",") {
                    thread_ids.push(hex_u32(&token.to_vec())?);
                }
                Ok(Packet::ThreadInfoReply {
                    thread_ids,
                    eom: c == b'l',
                })
            }
            _ => Err(ParseError::Malformed),
        },
    }
}

/// `<addr>,<len>`
fn parse_read_memory(args: &[u8]) -> Result<Packet, ParseError> {
    let (addr, len) = split_pair(args, b',')?;
    Ok(Packet::ReadMemory {
        addr: hex_u64(addr)?,
        len: hex_u64(len)? as usize,
    })
}

/// `<addr>,<len>:<hex>`
fn parse_write_memory(args: &[u8]) -> Result<Packet, ParseError> {
    let (addr, rest) = split_pair(args, b',')?;
    let (len, data) = split_pair(rest, b':')?;
    let data = hex_blob(data)?;
    if hex_u64(len)? as usize != data.len() {
        return Err(ParseError::Malformed);
    }
    Ok(Packet::WriteMemory {
        addr: hex_u64(addr)?,
        data,
    })
}

fn parse_set_current_thread(args: &[u8]) -> Result<Packet, ParseError> {
    let (subject, tid) = match args.split_first() {
        Some((&b'c', tid)) => (ThreadSubject::ContinueAndStep, tid),
        Some((&b'g', tid)) => (ThreadSubject::GeneralOps, tid),
        _ => return Err(ParseError::Malformed),
    };
    let thread_id = if tid == b"-1" {
        -1
    } else {
        hex_u64(tid)? as i64
    };
    Ok(Packet::SetCurrentThread { subject, thread_id })
}

/// `W` / `X` body: `<code>[;process:<pid>]`
fn parse_exit_stop(args: &[u8], terminated: bool) -> Result<Packet, ParseError> {
    let mut parts = args.splitn(2, |&b| b == b';');
    let code = hex_u8(parts.next().ok_or(ParseError::Malformed)?)?;
    let pid = match parts.next() {
        Some(rest) => {
            let (key, value) = split_pair(rest, b':')?;
            if key != b"process" {
                return Err(ParseError::Malformed);
            }
            Some(hex_u32(value)?)
        }
        None => None,
    };
    Ok(if terminated {
        Packet::Stop(StopReply::Terminated { signal: code, pid })
    } else {
        Packet::Stop(StopReply::Exited {
            exit_code: code,
            pid,
        })
    })
}

fn parse_query(bytes: &[u8]) -> Result<Packet, ParseError> {
    if bytes == b"qC" {
        return Ok(Packet::GetCurrentThread);
    }
    if bytes == b"qfThreadInfo" {
        return Ok(Packet::GetThreadInfo { get_more: false });
    }
    if bytes == b"qsThreadInfo" {
        return Ok(Packet::GetThreadInfo { get_more: true });
    }
    if bytes == b"qOffsets" {
        return Ok(Packet::GetOffsets);
    }
    if let Some(rest) = bytes.strip_prefix(b"qSupported") {
        let rest = match rest.split_first() {
            None => rest,
            Some((b':', rest)) => rest,
            Some(_) => return Err(ParseError::Unsupported),
        };
        return Ok(Packet::QuerySupported {
            features: parse_features(rest)?,
        });
    }
    if let Some(rest) = bytes.strip_prefix(b"qXfer:features:read:") {
        let mut rest = Blob::from(rest);
        let annex = rest.pop_front_until(b":");
        let offset = rest.pop_front_until(b",");
        return Ok(Packet::QXferFeaturesRead {
            annex: annex.to_text(),
            offset: hex_u32(&offset.to_vec())?,
            length: hex_u32(&rest.to_vec())?,
        });
    }
    Err(ParseError::Unsupported)
}

/// `name+;name-;name?;name=value;...`
fn parse_features(bytes: &[u8]) -> Result<Vec<(String, String)>, ParseError> {
    let mut features = Vec::new();
    for statement in Blob::from(bytes).split(b";") {
        let mut statement = statement;
        statement.trim_spaces();
        let tokens = statement.split(b"=");
        match tokens.len() {
            2 => features.push((tokens[0].to_text(), tokens[1].to_text())),
            1 => {
                let mut name = tokens[0].clone();
                match name.pop_back() {
                    Some(flag @ (b'+' | b'-' | b'?')) => {
                        features.push((name.to_text(), (flag as char).to_string()));
                    }
                    _ => return Err(ParseError::Malformed),
                }
            }
            _ => return Err(ParseError::Malformed),
        }
    }
    Ok(features)
}

fn write_features(out: &mut Blob, features: &[(String, String)]) {
    for (i, (name, value)) in features.iter().enumerate() {
        if i != 0 {
            out.push_back(b';');
        }
        let _ = match value.as_str() {
            "+" | "-" | "?" => write!(out, "{name}{value}"),
            _ => write!(out, "{name}={value}"),
        };
    }
}

fn write_stop_reply(out: &mut Blob, stop: &StopReply) {
    let _ = match stop {
        StopReply::Signalled { signal } => write!(out, "S{signal:02x}"),
        StopReply::Exited { exit_code, pid } => match pid {
            Some(pid) => write!(out, "W{exit_code:02x};process:{pid:x}"),
            None => write!(out, "W{exit_code:02x}"),
        },
        StopReply::Terminated { signal, pid } => match pid {
            Some(pid) => write!(out, "X{signal:02x};process:{pid:x}"),
            None => write!(out, "X{signal:02x}"),
        },
        StopReply::StillRunning => write!(out, "O"),
    };
}

fn split_pair(bytes: &[u8], separator: u8) -> Result<(&[u8], &[u8]), ParseError> {
    let at = bytes
        .iter()
        .position(|&b| b == separator)
        .ok_or(ParseError::Malformed)?;
    Ok((&bytes[..at], &bytes[at + 1..]))
}

fn hex_str(bytes: &[u8]) -> Result<&str, ParseError> {
    let s = str::from_utf8(bytes).map_err(|_| ParseError::Malformed)?;
    if s.is_empty() {
        return Err(ParseError::Malformed);
    }
    Ok(s)
}

fn hex_u64(bytes: &[u8]) -> Result<u64, ParseError> {
    u64::from_str_radix(hex_str(bytes)?, 16).map_err(|_| ParseError::Malformed)
}

fn hex_u32(bytes: &[u8]) -> Result<u32, ParseError> {
    u32::from_str_radix(hex_str(bytes)?, 16).map_err(|_| ParseError::Malformed)
}

fn hex_u8(bytes: &[u8]) -> Result<u8, ParseError> {
    u8::from_str_radix(hex_str(bytes)?, 16).map_err(|_| ParseError::Malformed)
}

fn hex_blob(bytes: &[u8]) -> Result<Blob, ParseError> {
    let s = str::from_utf8(bytes).map_err(|_| ParseError::Malformed)?;
    Blob::from_hex(s).ok_or(ParseError::Malformed)
}
