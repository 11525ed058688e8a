//! Request-processor seam between the runtime core and wire protocols.
//!
//! The core hands a processor the raw read buffer and a write buffer; it
//! never inspects payload bytes beyond counts and offsets. A processor owns
//! whatever parse state a connection needs, so each connection gets its own
//! instance from a `ProcessorFactory`.
//!
//! Two trivial built-ins prove the seam is swappable: a line echo (response
//! carried as the externally-owned payload span) and a ping responder
//! (response written as header bytes).

use crate::runtime::IoBuffer;
use bytes::Bytes;

/// Outcome of feeding buffered input to a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    /// Request still incomplete; wait for more bytes.
    NeedMore,
    /// A full request was parsed; `serialize` will produce the response.
    Ready,
    /// Input violates the protocol; `serialize` produces an error response
    /// and the connection will not be kept alive.
    Malformed,
}

/// A serialized response: header bytes land in the connection's write
/// buffer, the optional payload is an externally-owned span the core writes
/// with vectored I/O.
pub struct Response {
    pub keep_alive: bool,
    pub payload: Option<Bytes>,
}

/// Per-connection protocol state machine.
pub trait Processor: Send {
    /// Consume as much of `input` as possible. Consumed bytes must be
    /// retrieved from the buffer; unconsumed bytes stay for the next call.
    fn consume(&mut self, input: &mut IoBuffer) -> Consume;

    /// Serialize the response for the last `Ready` or `Malformed` outcome.
    fn serialize(&mut self, output: &mut IoBuffer) -> Response;
}

/// Creates one `Processor` per accepted connection.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Processor>;
}

/// Selected wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Echo,
    Ping,
}

/// Factory for the built-in processors.
pub struct BuiltinFactory {
    protocol: ProtocolType,
}

impl BuiltinFactory {
    pub fn new(protocol: ProtocolType) -> Self {
        Self { protocol }
    }
}

impl ProcessorFactory for BuiltinFactory {
    fn create(&self) -> Box<dyn Processor> {
        match self.protocol {
            ProtocolType::Echo => Box::new(EchoProcessor::new()),
            ProtocolType::Ping => Box::new(PingProcessor::new()),
        }
    }
}

/// Longest line the echo processor accepts.
const MAX_LINE: usize = 1024 * 1024;

/// Echoes each newline-terminated line back verbatim.
pub struct EchoProcessor {
    pending: Option<Bytes>,
    malformed: bool,
}

impl EchoProcessor {
    pub fn new() -> Self {
        Self {
            pending: None,
            malformed: false,
        }
    }
}

impl Default for EchoProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for EchoProcessor {
    fn consume(&mut self, input: &mut IoBuffer) -> Consume {
        match input.peek().iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let line = Bytes::copy_from_slice(&input.peek()[..=pos]);
                input.retrieve(pos + 1);
                self.pending = Some(line);
                Consume::Ready
            }
            None if input.readable() > MAX_LINE => {
                self.malformed = true;
                Consume::Malformed
            }
            None => Consume::NeedMore,
        }
    }

    fn serialize(&mut self, output: &mut IoBuffer) -> Response {
        if self.malformed {
            output.append(b"ERR line too long\n");
            return Response {
                keep_alive: false,
                payload: None,
            };
        }
        Response {
            keep_alive: true,
            payload: self.pending.take(),
        }
    }
}

/// Answers `PING` lines with `PONG`.
pub struct PingProcessor {
    malformed: bool,
}

impl PingProcessor {
    pub fn new() -> Self {
        Self { malformed: false }
    }
}

impl Default for PingProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for PingProcessor {
    fn consume(&mut self, input: &mut IoBuffer) -> Consume {
        match input.peek().iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut end = pos;
                if end > 0 && input.peek()[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = input.peek()[..end].to_vec();
                input.retrieve(pos + 1);
                if line == b"PING" {
                    Consume::Ready
                } else {
                    self.malformed = true;
                    Consume::Malformed
                }
            }
            None => Consume::NeedMore,
        }
    }

    fn serialize(&mut self, output: &mut IoBuffer) -> Response {
        if self.malformed {
            output.append(b"ERR expected PING\r\n");
            return Response {
                keep_alive: false,
                payload: None,
            };
        }
        output.append(b"PONG\r\n");
        Response {
            keep_alive: true,
            payload: None,
        }
    }
}
