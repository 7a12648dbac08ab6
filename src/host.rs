//! The output/input collaborator the engine calls into.

use crate::memory::Memory;
use std::collections::{HashMap, HashSet};

/// Where printed output goes.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq)]
pub enum IoSys {
    /// Output is discarded.
    #[default]
    Null,
    /// Every character is passed to a program function.
    Filter,
    /// Output is sent to the host.
    Glk,
}

impl IoSys {
    /// Mode for an `setiosys` number. Unknown modes behave as null.
    pub fn from_mode(mode: u32) -> Self {
        match mode {
            1 => IoSys::Filter,
            2 => IoSys::Glk,
            _ => IoSys::Null,
        }
    }

    pub fn mode(self) -> u32 {
        match self {
            IoSys::Null => 0,
            IoSys::Filter => 1,
            IoSys::Glk => 2,
        }
    }
}

/// Result of a capability call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GlkResult {
    Value(u32),
    /// The call is waiting for external input. The engine suspends until
    /// [`crate::vm::Vm::resume`] delivers the result.
    DidNotReturn,
}

/// Host services used by the engine.
pub trait Glk {
    fn put_char(&mut self, ch: u8);

    fn put_char_uni(&mut self, ch: u32);

    fn put_string(&mut self, text: &str);

    /// Dispatch the capability `selector`. The arguments are in call order.
    fn call(&mut self, mem: &mut Memory, selector: u32, args: &[u32]) -> anyhow::Result<GlkResult>;

    /// Selectors that may block waiting for input.
    fn may_not_return(&self, _selector: u32) -> bool {
        false
    }

    /// Write a save file to `stream`. Returns false when the stream is
    /// unusable.
    fn write_save(&mut self, _stream: u32, _data: &[u8]) -> bool {
        false
    }

    fn read_save(&mut self, _stream: u32) -> Option<Vec<u8>> {
        None
    }

    /// Called once when execution stops on a fatal error.
    fn fatal_error(&mut self, _msg: &str) {}

    /// Called when the program quits or returns from its start function.
    fn exit(&mut self) {}
}

/// Host that records everything in memory.
#[derive(Debug, Default)]
pub struct BufferHost {
    pub output: String,
    /// Capability calls made so far, with their arguments.
    pub calls: Vec<(u32, Vec<u32>)>,
    /// Selectors that suspend the engine.
    pub blocking: HashSet<u32>,
    pub streams: HashMap<u32, Vec<u8>>,
    pub errors: Vec<String>,
    pub exited: bool,
}

impl Glk for BufferHost {
    fn put_char(&mut self, ch: u8) {
        self.output.push(ch as char);
    }

    fn put_char_uni(&mut self, ch: u32) {
        self.output
            .push(char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER));
    }

    fn put_string(&mut self, text: &str) {
        self.output.push_str(text);
    }

    fn call(&mut self, _mem: &mut Memory, selector: u32, args: &[u32]) -> anyhow::Result<GlkResult> {
        self.calls.push((selector, args.to_vec()));
        if self.blocking.contains(&selector) {
            Ok(GlkResult::DidNotReturn)
        } else {
            Ok(GlkResult::Value(0))
        }
    }

    fn may_not_return(&self, selector: u32) -> bool {
        self.blocking.contains(&selector)
    }

    fn write_save(&mut self, stream: u32, data: &[u8]) -> bool {
        if stream == 0 {
            return false;
        }
        self.streams.insert(stream, data.to_vec());
        true
    }

    fn read_save(&mut self, stream: u32) -> Option<Vec<u8>> {
        self.streams.get(&stream).cloned()
    }

    fn fatal_error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }

    fn exit(&mut self) {
        self.exited = true;
    }
}
