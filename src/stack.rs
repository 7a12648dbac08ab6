//! Call frames, local variable layout and call stubs.

use crate::memory::Memory;
use anyhow::{anyhow, bail};
use std::rc::Rc;

/// Destination types stored in a call stub.
pub mod dest {
    pub const DISCARD: u32 = 0x00;
    pub const MEMORY: u32 = 0x01;
    pub const LOCAL: u32 = 0x02;
    pub const STACK: u32 = 0x03;
    /// Resume a compressed string at bit `dest_addr` of byte `pc`.
    pub const RESUME_COMPRESSED: u32 = 0x10;
    /// Marks the end of a top-level string print.
    pub const STRING_TERMINATOR: u32 = 0x11;
    /// Resume printing a number; `pc` holds the value, `dest_addr` the digit.
    pub const RESUME_NUMBER: u32 = 0x12;
    pub const RESUME_CSTRING: u32 = 0x13;
    pub const RESUME_UNISTRING: u32 = 0x14;
}

/// How a function receives its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// 0xC0: arguments and their count are pushed on the value stack.
    Stack,
    /// 0xC1: arguments are copied into locals.
    Local,
}

/// One local variable: its width in bytes and byte position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub size: u32,
    pub pos: u32,
}

/// Parsed function header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub addr: u32,
    pub kind: FuncKind,
    /// First instruction after the header.
    pub start_pc: u32,
    /// Locals format bytes including the terminating pair, padded to 4.
    pub raw_format: Vec<u8>,
    pub slots: Vec<Slot>,
    /// Byte length of the locals area, padded to 4.
    pub locals_len: u32,
}

impl Function {
    /// Parse the function header at `addr`.
    pub fn parse(mem: &Memory, addr: u32) -> anyhow::Result<Self> {
        let kind = match mem.read1(addr)? {
            0xC0 => FuncKind::Stack,
            0xC1 => FuncKind::Local,
            0xC2..=0xDF => bail!("Call to unknown type of function (${:X}).", addr),
            _ => bail!("Call to non-function (${:X}).", addr),
        };

        let raw_start = addr + 1;
        let mut cp = raw_start;
        let mut slots = Vec::new();
        let mut locals_len = 0u32;
        loop {
            let size = mem.read1(cp)?;
            let count = mem.read1(cp + 1)?;
            cp += 2;
            if size == 0 {
                break;
            }
            match size {
                4 => locals_len = (locals_len + 3) & !3,
                2 => locals_len = (locals_len + 1) & !1,
                1 => {}
                _ => bail!("Invalid local variable size in function header ({}).", size),
            }
            for _ in 0..count {
                slots.push(Slot {
                    size,
                    pos: locals_len,
                });
                locals_len += size;
            }
        }
        locals_len = (locals_len + 3) & !3;

        let mut raw_format = mem.slice(raw_start, cp - raw_start)?.to_vec();
        while raw_format.len() % 4 != 0 {
            raw_format.push(0);
        }

        Ok(Function {
            addr,
            kind,
            start_pc: cp,
            raw_format,
            slots,
            locals_len,
        })
    }

    /// Offset of the locals from the start of a frame.
    pub fn locals_pos(&self) -> u32 {
        8 + self.raw_format.len() as u32
    }

    /// Size of the frame header and locals.
    pub fn frame_len(&self) -> u32 {
        self.locals_pos() + self.locals_len
    }
}

/// Record pushed before a call describing where its result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStub {
    pub dest_type: u32,
    pub dest_addr: u32,
    pub pc: u32,
    pub frame_start: u32,
}

/// Activation record of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub func: Rc<Function>,
    pub frame_start: u32,
    /// Local values, indexed by byte position.
    pub locals: Vec<u32>,
    pub values: Vec<u32>,
}

impl Frame {
    pub fn new(func: Rc<Function>, frame_start: u32) -> Self {
        let locals = vec![0; func.locals_len as usize];
        Frame {
            func,
            frame_start,
            locals,
            values: Vec::new(),
        }
    }

    pub fn frame_len(&self) -> u32 {
        self.func.frame_len()
    }

    /// Stack address just past this frame's value stack.
    pub fn end(&self) -> u32 {
        self.frame_start + self.frame_len() + 4 * self.values.len() as u32
    }

    pub fn push(&mut self, val: u32) {
        self.values.push(val);
    }

    pub fn pop(&mut self) -> anyhow::Result<u32> {
        self.values
            .pop()
            .ok_or_else(|| anyhow!("Stack underflow."))
    }

    /// Value `depth` positions below the top.
    pub fn peek(&self, depth: u32) -> anyhow::Result<u32> {
        let len = self.values.len();
        if depth as usize >= len {
            bail!("Stack underflow in stkpeek.");
        }
        Ok(self.values[len - 1 - depth as usize])
    }

    /// Read a local with the given operand width.
    pub fn local(&self, pos: u32, size: u32) -> anyhow::Result<u32> {
        let val = *self
            .locals
            .get(pos as usize)
            .ok_or_else(|| anyhow!("Local variable access out of range ({}).", pos))?;
        Ok(mask(val, size))
    }

    pub fn set_local(&mut self, pos: u32, size: u32, val: u32) -> anyhow::Result<()> {
        let slot = self
            .locals
            .get_mut(pos as usize)
            .ok_or_else(|| anyhow!("Local variable access out of range ({}).", pos))?;
        *slot = mask(val, size);
        Ok(())
    }

    /// Copy call arguments into locals according to the layout.
    /// Extra arguments are dropped.
    pub fn fill_locals(&mut self, args: &[u32]) {
        for (slot, &arg) in self.func.slots.iter().zip(args) {
            self.locals[slot.pos as usize] = mask(arg, slot.size);
        }
    }

    pub fn push_stub(&mut self, dest_type: u32, dest_addr: u32, pc: u32) {
        let frame_start = self.frame_start;
        self.values
            .extend_from_slice(&[dest_type, dest_addr, pc, frame_start]);
    }

    /// Pop a call stub, checking it belongs to this frame.
    pub fn pop_stub(&mut self) -> anyhow::Result<CallStub> {
        if self.values.len() < 4 {
            bail!("Stack underflow while popping a call stub.");
        }
        let frame_start = self.pop()?;
        if frame_start != self.frame_start {
            bail!(
                "Call stub frameptr ({}) does not match frame ({}).",
                frame_start,
                self.frame_start
            );
        }
        let pc = self.pop()?;
        let dest_addr = self.pop()?;
        let dest_type = self.pop()?;
        Ok(CallStub {
            dest_type,
            dest_addr,
            pc,
            frame_start,
        })
    }
}

fn mask(val: u32, size: u32) -> u32 {
    match size {
        1 => val & 0xFF,
        2 => val & 0xFFFF,
        _ => val,
    }
}

/// The call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stack {
    pub frames: Vec<Frame>,
}

impl Stack {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Push a frame for `func` directly above the current one.
    pub fn enter(&mut self, func: Rc<Function>) -> &mut Frame {
        let frame_start = self.frames.last().map_or(0, Frame::end);
        self.frames.push(Frame::new(func, frame_start));
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Pop the current frame. Returns false when no frame is left.
    pub fn leave(&mut self) -> bool {
        self.frames.pop();
        !self.frames.is_empty()
    }

    pub fn current(&self) -> anyhow::Result<&Frame> {
        self.frames.last().ok_or_else(|| anyhow!("No active stack frame."))
    }

    pub fn current_mut(&mut self) -> anyhow::Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| anyhow!("No active stack frame."))
    }

    /// Unwind to the stack address `val`, as recorded by `catch`.
    pub fn unwind_to(&mut self, val: u32) -> anyhow::Result<()> {
        while self.frames.last().map_or(false, |f| f.frame_start > val) {
            self.frames.pop();
        }
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| anyhow!("Stack evaporated during throw."))?;

        let base = frame.frame_start + frame.frame_len();
        if val < base {
            bail!("Attempted to throw below the frame value stack.");
        }
        let offset = val - base;
        if offset & 3 != 0 {
            bail!("Attempted to throw to an unaligned address.");
        }
        let len = (offset >> 2) as usize;
        if len > frame.values.len() {
            bail!("Attempted to throw beyond the frame value stack.");
        }
        frame.values.truncate(len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::image;

    fn function(header: &[u8]) -> Function {
        let extra: Vec<(usize, u8)> = header
            .iter()
            .enumerate()
            .map(|(ix, &b)| (0x40 + ix, b))
            .collect();
        let mem = Memory::load(image(&extra)).unwrap();
        Function::parse(&mem, 0x40).unwrap()
    }

    #[test]
    fn locals_layout() {
        let func = function(&[0xC1, 1, 1, 4, 2, 2, 1, 0, 0]);
        assert_eq!(func.kind, FuncKind::Local);
        assert_eq!(func.start_pc, 0x49);
        assert_eq!(func.raw_format, vec![1, 1, 4, 2, 2, 1, 0, 0]);
        assert_eq!(
            func.slots,
            vec![
                Slot { size: 1, pos: 0 },
                Slot { size: 4, pos: 4 },
                Slot { size: 4, pos: 8 },
                Slot { size: 2, pos: 12 },
            ]
        );
        assert_eq!(func.locals_len, 16);
        assert_eq!(func.frame_len(), 8 + 8 + 16);
    }

    #[test]
    fn raw_format_is_padded() {
        let func = function(&[0xC0, 4, 1, 0, 0]);
        assert_eq!(func.kind, FuncKind::Stack);
        assert_eq!(func.raw_format, vec![4, 1, 0, 0]);
        let func = function(&[0xC0, 0, 0]);
        assert_eq!(func.raw_format, vec![0, 0, 0, 0]);
        assert_eq!(func.locals_len, 0);
    }

    #[test]
    fn bad_headers() {
        let mem = Memory::load(image(&[(0x40, 0xC5), (0x50, 0x12), (0x60, 0xC1), (0x61, 3), (0x62, 1)])).unwrap();
        let err = Function::parse(&mem, 0x40).unwrap_err();
        assert!(err.to_string().contains("unknown type"));
        let err = Function::parse(&mem, 0x50).unwrap_err();
        assert!(err.to_string().contains("non-function"));
        assert!(Function::parse(&mem, 0x60).is_err());
    }

    #[test]
    fn frames_and_stubs() {
        let func = Rc::new(function(&[0xC1, 4, 2, 1, 1, 0, 0]));
        let mut stack = Stack::default();

        let frame = stack.enter(func.clone());
        frame.fill_locals(&[7, 8, 0x1FF, 99]);
        assert_eq!(frame.local(0, 4).unwrap(), 7);
        assert_eq!(frame.local(4, 4).unwrap(), 8);
        assert_eq!(frame.local(8, 4).unwrap(), 0xFF);
        frame.push(5);
        frame.push_stub(dest::LOCAL, 4, 0x1234);
        let end = frame.end();

        let callee = stack.enter(func);
        assert_eq!(callee.frame_start, end);

        assert!(stack.leave());
        let stub = stack.current_mut().unwrap().pop_stub().unwrap();
        assert_eq!(stub.dest_type, dest::LOCAL);
        assert_eq!(stub.dest_addr, 4);
        assert_eq!(stub.pc, 0x1234);
        assert!(!stack.leave());
    }

    #[test]
    fn mismatched_stub_is_fatal() {
        let func = Rc::new(function(&[0xC0, 0, 0]));
        let mut stack = Stack::default();
        let frame = stack.enter(func);
        frame.values.extend_from_slice(&[0, 0, 0, 44]);
        assert!(frame.pop_stub().is_err());
    }

    #[test]
    fn unwind() {
        let func = Rc::new(function(&[0xC0, 0, 0]));
        let mut stack = Stack::default();
        let frame = stack.enter(func.clone());
        frame.push(1);
        frame.push(2);
        let token = frame.frame_start + frame.frame_len() + 4;
        frame.push(3);
        stack.enter(func);
        stack.unwind_to(token).unwrap();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current().unwrap().values, vec![1]);
        assert!(stack.unwind_to(token + 2).is_err());
        assert!(stack.unwind_to(token + 64).is_err());
    }
}
