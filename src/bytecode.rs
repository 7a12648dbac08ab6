//! Instruction decoding and the cache of decoded paths.

use crate::{host::IoSys, memory::Memory, opcode::Op, vm::Statistics};
use anyhow::{anyhow, bail};
use log::debug;
use std::{
    collections::{HashMap, HashSet},
    rc::Rc,
};

/// A decoded operand.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Operand {
    /// Immediate value, already sign-extended.
    Const(u32),
    /// Pop when loading, push when storing.
    Stack,
    /// Store mode 0.
    Discard,
    /// Local variable at a byte position.
    Local(u32),
    /// Absolute memory address.
    Mem(u32),
}

/// One decoded instruction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub addr: u32,
    /// Address of the following instruction.
    pub next: u32,
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// Target of a branch with a constant offset, if it leaves the
    /// current function normally.
    pub fn branch_target(&self) -> Option<u32> {
        if self.op == Op::JumpAbs {
            return match self.operands.first() {
                Some(Operand::Const(addr)) => Some(*addr),
                _ => None,
            };
        }
        if !self.op.is_branch() {
            return None;
        }
        match self.operands.last() {
            Some(Operand::Const(0 | 1)) => None,
            Some(Operand::Const(offset)) => Some(self.next.wrapping_add(*offset).wrapping_sub(2)),
            _ => None,
        }
    }
}

/// Read the opcode number at `addr`. Returns the opcode and its width.
fn read_opcode(mem: &Memory, addr: u32) -> anyhow::Result<(u32, u32)> {
    let first = mem.read1(addr)?;
    if first & 0x80 == 0 {
        Ok((first, 1))
    } else if first & 0x40 == 0 {
        Ok((mem.read2(addr)? & 0x7FFF, 2))
    } else {
        Ok((mem.read4(addr)? & 0x3FFF_FFFF, 4))
    }
}

/// Decode the instruction at `addr`.
pub fn decode(mem: &Memory, addr: u32) -> anyhow::Result<Instruction> {
    let (code, width) = read_opcode(mem, addr)?;
    let op = Op::from_code(code).ok_or_else(|| anyhow!("Encountered unknown opcode {:#x} at ${:X}.", code, addr))?;
    let forms = op.forms();

    let mut mode_addr = addr + width;
    let mut cp = mode_addr + (forms.len() as u32 + 1) / 2;
    let mut operands = Vec::with_capacity(forms.len());
    let mut modes = 0;

    for (ix, form) in forms.iter().enumerate() {
        let mode = if ix & 1 == 0 {
            modes = mem.read1(mode_addr)?;
            modes & 0x0F
        } else {
            mode_addr += 1;
            (modes >> 4) & 0x0F
        };

        let operand = match (form, mode) {
            (b'L', 0) => Operand::Const(0),
            (b'L', 1) => {
                cp += 1;
                Operand::Const(mem.read1(cp - 1)? as u8 as i8 as i32 as u32)
            }
            (b'L', 2) => {
                cp += 2;
                Operand::Const(mem.read2(cp - 2)? as u16 as i16 as i32 as u32)
            }
            (b'L', 3) => {
                cp += 4;
                Operand::Const(mem.read4(cp - 4)?)
            }
            (b'L', 8) => Operand::Stack,
            (b'S' | b'C', 0) => Operand::Discard,
            (b'S' | b'C', 8) => Operand::Stack,
            (b'S' | b'C', 1..=3) => bail!("Constant used as a store operand at ${:X}.", addr),
            (_, 5..=7 | 9..=11 | 13..=15) => {
                let (value, len) = match mode & 3 {
                    1 => (mem.read1(cp)?, 1),
                    2 => (mem.read2(cp)?, 2),
                    _ => (mem.read4(cp)?, 4),
                };
                cp += len;
                match mode {
                    5..=7 => Operand::Mem(value),
                    9..=11 => Operand::Local(value),
                    _ => Operand::Mem(value.wrapping_add(mem.ram_start())),
                }
            }
            _ => bail!("Unknown addressing mode {} at ${:X}.", mode, addr),
        };
        operands.push(operand);
    }

    Ok(Instruction {
        op,
        addr,
        next: cp,
        operands,
    })
}

/// A straight-line run of instructions decoded for one output mode.
#[derive(Debug)]
pub struct Path {
    pub start: u32,
    pub iosys: IoSys,
    pub instructions: Vec<Instruction>,
}

impl Path {
    /// Decode from `start` until control flow leaves the run.
    pub fn compile(
        mem: &Memory,
        start: u32,
        iosys: IoSys,
        jump_targets: &mut HashSet<u32>,
    ) -> anyhow::Result<Self> {
        let in_rom = start < mem.ram_start();
        let mut instructions = Vec::new();
        let mut cp = start;

        loop {
            let instr = match decode(mem, cp) {
                Ok(instr) => instr,
                // Data past a conditional branch; fail only if it is reached.
                Err(_) if !instructions.is_empty() => break,
                Err(err) => return Err(err),
            };
            if let Some(target) = instr.branch_target() {
                jump_targets.insert(target);
            }
            let ends = instr.op.ends_path() || (iosys == IoSys::Filter && instr.op.is_filtered_output());
            cp = instr.next;
            instructions.push(instr);

            if ends || jump_targets.contains(&cp) || (in_rom && cp >= mem.ram_start()) {
                break;
            }
        }

        Ok(Path {
            start,
            iosys,
            instructions,
        })
    }
}

/// Decoded paths keyed by start address and output mode. Only paths that
/// start in ROM are kept.
#[derive(Debug, Default)]
pub struct PathCache {
    paths: HashMap<(u32, IoSys), Rc<Path>>,
    jump_targets: HashSet<u32>,
    enabled: bool,
}

impl PathCache {
    pub fn new(enabled: bool) -> Self {
        PathCache {
            enabled,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Return the path at `pc`, decoding it when not cached.
    pub fn fetch(
        &mut self,
        mem: &Memory,
        pc: u32,
        iosys: IoSys,
        stats: &mut Statistics,
    ) -> anyhow::Result<Rc<Path>> {
        stats.total_path_calls += 1;
        if let Some(path) = self.paths.get(&(pc, iosys)) {
            return Ok(path.clone());
        }

        let path = Rc::new(Path::compile(mem, pc, iosys, &mut self.jump_targets)?);
        stats.paths_compiled += 1;
        debug!(
            "compiled path at ${:X} ({:?}, {} instructions)",
            pc,
            iosys,
            path.instructions.len()
        );
        if self.enabled && pc < mem.ram_start() {
            self.paths.insert((pc, iosys), path.clone());
            stats.paths_cached += 1;
        }
        Ok(path)
    }
}
