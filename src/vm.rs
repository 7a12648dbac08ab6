//! Virtual machine that runs program images

use crate::{
    accel::{Accel, AccelFunc},
    bytecode::{Instruction, Operand, PathCache},
    float,
    heap::Heap,
    host::{Glk, GlkResult, IoSys},
    memory::Memory,
    opcode::Op,
    random::Random,
    search,
    stack::{dest, FuncKind, Function, Stack},
    strings::{Action, Step, StringTables},
};
use anyhow::{anyhow, bail};
use log::{debug, error, info};
use std::{
    collections::{HashMap, VecDeque},
    rc::Rc,
};

/// Glulx 3.1.2
const GLULX_VERSION: u32 = 0x0003_0102;
const TERP_VERSION: u32 = 0x0001_0101;

/// Execution state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Loaded, start function not entered yet.
    Ready,
    Running,
    /// Waiting for [`Vm::resume`].
    Suspended,
    Finished,
    /// Stopped on a fatal error.
    Failed,
}

#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum number of undo snapshots kept.
    pub undo_depth: usize,
    pub cache_paths: bool,
    pub cache_strings: bool,
    /// Check heap consistency after every allocation change.
    pub check_heap: bool,
    /// Start with a seeded random source instead of the native one.
    pub random_seed: Option<u32>,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            undo_depth: 10,
            cache_paths: true,
            cache_strings: true,
            check_heap: cfg!(debug_assertions),
            random_seed: None,
        }
    }
}

/// Counters kept while running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_function_calls: u64,
    pub accel_function_calls: u64,
    pub total_path_calls: u64,
    pub paths_cached: u64,
    pub paths_compiled: u64,
    pub strings_cached: u64,
    pub strings_compiled: u64,
}

/// What the dispatch loop does after an instruction.
pub(crate) enum Flow {
    /// Continue with the next instruction of the path.
    Next,
    /// `pc` was changed; fetch a new path.
    Jump,
    /// Execution stopped or suspended.
    Stop,
}

/// State kept by `saveundo`.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) ram: Vec<u8>,
    pub(crate) pc: u32,
    pub(crate) stack: Stack,
    pub(crate) heap: Heap,
}

/// Virtual machine representation
pub struct Vm<H: Glk> {
    pub(crate) memory: Memory,
    pub(crate) heap: Heap,
    pub(crate) stack: Stack,
    pub(crate) pc: u32,
    pub(crate) iosys: IoSys,
    iosys_rock: u32,
    strings: StringTables,
    paths: PathCache,
    functions: HashMap<u32, Rc<Function>>,
    accel: Accel,
    random: Random,
    pub(crate) undo: VecDeque<Snapshot>,
    resume_dest: Option<Operand>,
    status: Status,
    pub(crate) options: VmOptions,
    stats: Statistics,
    pub(crate) host: H,
}

impl<H: Glk> Vm<H> {
    pub fn load(image: Vec<u8>, host: H) -> anyhow::Result<Self> {
        Self::with_options(image, host, VmOptions::default())
    }

    pub fn with_options(image: Vec<u8>, host: H, options: VmOptions) -> anyhow::Result<Self> {
        let memory = Memory::load(image)?;
        debug!(
            "loaded image: ram ${:X}, end ${:X}",
            memory.ram_start(),
            memory.end_mem()
        );

        Ok(Vm {
            memory,
            heap: Heap::default(),
            stack: Stack::default(),
            pc: 0,
            iosys: IoSys::Null,
            iosys_rock: 0,
            strings: StringTables::new(options.cache_strings),
            paths: PathCache::new(options.cache_paths),
            functions: HashMap::new(),
            accel: Accel::default(),
            random: Random::new(options.random_seed.unwrap_or(0)),
            undo: VecDeque::new(),
            resume_dest: None,
            status: Status::Ready,
            options,
            stats: Statistics::default(),
            host,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    /// Number of undo snapshots held.
    pub fn undo_count(&self) -> usize {
        self.undo.len()
    }

    /// Hex fingerprint of the image, for keying save files.
    pub fn signature(&self) -> String {
        self.memory.signature()
    }

    /// Enter the start function and run.
    pub fn start(&mut self) -> anyhow::Result<Status> {
        if self.status != Status::Ready {
            return Err(anyhow!("Program is already started."));
        }
        info!("starting image {}", &self.signature()[..16]);
        self.status = Status::Running;
        self.guard(Self::restart)?;
        self.run()
    }

    /// Run until the program ends or suspends.
    pub fn run(&mut self) -> anyhow::Result<Status> {
        match self.status {
            Status::Ready => return self.start(),
            Status::Finished | Status::Failed => return Err(anyhow!("Program is already ended.")),
            Status::Suspended => bail!("Execution is suspended until a result is delivered."),
            Status::Running => {}
        }

        self.guard(Self::execute_loop)?;
        Ok(self.status)
    }

    /// Deliver the result of a suspended capability call and continue.
    pub fn resume(&mut self, value: u32) -> anyhow::Result<Status> {
        match self.status {
            Status::Suspended => {}
            Status::Finished | Status::Failed => return Err(anyhow!("Program is already ended.")),
            _ => bail!("Execution is not waiting for a result."),
        }

        let dest = self.resume_dest.take().unwrap_or(Operand::Discard);
        self.status = Status::Running;
        self.guard(|vm| vm.store(dest, value))?;
        self.run()
    }

    /// Run `f`, turning an error into a fatal stop.
    fn guard<T>(&mut self, f: impl FnOnce(&mut Self) -> anyhow::Result<T>) -> anyhow::Result<T> {
        f(self).map_err(|err| {
            let msg = err.to_string();
            error!("fatal error at ${:X}: {}", self.pc, msg);
            self.status = Status::Failed;
            self.host.fatal_error(&msg);
            err
        })
    }

    fn finish(&mut self, reason: &str) -> Flow {
        info!("{}", reason);
        self.status = Status::Finished;
        self.host.exit();
        Flow::Stop
    }

    fn execute_loop(&mut self) -> anyhow::Result<()> {
        while self.status == Status::Running {
            let path = self
                .paths
                .fetch(&self.memory, self.pc, self.iosys, &mut self.stats)?;
            for instr in &path.instructions {
                self.pc = instr.next;
                match self.execute(instr)? {
                    Flow::Next => continue,
                    Flow::Jump | Flow::Stop => break,
                }
            }
        }
        Ok(())
    }

    /// Rebuild memory from the image and enter the start function.
    pub(crate) fn restart(&mut self) -> anyhow::Result<()> {
        info!("entering start function ${:X}", self.memory.header().start_func);
        self.heap.clear();
        let protected = self.memory.copy_protected();
        self.memory.reset();
        self.memory.paste_protected(protected);

        self.stack.clear();
        self.pc = 0;
        self.iosys = IoSys::Null;
        self.iosys_rock = 0;
        let header = *self.memory.header();
        self.strings.set_table(&self.memory, header.string_table)?;
        self.enter_function(header.start_func, &[])
    }

    fn execute(&mut self, instr: &Instruction) -> anyhow::Result<Flow> {
        let ops = &instr.operands[..];
        match instr.op {
            Op::Nop => Ok(Flow::Next),

            Op::Add => self.arith(ops, |a, b| Ok(a.wrapping_add(b))),
            Op::Sub => self.arith(ops, |a, b| Ok(a.wrapping_sub(b))),
            Op::Mul => self.arith(ops, |a, b| Ok(a.wrapping_mul(b))),
            Op::Div => self.arith(ops, |a, b| {
                if b == 0 {
                    bail!("Division by zero.");
                }
                Ok((a as i32).wrapping_div(b as i32) as u32)
            }),
            Op::Mod => self.arith(ops, |a, b| {
                if b == 0 {
                    bail!("Division by zero doing remainder.");
                }
                Ok((a as i32).wrapping_rem(b as i32) as u32)
            }),
            Op::Neg => self.unary(ops, u32::wrapping_neg),
            Op::BitAnd => self.arith(ops, |a, b| Ok(a & b)),
            Op::BitOr => self.arith(ops, |a, b| Ok(a | b)),
            Op::BitXor => self.arith(ops, |a, b| Ok(a ^ b)),
            Op::BitNot => self.unary(ops, |a| !a),
            Op::ShiftL => self.arith(ops, |a, b| Ok(if b >= 32 { 0 } else { a << b })),
            Op::UShiftR => self.arith(ops, |a, b| Ok(if b >= 32 { 0 } else { a >> b })),
            Op::SShiftR => self.arith(ops, |a, b| {
                let b = b.min(31);
                Ok(((a as i32) >> b) as u32)
            }),

            Op::Jump => {
                let [offset] = self.loads(ops)?;
                self.branch(offset)
            }
            Op::JumpAbs => {
                let [addr] = self.loads(ops)?;
                self.pc = addr;
                Ok(Flow::Jump)
            }
            Op::Jz => self.test1(ops, |a| a == 0),
            Op::Jnz => self.test1(ops, |a| a != 0),
            Op::Jeq => self.test2(ops, |a, b| a == b),
            Op::Jne => self.test2(ops, |a, b| a != b),
            Op::Jlt => self.test2(ops, |a, b| (a as i32) < (b as i32)),
            Op::Jge => self.test2(ops, |a, b| (a as i32) >= (b as i32)),
            Op::Jgt => self.test2(ops, |a, b| (a as i32) > (b as i32)),
            Op::Jle => self.test2(ops, |a, b| (a as i32) <= (b as i32)),
            Op::Jltu => self.test2(ops, |a, b| a < b),
            Op::Jgeu => self.test2(ops, |a, b| a >= b),
            Op::Jgtu => self.test2(ops, |a, b| a > b),
            Op::Jleu => self.test2(ops, |a, b| a <= b),

            Op::Call => {
                let [addr, argc] = self.loads(ops)?;
                let args = self.pop_args(argc)?;
                self.push_callstub(ops[2])?;
                self.enter_function(addr, &args)?;
                Ok(Flow::Jump)
            }
            Op::CallF | Op::CallFI | Op::CallFII | Op::CallFIII => {
                let (store, loads) = ops.split_last().ok_or_else(|| anyhow!("Missing operand."))?;
                let mut vals = Vec::with_capacity(loads.len());
                for op in loads {
                    vals.push(self.load_op(*op)?);
                }
                self.push_callstub(*store)?;
                self.enter_function(vals[0], &vals[1..])?;
                Ok(Flow::Jump)
            }
            Op::Return => {
                let [val] = self.loads(ops)?;
                self.return_value(val)
            }
            Op::TailCall => {
                let [addr, argc] = self.loads(ops)?;
                let args = self.pop_args(argc)?;
                if !self.stack.leave() {
                    if let Some(func) = self.accel.lookup(addr) {
                        // No caller left to take the result.
                        self.stats.total_function_calls += 1;
                        self.call_accel(func, &args)?;
                        return Ok(self.finish("top-level function returned"));
                    }
                }
                self.enter_function(addr, &args)?;
                Ok(Flow::Jump)
            }
            Op::Catch => {
                self.push_callstub(ops[0])?;
                let token = self.stack.current()?.end();
                self.store(ops[0], token)?;
                let offset = self.load_op(ops[1])?;
                self.branch(offset)
            }
            Op::Throw => {
                let [val, token] = self.loads(ops)?;
                self.stack.unwind_to(token)?;
                self.pop_callstub(val)?;
                Ok(Flow::Jump)
            }

            Op::Copy => {
                let val = self.load_op(ops[0])?;
                self.store(ops[1], val)?;
                Ok(Flow::Next)
            }
            Op::CopyS | Op::CopyB => {
                let size = instr.op.arg_size();
                let val = self.load_sized(ops[0], size)?;
                self.store_sized(ops[1], size, val)?;
                Ok(Flow::Next)
            }
            Op::Sexs => self.unary(ops, |a| a as u16 as i16 as i32 as u32),
            Op::Sexb => self.unary(ops, |a| a as u8 as i8 as i32 as u32),

            Op::ALoad => self.mem_load(ops, 4),
            Op::ALoadS => self.mem_load(ops, 2),
            Op::ALoadB => self.mem_load(ops, 1),
            Op::ALoadBit => {
                let [addr, bit] = self.loads(ops)?;
                let (addr, bit) = bit_address(addr, bit);
                let val = (self.memory.read1(addr)? >> bit) & 1;
                self.store(ops[2], val)?;
                Ok(Flow::Next)
            }
            Op::AStore => self.mem_store(ops, 4),
            Op::AStoreS => self.mem_store(ops, 2),
            Op::AStoreB => self.mem_store(ops, 1),
            Op::AStoreBit => {
                let [addr, bit, val] = self.loads(ops)?;
                let (addr, bit) = bit_address(addr, bit);
                let byte = self.memory.read1(addr)?;
                let byte = if val != 0 {
                    byte | (1 << bit)
                } else {
                    byte & !(1 << bit)
                };
                self.memory.write1(addr, byte)?;
                Ok(Flow::Next)
            }

            Op::StkCount => {
                let count = self.stack.current()?.values.len() as u32;
                self.store(ops[0], count)?;
                Ok(Flow::Next)
            }
            Op::StkPeek => {
                let [depth] = self.loads(ops)?;
                let val = self.stack.current()?.peek(depth)?;
                self.store(ops[1], val)?;
                Ok(Flow::Next)
            }
            Op::StkSwap => {
                let frame = self.stack.current_mut()?;
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
                Ok(Flow::Next)
            }
            Op::StkRoll => {
                let [count, shift] = self.loads(ops)?;
                self.roll(count as i32, shift as i32)?;
                Ok(Flow::Next)
            }
            Op::StkCopy => {
                let [count] = self.loads(ops)?;
                let frame = self.stack.current_mut()?;
                let len = frame.values.len();
                if count as usize > len {
                    bail!("Stack underflow in stkcopy.");
                }
                frame.values.extend_from_within(len - count as usize..);
                Ok(Flow::Next)
            }

            Op::StreamChar | Op::StreamUniChar => {
                let [ch] = self.loads(ops)?;
                self.stream_char(ch, instr.op == Op::StreamUniChar)
            }
            Op::StreamNum => {
                let [val] = self.loads(ops)?;
                Ok(if self.stream_num(val, false, 0)? {
                    Flow::Jump
                } else {
                    Flow::Next
                })
            }
            Op::StreamStr => {
                let [addr] = self.loads(ops)?;
                self.stream_string(addr, 0, 0)?;
                Ok(Flow::Jump)
            }

            Op::Gestalt => {
                let [sel, arg] = self.loads(ops)?;
                let val = self.gestalt(sel, arg);
                self.store(ops[2], val)?;
                Ok(Flow::Next)
            }
            Op::DebugTrap => {
                let [val] = self.loads(ops)?;
                bail!("User debugtrap encountered ({:#x}).", val)
            }
            Op::GetMemSize => {
                let size = self.memory.end_mem();
                self.store(ops[0], size)?;
                Ok(Flow::Next)
            }
            Op::SetMemSize => {
                let [size] = self.loads(ops)?;
                if self.heap.is_active() {
                    bail!("Cannot resize memory space while heap is active.");
                }
                self.memory.resize(size)?;
                self.store(ops[1], 0)?;
                Ok(Flow::Next)
            }

            Op::Random => {
                let [range] = self.loads(ops)?;
                let val = self.random.range(range);
                self.store(ops[1], val)?;
                Ok(Flow::Next)
            }
            Op::SetRandom => {
                let [seed] = self.loads(ops)?;
                self.random.seed(seed);
                Ok(Flow::Next)
            }

            Op::Quit => Ok(self.finish("quit")),
            Op::Verify => {
                let val = self.memory.verify();
                self.store(ops[0], val)?;
                Ok(Flow::Next)
            }
            Op::Restart => {
                self.restart()?;
                Ok(Flow::Jump)
            }
            Op::Save => {
                let [stream] = self.loads(ops)?;
                self.save(stream, ops[1])
            }
            Op::Restore => {
                let [stream] = self.loads(ops)?;
                self.restore(stream, ops[1])
            }
            Op::SaveUndo => self.save_undo(ops[0]),
            Op::RestoreUndo => self.restore_undo(ops[0]),
            Op::Protect => {
                let [start, len] = self.loads(ops)?;
                self.memory.protect(start, len);
                Ok(Flow::Next)
            }

            Op::Glk => {
                let [selector, argc] = self.loads(ops)?;
                let args = self.pop_args(argc)?;
                self.glk(selector, &args, ops[2])
            }

            Op::GetStringTbl => {
                let table = self.strings.current();
                self.store(ops[0], table)?;
                Ok(Flow::Next)
            }
            Op::SetStringTbl => {
                let [table] = self.loads(ops)?;
                self.strings.set_table(&self.memory, table)?;
                Ok(Flow::Next)
            }
            Op::GetIosys => {
                let (mode, rock) = (self.iosys.mode(), self.iosys_rock);
                self.store(ops[0], mode)?;
                self.store(ops[1], rock)?;
                Ok(Flow::Next)
            }
            Op::SetIosys => {
                let [mode, rock] = self.loads(ops)?;
                self.iosys = IoSys::from_mode(mode);
                self.iosys_rock = if self.iosys == IoSys::Filter { rock } else { 0 };
                Ok(Flow::Jump)
            }

            Op::LinearSearch | Op::BinarySearch => {
                let [key, key_size, start, struct_size, num_structs, key_offset, options] =
                    self.loads(ops)?;
                let key = search::Key::fetch(&self.memory, key, key_size, options)?;
                let found = if instr.op == Op::LinearSearch {
                    search::linear(&self.memory, &key, start, struct_size, num_structs, key_offset)?
                } else {
                    search::binary(&self.memory, &key, start, struct_size, num_structs, key_offset)?
                };
                self.store(ops[7], found)?;
                Ok(Flow::Next)
            }
            Op::LinkedSearch => {
                let [key, key_size, start, key_offset, next_offset, options] = self.loads(ops)?;
                let key = search::Key::fetch(&self.memory, key, key_size, options)?;
                let found = search::linked(&self.memory, &key, start, key_offset, next_offset)?;
                self.store(ops[6], found)?;
                Ok(Flow::Next)
            }

            Op::MZero => {
                let [count, addr] = self.loads(ops)?;
                for ix in 0..count {
                    self.memory.write1(addr.wrapping_add(ix), 0)?;
                }
                Ok(Flow::Next)
            }
            Op::MCopy => {
                let [count, src, dst] = self.loads(ops)?;
                let bytes = self.memory.slice(src, count)?.to_vec();
                for (ix, byte) in bytes.into_iter().enumerate() {
                    self.memory.write1(dst.wrapping_add(ix as u32), byte as u32)?;
                }
                Ok(Flow::Next)
            }
            Op::Malloc => {
                let [size] = self.loads(ops)?;
                let addr = self.heap.malloc(&mut self.memory, size)?;
                self.check_heap()?;
                self.store(ops[1], addr)?;
                Ok(Flow::Next)
            }
            Op::MFree => {
                let [addr] = self.loads(ops)?;
                self.heap.free(&mut self.memory, addr)?;
                self.check_heap()?;
                Ok(Flow::Next)
            }

            Op::AccelFunc => {
                let [index, addr] = self.loads(ops)?;
                self.accel.set_func(index, addr);
                Ok(Flow::Next)
            }
            Op::AccelParam => {
                let [index, val] = self.loads(ops)?;
                self.accel.set_param(index, val);
                Ok(Flow::Next)
            }

            Op::NumToF => self.unary(ops, |a| float::encode(a as i32 as f64)),
            Op::FToNumZ => self.unary(ops, float::to_int_truncate),
            Op::FToNumN => self.unary(ops, float::to_int_round),
            Op::Ceil => self.float1(ops, f64::ceil),
            Op::Floor => self.float1(ops, f64::floor),
            Op::FAdd => self.float2(ops, |a, b| a + b),
            Op::FSub => self.float2(ops, |a, b| a - b),
            Op::FMul => self.float2(ops, |a, b| a * b),
            Op::FDiv => self.float2(ops, |a, b| a / b),
            Op::FMod => {
                let [a, b] = self.loads(ops)?;
                let (rem, quo) = float::modulo(a, b);
                self.store(ops[2], rem)?;
                self.store(ops[3], quo)?;
                Ok(Flow::Next)
            }
            Op::Sqrt => self.float1(ops, f64::sqrt),
            Op::Exp => self.float1(ops, f64::exp),
            Op::Log => self.float1(ops, f64::ln),
            Op::Pow => self.arith(ops, |a, b| Ok(float::pow(a, b))),
            Op::Sin => self.float1(ops, f64::sin),
            Op::Cos => self.float1(ops, f64::cos),
            Op::Tan => self.float1(ops, f64::tan),
            Op::ASin => self.float1(ops, f64::asin),
            Op::ACos => self.float1(ops, f64::acos),
            Op::ATan => self.float1(ops, f64::atan),
            Op::ATan2 => self.float2(ops, f64::atan2),

            Op::JFeq | Op::JFne => {
                let [a, b, delta, offset] = self.loads(ops)?;
                let equal = float::approx_eq(a, b, delta);
                self.branch_if(equal == (instr.op == Op::JFeq), offset)
            }
            Op::JFlt => self.test2(ops, |a, b| float::decode(a) < float::decode(b)),
            Op::JFle => self.test2(ops, |a, b| float::decode(a) <= float::decode(b)),
            Op::JFgt => self.test2(ops, |a, b| float::decode(a) > float::decode(b)),
            Op::JFge => self.test2(ops, |a, b| float::decode(a) >= float::decode(b)),
            Op::JIsNaN => self.test1(ops, float::is_nan),
            Op::JIsInf => self.test1(ops, float::is_inf),
        }
    }

    fn load_op(&mut self, op: Operand) -> anyhow::Result<u32> {
        self.load_sized(op, 4)
    }

    fn load_sized(&mut self, op: Operand, size: u32) -> anyhow::Result<u32> {
        let val = match op {
            Operand::Const(val) => val,
            Operand::Stack => self.stack.current_mut()?.pop()?,
            Operand::Local(pos) => return self.stack.current()?.local(pos, size),
            Operand::Mem(addr) => {
                return match size {
                    1 => self.memory.read1(addr),
                    2 => self.memory.read2(addr),
                    _ => self.memory.read4(addr),
                }
            }
            Operand::Discard => bail!("Attempt to load from a store-only operand."),
        };
        Ok(mask(val, size))
    }

    /// Load the first `N` operands in order.
    fn loads<const N: usize>(&mut self, ops: &[Operand]) -> anyhow::Result<[u32; N]> {
        let mut vals = [0; N];
        for (val, op) in vals.iter_mut().zip(ops) {
            *val = self.load_op(*op)?;
        }
        Ok(vals)
    }

    pub(crate) fn store(&mut self, op: Operand, val: u32) -> anyhow::Result<()> {
        self.store_sized(op, 4, val)
    }

    fn store_sized(&mut self, op: Operand, size: u32, val: u32) -> anyhow::Result<()> {
        match op {
            Operand::Discard => Ok(()),
            Operand::Stack => {
                self.stack.current_mut()?.push(mask(val, size));
                Ok(())
            }
            Operand::Local(pos) => self.stack.current_mut()?.set_local(pos, size, val),
            Operand::Mem(addr) => match size {
                1 => self.memory.write1(addr, val),
                2 => self.memory.write2(addr, val),
                _ => self.memory.write4(addr, val),
            },
            Operand::Const(_) => bail!("Attempt to store to a constant operand."),
        }
    }

    fn arith(
        &mut self,
        ops: &[Operand],
        f: impl FnOnce(u32, u32) -> anyhow::Result<u32>,
    ) -> anyhow::Result<Flow> {
        let [a, b] = self.loads(ops)?;
        let val = f(a, b)?;
        self.store(ops[2], val)?;
        Ok(Flow::Next)
    }

    fn unary(&mut self, ops: &[Operand], f: impl FnOnce(u32) -> u32) -> anyhow::Result<Flow> {
        let [a] = self.loads(ops)?;
        self.store(ops[1], f(a))?;
        Ok(Flow::Next)
    }

    fn float1(&mut self, ops: &[Operand], f: impl FnOnce(f64) -> f64) -> anyhow::Result<Flow> {
        self.unary(ops, |a| float::encode(f(float::decode(a))))
    }

    fn float2(&mut self, ops: &[Operand], f: impl FnOnce(f64, f64) -> f64) -> anyhow::Result<Flow> {
        self.arith(ops, |a, b| Ok(float::encode(f(float::decode(a), float::decode(b)))))
    }

    fn test1(&mut self, ops: &[Operand], f: impl FnOnce(u32) -> bool) -> anyhow::Result<Flow> {
        let [a, offset] = self.loads(ops)?;
        self.branch_if(f(a), offset)
    }

    fn test2(&mut self, ops: &[Operand], f: impl FnOnce(u32, u32) -> bool) -> anyhow::Result<Flow> {
        let [a, b, offset] = self.loads(ops)?;
        self.branch_if(f(a, b), offset)
    }

    fn mem_load(&mut self, ops: &[Operand], size: u32) -> anyhow::Result<Flow> {
        let [base, index] = self.loads(ops)?;
        let addr = base.wrapping_add(index.wrapping_mul(size));
        let val = match size {
            1 => self.memory.read1(addr)?,
            2 => self.memory.read2(addr)?,
            _ => self.memory.read4(addr)?,
        };
        self.store(ops[2], val)?;
        Ok(Flow::Next)
    }

    fn mem_store(&mut self, ops: &[Operand], size: u32) -> anyhow::Result<Flow> {
        let [base, index, val] = self.loads(ops)?;
        let addr = base.wrapping_add(index.wrapping_mul(size));
        match size {
            1 => self.memory.write1(addr, val)?,
            2 => self.memory.write2(addr, val)?,
            _ => self.memory.write4(addr, val)?,
        }
        Ok(Flow::Next)
    }

    fn branch_if(&mut self, cond: bool, offset: u32) -> anyhow::Result<Flow> {
        if cond {
            self.branch(offset)
        } else {
            Ok(Flow::Next)
        }
    }

    /// Offsets 0 and 1 return that value from the current function.
    fn branch(&mut self, offset: u32) -> anyhow::Result<Flow> {
        match offset {
            0 | 1 => self.return_value(offset),
            _ => {
                self.pc = self.pc.wrapping_add(offset).wrapping_sub(2);
                Ok(Flow::Jump)
            }
        }
    }

    fn roll(&mut self, count: i32, shift: i32) -> anyhow::Result<()> {
        if count <= 0 {
            return Ok(());
        }
        let frame = self.stack.current_mut()?;
        let len = frame.values.len();
        if count as usize > len {
            bail!("Stack underflow in stkroll.");
        }
        let shift = shift.rem_euclid(count) as usize;
        frame.values[len - count as usize..].rotate_right(shift);
        Ok(())
    }

    fn check_heap(&self) -> anyhow::Result<()> {
        if self.options.check_heap {
            self.heap.check(self.memory.end_mem())?;
        }
        Ok(())
    }

    fn gestalt(&self, selector: u32, arg: u32) -> u32 {
        match selector {
            0 => GLULX_VERSION,
            1 => TERP_VERSION,
            2 | 3 => 1,
            4 => (arg <= 2) as u32,
            5..=7 => 1,
            8 => self.heap.start(),
            9 => 1,
            10 => Accel::is_supported(arg) as u32,
            11 => 1,
            _ => 0,
        }
    }

    fn glk(&mut self, selector: u32, args: &[u32], dest: Operand) -> anyhow::Result<Flow> {
        match self.host.call(&mut self.memory, selector, args)? {
            GlkResult::Value(val) => {
                self.store(dest, val)?;
                Ok(Flow::Jump)
            }
            GlkResult::DidNotReturn if self.host.may_not_return(selector) => {
                debug!("suspended in glk call {:#x}", selector);
                self.resume_dest = Some(dest);
                self.status = Status::Suspended;
                Ok(Flow::Stop)
            }
            GlkResult::DidNotReturn => bail!("Glk call {:#x} did not return.", selector),
        }
    }

    /// Pop `argc` call arguments. The first value popped is the first
    /// argument.
    fn pop_args(&mut self, argc: u32) -> anyhow::Result<Vec<u32>> {
        let frame = self.stack.current_mut()?;
        (0..argc).map(|_| frame.pop()).collect()
    }

    pub(crate) fn function(&mut self, addr: u32) -> anyhow::Result<Rc<Function>> {
        if let Some(func) = self.functions.get(&addr) {
            return Ok(func.clone());
        }
        let func = Rc::new(Function::parse(&self.memory, addr)?);
        if addr < self.memory.ram_start() {
            debug!("compiled function ${:X}", addr);
            self.functions.insert(addr, func.clone());
        }
        Ok(func)
    }

    pub(crate) fn enter_function(&mut self, addr: u32, args: &[u32]) -> anyhow::Result<()> {
        self.stats.total_function_calls += 1;

        if let Some(func) = self.accel.lookup(addr) {
            let val = self.call_accel(func, args)?;
            return self.pop_callstub(val);
        }

        let func = self.function(addr)?;
        self.pc = func.start_pc;
        let kind = func.kind;
        let frame = self.stack.enter(func);
        match kind {
            FuncKind::Stack => {
                for &arg in args.iter().rev() {
                    frame.push(arg);
                }
                frame.push(args.len() as u32);
            }
            FuncKind::Local => frame.fill_locals(args),
        }
        Ok(())
    }

    fn call_accel(&mut self, func: AccelFunc, args: &[u32]) -> anyhow::Result<u32> {
        self.stats.accel_function_calls += 1;
        let mut out = String::new();
        let val = self.accel.call(func, &self.memory, args, &mut out)?;
        if !out.is_empty() {
            self.host.put_string(&out);
        }
        Ok(val)
    }

    fn return_value(&mut self, val: u32) -> anyhow::Result<Flow> {
        if !self.stack.leave() {
            return Ok(self.finish("top-level function returned"));
        }
        self.pop_callstub(val)?;
        Ok(Flow::Jump)
    }

    /// Push a stub that stores into `op` and returns to `pc`.
    pub(crate) fn push_callstub(&mut self, op: Operand) -> anyhow::Result<()> {
        let (dest_type, dest_addr) = match op {
            Operand::Discard => (dest::DISCARD, 0),
            Operand::Mem(addr) => (dest::MEMORY, addr),
            Operand::Local(pos) => (dest::LOCAL, pos),
            Operand::Stack => (dest::STACK, 0),
            Operand::Const(_) => bail!("Attempt to store to a constant operand."),
        };
        let pc = self.pc;
        self.stack.current_mut()?.push_stub(dest_type, dest_addr, pc);
        Ok(())
    }

    /// Pop a stub and deliver `val` to it.
    pub(crate) fn pop_callstub(&mut self, val: u32) -> anyhow::Result<()> {
        let stub = self.stack.current_mut()?.pop_stub()?;
        self.pc = stub.pc;
        match stub.dest_type {
            dest::DISCARD => {}
            dest::MEMORY => self.memory.write4(stub.dest_addr, val)?,
            dest::LOCAL => self.stack.current_mut()?.set_local(stub.dest_addr, 4, val)?,
            dest::STACK => self.stack.current_mut()?.push(val),
            dest::STRING_TERMINATOR => {
                bail!("String-terminator call stub at end of function call.")
            }
            dest::RESUME_COMPRESSED => {
                self.stream_string(stub.pc, 0xE1, stub.dest_addr)?;
            }
            dest::RESUME_NUMBER => {
                self.stream_num(stub.pc, true, stub.dest_addr)?;
            }
            dest::RESUME_CSTRING => {
                self.stream_string(stub.pc, 0xE0, 0)?;
            }
            dest::RESUME_UNISTRING => {
                self.stream_string(stub.pc, 0xE2, 0)?;
            }
            other => bail!("Unrecognized desttype in callstub ({:#x}).", other),
        }
        Ok(())
    }

    fn stream_char(&mut self, ch: u32, unicode: bool) -> anyhow::Result<Flow> {
        let ch = if unicode { ch } else { ch & 0xFF };
        match self.iosys {
            IoSys::Null => Ok(Flow::Next),
            IoSys::Glk => {
                if unicode {
                    self.host.put_char_uni(ch);
                } else {
                    self.host.put_char(ch as u8);
                }
                Ok(Flow::Next)
            }
            IoSys::Filter => {
                let pc = self.pc;
                self.stack.current_mut()?.push_stub(dest::DISCARD, 0, pc);
                self.enter_function(self.iosys_rock, &[ch])?;
                Ok(Flow::Jump)
            }
        }
    }

    /// Print `val` as a signed decimal from digit `pos` on. Returns true
    /// when the filter function was entered.
    fn stream_num(&mut self, val: u32, in_middle: bool, pos: u32) -> anyhow::Result<bool> {
        let digits = (val as i32).to_string();
        let mut in_middle = in_middle;
        match self.iosys {
            IoSys::Glk => {
                self.host
                    .put_string(digits.get(pos as usize..).unwrap_or_default());
            }
            IoSys::Filter => {
                let pc = self.pc;
                let frame = self.stack.current_mut()?;
                if !in_middle {
                    frame.push_stub(dest::STRING_TERMINATOR, 0, pc);
                    in_middle = true;
                }
                if let Some(&ch) = digits.as_bytes().get(pos as usize) {
                    frame.push_stub(dest::RESUME_NUMBER, pos + 1, val);
                    self.enter_function(self.iosys_rock, &[ch as u32])?;
                    return Ok(true);
                }
            }
            IoSys::Null => {}
        }

        if in_middle {
            let stub = self.stack.current_mut()?.pop_stub()?;
            if stub.dest_type != dest::STRING_TERMINATOR {
                bail!("String-on-string call stub while printing number.");
            }
            self.pc = stub.pc;
        }
        Ok(false)
    }

    /// Print the string at `addr`. `kind` is zero at the start of a
    /// string, or the string type when resuming inside one at bit `bit`.
    /// Returns true when a function was entered; `pc` is then set.
    pub(crate) fn stream_string(&mut self, addr: u32, kind: u32, bit: u32) -> anyhow::Result<bool> {
        let (mut addr, mut kind, mut bit) = (addr, kind, bit);
        let mut substring = kind != 0;

        loop {
            let step =
                self.strings
                    .compile(&self.memory, self.iosys, addr, kind, bit, &mut self.stats)?;
            let (text, action) = match &*step {
                Step::Text(text) => (text, None),
                Step::Action(text, action) => (text, Some(action)),
            };
            if !text.is_empty() {
                self.host.put_string(text);
            }

            if let Some(action) = action {
                if !substring {
                    let pc = self.pc;
                    self.stack
                        .current_mut()?
                        .push_stub(dest::STRING_TERMINATOR, 0, pc);
                    substring = true;
                }

                match action {
                    Action::Filter { ch, stub } => {
                        self.stack.current_mut()?.push_stub(stub.0, stub.1, stub.2);
                        self.enter_function(self.iosys_rock, &[*ch])?;
                        return Ok(true);
                    }
                    Action::Substring {
                        stub,
                        addr: sub,
                        kind: sub_kind,
                    } => {
                        self.stack.current_mut()?.push_stub(stub.0, stub.1, stub.2);
                        (addr, kind, bit) = (*sub, *sub_kind, 0);
                        continue;
                    }
                    Action::Indirect {
                        stub,
                        double,
                        data,
                        args,
                    } => {
                        let mut target = self.memory.read4(*data)?;
                        if *double {
                            target = self.memory.read4(target)?;
                        }
                        self.stack.current_mut()?.push_stub(stub.0, stub.1, stub.2);
                        match self.memory.read1(target)? {
                            0xE0..=0xFF => {
                                (addr, kind, bit) = (target, 0, 0);
                                continue;
                            }
                            0xC0..=0xDF => {
                                self.enter_function(target, args)?;
                                return Ok(true);
                            }
                            other => bail!(
                                "Unknown object while decoding string indirect reference ({:#x}).",
                                other
                            ),
                        }
                    }
                }
            }

            if !substring {
                return Ok(false);
            }

            let stub = self.stack.current_mut()?.pop_stub()?;
            self.pc = stub.pc;
            match stub.dest_type {
                dest::STRING_TERMINATOR => return Ok(true),
                dest::RESUME_COMPRESSED => {
                    (addr, kind, bit) = (stub.pc, 0xE1, stub.dest_addr);
                }
                _ => bail!("Function-terminator call stub at end of string."),
            }
        }
    }
}

fn mask(val: u32, size: u32) -> u32 {
    match size {
        1 => val & 0xFF,
        2 => val & 0xFFFF,
        _ => val,
    }
}

/// Byte address and bit number for a signed bit offset from `addr`.
fn bit_address(addr: u32, bit: u32) -> (u32, u32) {
    let bit = bit as i32;
    (addr.wrapping_add((bit >> 3) as u32), (bit & 7) as u32)
}
