//! GVM is an engine for Glulx-style 32-bit story-file images: a stack
//! machine with a resizable memory map, a heap, compressed strings,
//! accelerated library functions and a save-file format.
//!
//! # Example
//!
//! ```text
//! .start main
//! .func main c1 4:1
//!     setiosys 2 0
//!     copy 5 l0
//! loop:
//!     streamnum l0
//!     streamchar 32
//!     sub l0 1 l0
//!     jnz l0 >loop
//!     streamstr &done
//!     return 0
//! done:
//!     .string 'liftoff'
//! ```
//!
//! ```ignore
//! let image = gvm::asm::assemble(source)?;
//! let mut vm = gvm::Vm::load(image, gvm::host::BufferHost::default())?;
//! vm.start()?;
//! assert_eq!(vm.host().output, "5 4 3 2 1 liftoff");
//! ```
//!
//! # Instructions
//!
//! Operands are `L` (load), `S` (store) or `C` (call-stub destination).
//!
//! | Instruction | Usage                    | Brief   |
//! |-------------|--------------------------|---------|
//! | add ... shiftl | `add L1 L2 S`         | 32-bit arithmetic and bit operations, wrapping. Division by zero is fatal. |
//! | jump, jz ... jleu | `jeq L1 L2 Lofs`   | Branch to `next + ofs - 2`; offsets 0 and 1 return that value. |
//! | call       | `call Lfunc Largc C`      | Call with `argc` arguments popped from the stack. |
//! | callf ... callfiii | `callfi Lfunc L1 C` | Call with inline arguments. |
//! | return     | `return L`                | Return to the caller's call stub. |
//! | tailcall   | `tailcall Lfunc Largc`    | Replace the current frame with a call. |
//! | catch, throw | `catch C Lofs`, `throw L Ltoken` | Non-local exits through a stack token. |
//! | copy, copys, copyb | `copy L S`        | Move a word, short or byte. |
//! | aload ... astorebit | `aload Laddr Lix S` | Array access in memory. |
//! | stkcount ... stkcopy | `stkroll Lcount Lshift` | Value stack manipulation. |
//! | streamchar, streamnum, streamstr, streamunichar | `streamstr L` | Output through the current I/O system. |
//! | gestalt    | `gestalt Lsel Larg S`     | Engine capabilities. |
//! | getmemsize, setmemsize | `setmemsize L S` | Memory size. |
//! | malloc, mfree | `malloc Lsize S`       | Heap allocation. |
//! | random, setrandom | `random Lrange S`  | Random numbers. |
//! | quit, restart, verify | `verify S`     | Program lifecycle. |
//! | save, restore | `save Lstream C`       | Save files through the host. |
//! | saveundo, restoreundo | `saveundo C`   | In-memory undo snapshots. |
//! | protect    | `protect Lstart Llen`     | Range kept across restore and restart. |
//! | glk        | `glk Lsel Largc S`        | Host capability call. May suspend. |
//! | getiosys, setiosys | `setiosys Lmode Lrock` | Null, filter or host output. |
//! | getstringtbl, setstringtbl | `setstringtbl L` | Compressed string table. |
//! | linearsearch, binarysearch, linkedsearch | | Table searches. |
//! | mzero, mcopy | `mcopy Llen Lsrc Ldst`  | Block memory operations. |
//! | accelfunc, accelparam | `accelfunc Lix Laddr` | Native replacements for library routines. |
//! | numtof ... jisinf | `fadd L1 L2 S`     | Single-precision floats. |
//!
//! # Important notes
//!
//! - Fatal errors stop the machine. They are returned from `start`, `run`
//!   and `resume` and reported to [`host::Glk::fatal_error`].
//! - A capability call that does not return suspends execution until
//!   [`Vm::resume`] delivers its result.
//! - Paths and compressed strings are only cached when they live in ROM.

pub mod accel;
pub mod asm;
pub mod bytecode;
pub mod float;
pub mod heap;
pub mod host;
mod lexer;
pub mod memory;
pub mod opcode;
mod persist;
pub mod quetzal;
pub mod random;
pub mod search;
pub mod stack;
pub mod strings;
pub mod token;
pub mod vm;

pub use vm::{Statistics, Status, Vm, VmOptions};
