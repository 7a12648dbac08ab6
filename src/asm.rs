//! Text assembler that builds complete program images.
//!
//! One statement per line. `name:` defines a label, `;` starts a comment.
//!
//! | Statement | Emits |
//! |-----------|-------|
//! | `.func NAME c0\|c1 SIZE:COUNT ...` | label `NAME` and a function header |
//! | `.start NAME` / `.strtbl NAME` | header start function / string table |
//! | `.ram` | pads to 256 bytes; what follows is RAM |
//! | `.extend N` | `N` more zeroed bytes of memory past the image |
//! | `.byte` / `.short` / `.word` `VALUE ...` | numbers or label addresses |
//! | `.string 'text'` / `.unistring 'text'` | an `E0` or `E2` string |
//! | `MNEMONIC OPERAND ...` | one instruction |
//!
//! Operands: numbers, `sp`, `discard`, `lN` (local at byte offset `N`),
//! `mem:ADDR`, `ram:OFFSET`, `&LABEL` (address constant) and `>LABEL`
//! (branch offset to a label).

use crate::{
    lexer::Lexer,
    memory::{HEADER_LEN, MAGIC},
    opcode::Op,
    token::Token,
};
use anyhow::{anyhow, bail};
use std::collections::HashMap;

const VERSION: u32 = 0x0003_0102;
const STACK_SIZE: u32 = 0x1000;

/// Assemble `src` into an image.
pub fn assemble(src: &str) -> anyhow::Result<Vec<u8>> {
    let mut lexer = Lexer::new(src);
    let mut asm = Assembler::default();
    let mut line = Vec::new();
    let mut number = 1;

    loop {
        let token = lexer.next_token()?;
        match token {
            Some(Token::Newline) | None => {
                asm.statement(&line)
                    .map_err(|err| anyhow!("line {}: {}", number, err))?;
                line.clear();
                number += 1;
                if token.is_none() {
                    break;
                }
            }
            Some(token) => line.push(token),
        }
    }

    asm.finish()
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    Address,
    /// Branch offset from the end of the instruction at `next`.
    Branch { next: u32 },
}

#[derive(Debug)]
struct Fixup<'a> {
    at: usize,
    size: usize,
    label: &'a str,
    kind: FixupKind,
}

/// One parsed operand.
#[derive(Debug, Clone, Copy)]
enum Arg<'a> {
    Const(i64),
    Address(&'a str),
    Branch(&'a str),
    Stack,
    Discard,
    Local(u32),
    Mem(u32),
    MemLabel(&'a str),
    Ram(u32),
}

struct Assembler<'a> {
    out: Vec<u8>,
    labels: HashMap<&'a str, u32>,
    fixups: Vec<Fixup<'a>>,
    ram_start: Option<u32>,
    start: Option<&'a str>,
    string_table: Option<&'a str>,
    extend: u32,
}

impl Default for Assembler<'_> {
    fn default() -> Self {
        Assembler {
            out: vec![0; HEADER_LEN],
            labels: HashMap::new(),
            fixups: Vec::new(),
            ram_start: None,
            start: None,
            string_table: None,
            extend: 0,
        }
    }
}

fn number(value: i64) -> anyhow::Result<u32> {
    if value < i32::MIN as i64 || value > u32::MAX as i64 {
        bail!("Number {} does not fit in 32 bits.", value);
    }
    Ok(value as u32)
}

fn unsigned(token: Option<&Token>) -> anyhow::Result<u32> {
    match token {
        Some(Token::Number(value)) if *value >= 0 => number(*value),
        other => bail!("Expected an unsigned number, found {:?}.", other),
    }
}

fn name<'a>(token: Option<&Token<'a>>) -> anyhow::Result<&'a str> {
    match token {
        Some(Token::Name(name)) => Ok(*name),
        other => bail!("Expected a name, found {:?}.", other),
    }
}

impl<'a> Assembler<'a> {
    fn here(&self) -> u32 {
        self.out.len() as u32
    }

    fn define(&mut self, label: &'a str) -> anyhow::Result<()> {
        let here = self.here();
        if self.labels.insert(label, here).is_some() {
            bail!("Label '{}' is defined twice.", label);
        }
        Ok(())
    }

    fn statement(&mut self, tokens: &[Token<'a>]) -> anyhow::Result<()> {
        let tokens = match tokens {
            [Token::Name(label), Token::Colon, rest @ ..] => {
                self.define(*label)?;
                rest
            }
            _ => tokens,
        };

        match tokens {
            [] => Ok(()),
            [Token::Directive(directive), args @ ..] => self.directive(directive, args),
            [Token::Instruction(op), args @ ..] => self.instruction(*op, args),
            [other, ..] => bail!("Unexpected {:?}.", other),
        }
    }

    fn directive(&mut self, directive: &str, args: &[Token<'a>]) -> anyhow::Result<()> {
        match directive {
            "func" => self.function(args),
            "start" => {
                self.start = Some(name(args.first())?);
                Ok(())
            }
            "strtbl" => {
                self.string_table = Some(name(args.first())?);
                Ok(())
            }
            "ram" => {
                if self.ram_start.is_some() {
                    bail!("RAM already started.");
                }
                self.align();
                self.ram_start = Some(self.here());
                Ok(())
            }
            "extend" => {
                self.extend = unsigned(args.first())?;
                Ok(())
            }
            "byte" => self.data(args, 1),
            "short" => self.data(args, 2),
            "word" => self.data(args, 4),
            "string" | "unistring" => {
                let text = match args.first() {
                    Some(Token::StringLiteral(text)) => *text,
                    other => bail!("Expected a string literal, found {:?}.", other),
                };
                if directive == "string" {
                    self.out.push(0xE0);
                    for ch in text.chars() {
                        if ch as u32 > 0xFF {
                            bail!("Character '{}' needs .unistring.", ch);
                        }
                        self.out.push(ch as u8);
                    }
                    self.out.push(0);
                } else {
                    self.out.extend_from_slice(&[0xE2, 0, 0, 0]);
                    for ch in text.chars() {
                        self.out.extend_from_slice(&(ch as u32).to_be_bytes());
                    }
                    self.out.extend_from_slice(&[0; 4]);
                }
                Ok(())
            }
            _ => bail!("Unknown directive '.{}'.", directive),
        }
    }

    /// `.func NAME c0|c1 SIZE:COUNT ...`
    fn function(&mut self, args: &[Token<'a>]) -> anyhow::Result<()> {
        let label = name(args.first())?;
        self.define(label)?;
        let kind = match name(args.get(1))? {
            "c0" => 0xC0,
            "c1" => 0xC1,
            other => bail!("Unknown function type '{}'.", other),
        };
        self.out.push(kind);

        for local in args[2..].chunks(3) {
            let (size, count) = match local {
                [Token::Number(size), Token::Colon, Token::Number(count)] => (*size, *count),
                _ => bail!("Expected SIZE:COUNT, found {:?}.", local),
            };
            if !matches!(size, 1 | 2 | 4) || !(1..=255).contains(&count) {
                bail!("Bad local declaration {}:{}.", size, count);
            }
            self.out.push(size as u8);
            self.out.push(count as u8);
        }
        self.out.extend_from_slice(&[0, 0]);
        Ok(())
    }

    fn data(&mut self, args: &[Token<'a>], size: usize) -> anyhow::Result<()> {
        for arg in args {
            match arg {
                Token::Number(value) => {
                    let bytes = number(*value)?.to_be_bytes();
                    self.out.extend_from_slice(&bytes[4 - size..]);
                }
                Token::Name(label) => {
                    self.fixups.push(Fixup {
                        at: self.out.len(),
                        size,
                        label: *label,
                        kind: FixupKind::Address,
                    });
                    self.out.resize(self.out.len() + size, 0);
                }
                other => bail!("Unexpected {:?} in data.", other),
            }
        }
        Ok(())
    }

    fn operands(&self, args: &[Token<'a>]) -> anyhow::Result<Vec<Arg<'a>>> {
        let mut operands = Vec::new();
        let mut tokens = args.iter();
        while let Some(token) = tokens.next() {
            let arg = match token {
                Token::Number(value) => Arg::Const(*value),
                Token::Ampersand => Arg::Address(name(tokens.next())?),
                Token::Greater => Arg::Branch(name(tokens.next())?),
                Token::Name("sp") => Arg::Stack,
                Token::Name("discard") => Arg::Discard,
                Token::Name(space @ ("mem" | "ram")) => {
                    if tokens.next() != Some(&Token::Colon) {
                        bail!("Expected ':' after '{}'.", space);
                    }
                    match (*space, tokens.next()) {
                        ("mem", Some(Token::Name(label))) => Arg::MemLabel(*label),
                        ("mem", addr) => Arg::Mem(unsigned(addr)?),
                        (_, offset) => Arg::Ram(unsigned(offset)?),
                    }
                }
                Token::Name(local) if local.starts_with('l') && local.len() > 1 => {
                    Arg::Local(local[1..].parse()?)
                }
                other => bail!("Unexpected operand {:?}.", other),
            };
            operands.push(arg);
        }
        Ok(operands)
    }

    fn instruction(&mut self, op: Op, args: &[Token<'a>]) -> anyhow::Result<()> {
        let operands = self.operands(args)?;
        let forms = op.forms();
        if operands.len() != forms.len() {
            bail!(
                "'{}' takes {} operands, found {}.",
                op.mnemonic(),
                forms.len(),
                operands.len()
            );
        }

        let code = op.code();
        match code {
            0..=0x7F => self.out.push(code as u8),
            0x80..=0x3FFF => self.out.extend_from_slice(&((code | 0x8000) as u16).to_be_bytes()),
            _ => self.out.extend_from_slice(&(code | 0xC000_0000).to_be_bytes()),
        }

        let mut modes = vec![0u8; (forms.len() + 1) / 2];
        let mut data = Vec::new();
        let mut pending = Vec::new();
        for (ix, (arg, form)) in operands.iter().zip(forms).enumerate() {
            let store = *form != b'L';
            let (mode, bytes, label) = encode(*arg, store)?;
            modes[ix / 2] |= mode << (4 * (ix % 2));
            if let Some((label, branch)) = label {
                pending.push((data.len(), label, branch));
            }
            data.extend_from_slice(&bytes);
        }

        self.out.extend_from_slice(&modes);
        let base = self.out.len();
        let next = (base + data.len()) as u32;
        for (at, label, branch) in pending {
            self.fixups.push(Fixup {
                at: base + at,
                size: 4,
                label,
                kind: if branch {
                    FixupKind::Branch { next }
                } else {
                    FixupKind::Address
                },
            });
        }
        self.out.extend_from_slice(&data);
        Ok(())
    }

    fn align(&mut self) {
        let len = (self.out.len() + 0xFF) & !0xFF;
        self.out.resize(len, 0);
    }

    fn finish(mut self) -> anyhow::Result<Vec<u8>> {
        if self.ram_start.is_none() {
            self.align();
            self.ram_start = Some(self.here());
        }
        self.align();
        let end_game_file = self.here();
        let extend = self
            .extend
            .checked_add(0xFF)
            .ok_or_else(|| anyhow!("Memory extension is too large."))?
            & !0xFF;

        for fixup in &self.fixups {
            let target = *self
                .labels
                .get(fixup.label)
                .ok_or_else(|| anyhow!("Unknown label '{}'.", fixup.label))?;
            let value = match fixup.kind {
                FixupKind::Address => target,
                FixupKind::Branch { next } => target.wrapping_sub(next).wrapping_add(2),
            };
            let bytes = value.to_be_bytes();
            self.out[fixup.at..fixup.at + fixup.size].copy_from_slice(&bytes[4 - fixup.size..]);
        }

        let label = |name: Option<&str>| -> anyhow::Result<u32> {
            match name {
                Some(name) => self
                    .labels
                    .get(name)
                    .copied()
                    .ok_or_else(|| anyhow!("Unknown label '{}'.", name)),
                None => Ok(0),
            }
        };
        let start = match self.start {
            Some(start) => label(Some(start))?,
            None => bail!("No start function given."),
        };
        let string_table = label(self.string_table)?;

        let header = [
            MAGIC,
            VERSION,
            self.ram_start.unwrap_or(end_game_file),
            end_game_file,
            end_game_file + extend,
            STACK_SIZE,
            start,
            string_table,
        ];
        let mut image = self.out;
        for (ix, word) in header.iter().enumerate() {
            image[ix * 4..ix * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        let checksum = image
            .chunks(4)
            .fold(0u32, |sum, word| {
                sum.wrapping_add(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
            });
        image[32..36].copy_from_slice(&checksum.to_be_bytes());
        Ok(image)
    }
}

/// Addressing mode, operand bytes and a label to patch in (with whether it
/// is a branch).
fn encode<'a>(arg: Arg<'a>, store: bool) -> anyhow::Result<(u8, Vec<u8>, Option<(&'a str, bool)>)> {
    let sized = |value: u32, base: u8| match value {
        0..=0xFF => (base, vec![value as u8], None),
        0x100..=0xFFFF => (base + 1, (value as u16).to_be_bytes().to_vec(), None),
        _ => (base + 2, value.to_be_bytes().to_vec(), None),
    };

    let encoded = match arg {
        Arg::Const(_) | Arg::Address(_) | Arg::Branch(_) if store => {
            bail!("Constant used as a store operand.")
        }
        Arg::Discard if !store => bail!("'discard' can only be stored to."),
        Arg::Const(value) => {
            let value = number(value)? as i32;
            match value {
                0 => (0, Vec::new(), None),
                -0x80..=0x7F => (1, vec![value as u8], None),
                -0x8000..=0x7FFF => (2, (value as i16).to_be_bytes().to_vec(), None),
                _ => (3, value.to_be_bytes().to_vec(), None),
            }
        }
        Arg::Address(label) => (3, vec![0; 4], Some((label, false))),
        Arg::Branch(label) => (3, vec![0; 4], Some((label, true))),
        Arg::Stack => (8, Vec::new(), None),
        Arg::Discard => (0, Vec::new(), None),
        Arg::Local(pos) => sized(pos, 9),
        Arg::Mem(addr) => sized(addr, 5),
        Arg::MemLabel(label) => (7, vec![0; 4], Some((label, false))),
        Arg::Ram(offset) => sized(offset, 13),
    };
    Ok(encoded)
}
