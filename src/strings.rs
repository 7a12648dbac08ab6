//! Decoding of printable strings: plain byte and word strings, and
//! compressed strings walked through the string table.
//!
//! Printing a string is split in two. [`StringTables::compile`] turns the
//! string at some position into a [`Step`]: the text printed before the
//! next point where the engine has to act, and that action. The engine
//! runs steps until the string ends. Steps for strings in ROM are cached
//! per table and output mode.

use crate::{host::IoSys, memory::Memory, stack::dest, vm::Statistics};
use anyhow::bail;
use log::debug;
use std::{collections::HashMap, rc::Rc};

const CACHE_BITS: u32 = 4;
const CACHE_SIZE: usize = 1 << CACHE_BITS;

/// Terminal node of the string table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Leaf {
    Terminator,
    Char(u32),
    /// Zero-terminated byte string at this address.
    CString(u32),
    /// Zero-terminated word string at this address.
    UniCString(u32),
    /// Reference to a string or function. `data` points just past the
    /// node type byte.
    Indirect { double: bool, data: u32, args: Vec<u32> },
}

impl Leaf {
    fn read(mem: &Memory, node: u32) -> anyhow::Result<Leaf> {
        let data = node + 1;
        let leaf = match mem.read1(node)? {
            0x01 => Leaf::Terminator,
            0x02 => Leaf::Char(mem.read1(data)?),
            0x04 => Leaf::Char(mem.read4(data)?),
            0x03 => Leaf::CString(data),
            0x05 => Leaf::UniCString(data),
            kind @ 0x08..=0x0B => {
                let mut args = Vec::new();
                if kind >= 0x0A {
                    let argc = mem.read4(data + 4)?;
                    for ix in 0..argc {
                        args.push(mem.read4(data + 8 + 4 * ix)?);
                    }
                }
                Leaf::Indirect {
                    double: kind == 0x09 || kind == 0x0B,
                    data,
                    args,
                }
            }
            kind => bail!("Unknown node type {:#x} in string table.", kind),
        };
        Ok(leaf)
    }
}

/// Entry of a 16-way table covering up to four levels of branch nodes.
#[derive(Debug, Clone)]
enum Entry {
    Leaf { depth: u32, leaf: Rc<Leaf> },
    Table(Rc<Table>),
}

impl Entry {
    fn depth(&self) -> u32 {
        match self {
            Entry::Leaf { depth, .. } => *depth,
            Entry::Table(_) => CACHE_BITS,
        }
    }
}

#[derive(Debug)]
struct Table {
    entries: Vec<Entry>,
}

/// Decoding tree for a string table that lies entirely in ROM.
#[derive(Debug)]
pub(crate) enum DecodingTree {
    /// The root is a leaf, which must be a terminator.
    Empty,
    Root(Rc<Table>),
}

impl DecodingTree {
    pub fn build(mem: &Memory, root: u32) -> anyhow::Result<Self> {
        if mem.read1(root)? != 0 {
            return Ok(DecodingTree::Empty);
        }
        Ok(DecodingTree::Root(Self::build_table(mem, root, 0)?))
    }

    fn build_table(mem: &Memory, node: u32, level: u32) -> anyhow::Result<Rc<Table>> {
        if level > 1024 {
            bail!("String table is too deep.");
        }
        let mut entries = vec![None; CACHE_SIZE];
        Self::fill(mem, &mut entries, node, 0, 0, level)?;
        let entries = entries
            .into_iter()
            .map(|entry| {
                entry.unwrap_or(Entry::Leaf {
                    depth: CACHE_BITS,
                    leaf: Rc::new(Leaf::Terminator),
                })
            })
            .collect();
        Ok(Rc::new(Table { entries }))
    }

    fn fill(
        mem: &Memory,
        entries: &mut [Option<Entry>],
        node: u32,
        depth: u32,
        mask: usize,
        level: u32,
    ) -> anyhow::Result<()> {
        if mem.read1(node)? == 0 {
            if depth == CACHE_BITS {
                let table = Self::build_table(mem, node, level + 1)?;
                entries[mask] = Some(Entry::Table(table));
                return Ok(());
            }
            let left = mem.read4(node + 1)?;
            let right = mem.read4(node + 5)?;
            Self::fill(mem, entries, left, depth + 1, mask, level)?;
            Self::fill(mem, entries, right, depth + 1, mask | (1 << depth), level)?;
            return Ok(());
        }

        let leaf = Rc::new(Leaf::read(mem, node)?);
        let mut ix = mask;
        while ix < CACHE_SIZE {
            entries[ix] = Some(Entry::Leaf {
                depth,
                leaf: leaf.clone(),
            });
            ix += 1 << depth;
        }
        Ok(())
    }
}

/// Stub values pushed before the engine leaves a string: type, address
/// and program counter.
pub type Stub = (u32, u32, u32);

/// What the engine must do after printing the text of a step.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Action {
    /// Call the filter function with one character.
    Filter { ch: u32, stub: Stub },
    /// Print an embedded string, then resume.
    Substring { stub: Stub, addr: u32, kind: u32 },
    /// Follow an indirect reference, then resume.
    Indirect {
        stub: Stub,
        double: bool,
        data: u32,
        args: Vec<u32>,
    },
}

/// Compiled handling of one string position.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Step {
    /// Print the text; the string ends.
    Text(String),
    Action(String, Action),
}

type StringKey = (u32, u32, u32);

/// Cached information for one string table address.
#[derive(Debug)]
struct TextEnv {
    tree: Option<DecodingTree>,
    steps: HashMap<(IoSys, StringKey), Rc<Step>>,
}

/// All string tables seen so far, and the current one.
#[derive(Debug, Default)]
pub struct StringTables {
    current: u32,
    envs: HashMap<u32, TextEnv>,
    enabled: bool,
}

fn push_char(text: &mut String, ch: u32) {
    text.push(char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER));
}

impl StringTables {
    pub fn new(enabled: bool) -> Self {
        StringTables {
            enabled,
            ..Default::default()
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Make `addr` the current table, building its decoding tree when the
    /// whole table is in ROM.
    pub fn set_table(&mut self, mem: &Memory, addr: u32) -> anyhow::Result<()> {
        if self.current == addr {
            return Ok(());
        }
        self.current = addr;
        if addr == 0 || self.envs.contains_key(&addr) {
            return Ok(());
        }

        let len = mem.read4(addr)?;
        let root = mem.read4(addr + 8)?;
        let in_rom = addr as u64 + len as u64 <= mem.ram_start() as u64;
        let tree = if self.enabled && in_rom {
            debug!("building decoding tree for string table ${:X}", addr);
            Some(DecodingTree::build(mem, root)?)
        } else {
            None
        };
        self.envs.insert(
            addr,
            TextEnv {
                tree,
                steps: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Compile the string at `addr`. `kind` is 0 for the start of a string
    /// (its type byte is read), or the string type when resuming inside
    /// one; `bit` is the bit position for compressed strings.
    pub fn compile(
        &mut self,
        mem: &Memory,
        iosys: IoSys,
        addr: u32,
        kind: u32,
        bit: u32,
        stats: &mut Statistics,
    ) -> anyhow::Result<Rc<Step>> {
        let key = (addr, kind, bit);
        let env = self.envs.get(&self.current);
        let cacheable = env.map_or(false, |env| env.tree.is_some()) && addr < mem.ram_start();
        if cacheable {
            if let Some(step) = env.and_then(|env| env.steps.get(&(iosys, key))) {
                return Ok(step.clone());
            }
        }

        let tree = env.and_then(|env| env.tree.as_ref());
        let step = Rc::new(compile_string(mem, self.current, tree, iosys, addr, kind, bit)?);
        stats.strings_compiled += 1;

        if cacheable {
            if let Some(env) = self.envs.get_mut(&self.current) {
                env.steps.insert((iosys, key), step.clone());
                stats.strings_cached += 1;
            }
        }
        Ok(step)
    }
}

/// Decode from `addr` up to the end of the string or the first point
/// where the engine must act.
pub(crate) fn compile_string(
    mem: &Memory,
    table: u32,
    tree: Option<&DecodingTree>,
    iosys: IoSys,
    addr: u32,
    kind: u32,
    bit: u32,
) -> anyhow::Result<Step> {
    if addr == 0 {
        bail!("Attempt to print a string at address zero.");
    }

    let (kind, addr, bit) = if kind == 0 {
        let kind = mem.read1(addr)?;
        let skip = if kind == 0xE2 { 4 } else { 1 };
        (kind, addr + skip, 0)
    } else {
        (kind, addr, bit)
    };

    match kind {
        0xE1 => match tree {
            Some(tree) => walk_cached(mem, tree, iosys, addr, bit),
            None => walk_uncached(mem, table, iosys, addr, bit),
        },
        0xE0 | 0xE2 => {
            let width = if kind == 0xE0 { 1 } else { 4 };
            let read = |at: u32| if width == 1 { mem.read1(at) } else { mem.read4(at) };
            let mut text = String::new();
            match iosys {
                IoSys::Glk => {
                    let mut at = addr;
                    loop {
                        let ch = read(at)?;
                        if ch == 0 {
                            break;
                        }
                        push_char(&mut text, ch);
                        at += width;
                    }
                }
                IoSys::Filter => {
                    let ch = read(addr)?;
                    if ch != 0 {
                        let resume = if width == 1 {
                            dest::RESUME_CSTRING
                        } else {
                            dest::RESUME_UNISTRING
                        };
                        return Ok(Step::Action(
                            text,
                            Action::Filter {
                                ch,
                                stub: (resume, 0, addr + width),
                            },
                        ));
                    }
                }
                IoSys::Null => {}
            }
            Ok(Step::Text(text))
        }
        0xE0..=0xFF => bail!("Attempt to print unknown type of string."),
        _ => bail!("Attempt to print non-string."),
    }
}

/// Handle one leaf. Returns a step when decoding must stop.
fn leaf_step(
    mem: &Memory,
    iosys: IoSys,
    leaf: &Leaf,
    text: &mut String,
    addr: u32,
    bit: u32,
) -> anyhow::Result<Option<Step>> {
    let stub = (dest::RESUME_COMPRESSED, bit, addr);
    let step = match leaf {
        Leaf::Terminator => Some(Step::Text(std::mem::take(text))),
        Leaf::Char(ch) => match iosys {
            IoSys::Glk => {
                push_char(text, *ch);
                None
            }
            IoSys::Filter => Some(Step::Action(
                std::mem::take(text),
                Action::Filter { ch: *ch, stub },
            )),
            IoSys::Null => None,
        },
        Leaf::CString(at) | Leaf::UniCString(at) => {
            let width = if matches!(leaf, Leaf::CString(_)) { 1 } else { 4 };
            match iosys {
                IoSys::Glk => {
                    let mut at = *at;
                    loop {
                        let ch = if width == 1 { mem.read1(at)? } else { mem.read4(at)? };
                        if ch == 0 {
                            break;
                        }
                        push_char(text, ch);
                        at += width;
                    }
                    None
                }
                IoSys::Filter => Some(Step::Action(
                    std::mem::take(text),
                    Action::Substring {
                        stub,
                        addr: *at,
                        kind: if width == 1 { 0xE0 } else { 0xE2 },
                    },
                )),
                IoSys::Null => None,
            }
        }
        Leaf::Indirect { double, data, args } => Some(Step::Action(
            std::mem::take(text),
            Action::Indirect {
                stub,
                double: *double,
                data: *data,
                args: args.clone(),
            },
        )),
    };
    Ok(step)
}

fn walk_cached(
    mem: &Memory,
    tree: &DecodingTree,
    iosys: IoSys,
    mut addr: u32,
    mut bit: u32,
) -> anyhow::Result<Step> {
    let root = match tree {
        DecodingTree::Empty => return Ok(Step::Text(String::new())),
        DecodingTree::Root(root) => root.clone(),
    };

    let mut text = String::new();
    let mut bits = mem.read1(addr)? >> bit;
    let mut num_bits = 8 - bit;
    let mut read_ahead = false;
    let mut table = root.clone();

    loop {
        if num_bits < CACHE_BITS {
            bits |= mem.read1(addr + 1).unwrap_or(0) << num_bits;
            num_bits += 8;
            read_ahead = true;
        }

        let entry = table.entries[(bits & 0x0F) as usize].clone();
        let depth = entry.depth();
        num_bits -= depth;
        bits >>= depth;
        bit += depth;
        if bit >= 8 {
            addr += 1;
            bit -= 8;
            if read_ahead {
                read_ahead = false;
            } else {
                bits |= mem.read1(addr).unwrap_or(0) << num_bits;
                num_bits += 8;
            }
        }

        match entry {
            Entry::Table(sub) => table = sub,
            Entry::Leaf { leaf, .. } => {
                if let Some(step) = leaf_step(mem, iosys, &leaf, &mut text, addr, bit)? {
                    return Ok(step);
                }
                table = root.clone();
            }
        }
    }
}

fn walk_uncached(
    mem: &Memory,
    table: u32,
    iosys: IoSys,
    mut addr: u32,
    mut bit: u32,
) -> anyhow::Result<Step> {
    if table == 0 {
        bail!("Attempted to print a compressed string with no table set.");
    }
    let root = mem.read4(table + 8)?;
    let mut text = String::new();
    let mut byte = mem.read1(addr)? >> bit;
    let mut node = root;

    loop {
        if mem.read1(node)? == 0 {
            node = if byte & 1 != 0 {
                mem.read4(node + 5)?
            } else {
                mem.read4(node + 1)?
            };
            if bit == 7 {
                bit = 0;
                addr += 1;
                byte = mem.read1(addr)?;
            } else {
                bit += 1;
                byte >>= 1;
            }
            continue;
        }

        let leaf = Leaf::read(mem, node)?;
        if let Some(step) = leaf_step(mem, iosys, &leaf, &mut text, addr, bit)? {
            return Ok(step);
        }
        node = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::image;

    // String table at 0x60: root branch at 0x6C.
    //   0x6C branch -> left 0x75, right 0x77
    //   0x75 terminator, 0x76 pad
    //   0x77 branch -> left 0x80 ('a'), right 0x82 ('b')
    //   0x80 char 'a', 0x82 char 'b'
    // Compressed string at 0x90: E1, bits.
    fn table_image(bits: &[u8]) -> Memory {
        let mut extra = vec![];
        let put4 = |extra: &mut Vec<(usize, u8)>, at: usize, val: u32| {
            for (ix, b) in val.to_be_bytes().iter().enumerate() {
                extra.push((at + ix, *b));
            }
        };
        put4(&mut extra, 0x60, 0x30);
        put4(&mut extra, 0x64, 5);
        put4(&mut extra, 0x68, 0x6C);
        extra.push((0x6C, 0x00));
        put4(&mut extra, 0x6D, 0x75);
        put4(&mut extra, 0x71, 0x77);
        extra.push((0x75, 0x01));
        extra.push((0x77, 0x00));
        put4(&mut extra, 0x78, 0x80);
        put4(&mut extra, 0x7C, 0x82);
        extra.extend_from_slice(&[(0x80, 0x02), (0x81, b'a'), (0x82, 0x02), (0x83, b'b')]);
        extra.push((0x90, 0xE1));
        for (ix, b) in bits.iter().enumerate() {
            extra.push((0x91 + ix, *b));
        }
        extra.extend_from_slice(&[(0xA0, 0xE0), (0xA1, b'h'), (0xA2, b'i'), (0xA3, 0)]);
        Memory::load(image(&extra)).unwrap()
    }

    // "ab" then terminator: a = 1,0  b = 1,1  end = 0 (read LSB first)
    // bits: 1 0 1 1 0 -> byte 0b0000_1101
    const AB: [u8; 1] = [0b0000_1101];

    #[test]
    fn compressed_with_and_without_tree() {
        let mem = table_image(&AB);
        let mut stats = Statistics::default();

        let mut cached = StringTables::new(true);
        cached.set_table(&mem, 0x60).unwrap();
        let step = cached.compile(&mem, IoSys::Glk, 0x90, 0, 0, &mut stats).unwrap();
        assert_eq!(*step, Step::Text("ab".to_string()));

        let mut uncached = StringTables::new(false);
        uncached.set_table(&mem, 0x60).unwrap();
        let step = uncached.compile(&mem, IoSys::Glk, 0x90, 0, 0, &mut stats).unwrap();
        assert_eq!(*step, Step::Text("ab".to_string()));
    }

    #[test]
    fn steps_are_cached_per_mode() {
        let mem = table_image(&AB);
        let mut stats = Statistics::default();
        let mut tables = StringTables::new(true);
        tables.set_table(&mem, 0x60).unwrap();

        tables.compile(&mem, IoSys::Glk, 0x90, 0, 0, &mut stats).unwrap();
        tables.compile(&mem, IoSys::Glk, 0x90, 0, 0, &mut stats).unwrap();
        assert_eq!(stats.strings_compiled, 1);
        let step = tables.compile(&mem, IoSys::Null, 0x90, 0, 0, &mut stats).unwrap();
        assert_eq!(*step, Step::Text(String::new()));
        assert_eq!(stats.strings_compiled, 2);
        assert_eq!(stats.strings_cached, 2);
    }

    #[test]
    fn filter_mode_stops_at_each_character() {
        let mem = table_image(&AB);
        let mut stats = Statistics::default();
        for enabled in [true, false] {
            let mut tables = StringTables::new(enabled);
            tables.set_table(&mem, 0x60).unwrap();
            let step = tables.compile(&mem, IoSys::Filter, 0x90, 0, 0, &mut stats).unwrap();
            let expected = Step::Action(
                String::new(),
                Action::Filter {
                    ch: b'a' as u32,
                    stub: (dest::RESUME_COMPRESSED, 2, 0x91),
                },
            );
            assert_eq!(*step, expected);

            let step = tables.compile(&mem, IoSys::Filter, 0x91, 0xE1, 2, &mut stats).unwrap();
            let expected = Step::Action(
                String::new(),
                Action::Filter {
                    ch: b'b' as u32,
                    stub: (dest::RESUME_COMPRESSED, 4, 0x91),
                },
            );
            assert_eq!(*step, expected);
        }
    }

    #[test]
    fn plain_strings() {
        let mem = table_image(&AB);
        let step = compile_string(&mem, 0, None, IoSys::Glk, 0xA0, 0, 0).unwrap();
        assert_eq!(step, Step::Text("hi".to_string()));

        let step = compile_string(&mem, 0, None, IoSys::Filter, 0xA0, 0, 0).unwrap();
        assert_eq!(
            step,
            Step::Action(
                String::new(),
                Action::Filter {
                    ch: b'h' as u32,
                    stub: (dest::RESUME_CSTRING, 0, 0xA2),
                }
            )
        );

        let step = compile_string(&mem, 0, None, IoSys::Filter, 0xA3, 0xE0, 0).unwrap();
        assert_eq!(step, Step::Text(String::new()));

        assert!(compile_string(&mem, 0, None, IoSys::Glk, 0x60, 0, 0).is_err());
        assert!(compile_string(&mem, 0, None, IoSys::Glk, 0x90, 0, 0).is_err());
    }
}
