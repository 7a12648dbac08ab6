//! Table searches used by `linearsearch`, `binarysearch` and `linkedsearch`.

use crate::memory::Memory;
use anyhow::bail;
use std::cmp::Ordering;

const KEY_INDIRECT: u32 = 1;
const ZERO_KEY_TERMINATES: u32 = 2;
const RETURN_INDEX: u32 = 4;

/// A search key, read once before the table walk.
#[derive(Debug, Clone)]
pub struct Key {
    bytes: Vec<u8>,
    options: u32,
}

impl Key {
    /// With the indirect option `key` is the address of the key bytes;
    /// otherwise the key is the value itself and must be 1, 2 or 4 bytes.
    pub fn fetch(mem: &Memory, key: u32, size: u32, options: u32) -> anyhow::Result<Self> {
        let bytes = if options & KEY_INDIRECT != 0 {
            mem.slice(key, size)?.to_vec()
        } else {
            match size {
                1 => vec![key as u8],
                2 => (key as u16).to_be_bytes().to_vec(),
                4 => key.to_be_bytes().to_vec(),
                _ => bail!("Direct search key must hold one, two, or four bytes."),
            }
        };
        Ok(Key { bytes, options })
    }

    fn compare(&self, mem: &Memory, addr: u32) -> anyhow::Result<Ordering> {
        let entry = mem.slice(addr, self.bytes.len() as u32)?;
        Ok(entry.cmp(&self.bytes[..]))
    }

    fn is_zero_at(&self, mem: &Memory, addr: u32) -> anyhow::Result<bool> {
        let entry = mem.slice(addr, self.bytes.len() as u32)?;
        Ok(entry.iter().all(|b| *b == 0))
    }

    fn has(&self, option: u32) -> bool {
        self.options & option != 0
    }

    fn not_found(&self) -> u32 {
        if self.has(RETURN_INDEX) {
            0xFFFF_FFFF
        } else {
            0
        }
    }
}

pub fn linear(
    mem: &Memory,
    key: &Key,
    start: u32,
    struct_size: u32,
    num_structs: u32,
    key_offset: u32,
) -> anyhow::Result<u32> {
    let mut addr = start;
    let mut count = 0;
    while count < num_structs {
        let at = addr.wrapping_add(key_offset);
        if key.compare(mem, at)? == Ordering::Equal {
            return Ok(if key.has(RETURN_INDEX) { count } else { addr });
        }
        if key.has(ZERO_KEY_TERMINATES) && key.is_zero_at(mem, at)? {
            break;
        }
        count += 1;
        addr = addr.wrapping_add(struct_size);
    }
    Ok(key.not_found())
}

/// Search a table sorted by key, compared as big-endian unsigned bytes.
pub fn binary(
    mem: &Memory,
    key: &Key,
    start: u32,
    struct_size: u32,
    num_structs: u32,
    key_offset: u32,
) -> anyhow::Result<u32> {
    let (mut bot, mut top) = (0u32, num_structs);
    while bot < top {
        let val = ((bot as u64 + top as u64) / 2) as u32;
        let addr = start.wrapping_add(val.wrapping_mul(struct_size));
        match key.compare(mem, addr.wrapping_add(key_offset))? {
            Ordering::Equal => return Ok(if key.has(RETURN_INDEX) { val } else { addr }),
            Ordering::Less => bot = val + 1,
            Ordering::Greater => top = val,
        }
    }
    Ok(key.not_found())
}

/// Follow a chain of structures through the word at `next_offset`.
/// Returns the matching address or zero.
pub fn linked(
    mem: &Memory,
    key: &Key,
    start: u32,
    key_offset: u32,
    next_offset: u32,
) -> anyhow::Result<u32> {
    let mut addr = start;
    while addr != 0 {
        let at = addr.wrapping_add(key_offset);
        if key.compare(mem, at)? == Ordering::Equal {
            return Ok(addr);
        }
        if key.has(ZERO_KEY_TERMINATES) && key.is_zero_at(mem, at)? {
            break;
        }
        addr = mem.read4(addr.wrapping_add(next_offset))?;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::image;

    // Eight 4-byte structs at 0x60: key word at offset 2 (two bytes).
    fn table() -> Memory {
        let mut extra = vec![];
        for (ix, key) in [3u16, 7, 11, 20, 21, 40, 0, 99].iter().enumerate() {
            let at = 0x60 + ix * 4;
            extra.push((at + 2, (key >> 8) as u8));
            extra.push((at + 3, *key as u8));
        }
        // Linked list: 0x90 -> 0xA0 -> 0xB0 -> end. Key byte at +0,
        // next pointer at +4.
        for (at, key, next) in [(0x90usize, 5u8, 0xA0u8), (0xA0, 6, 0xB0), (0xB0, 7, 0)] {
            extra.push((at, key));
            extra.push((at + 7, next));
        }
        extra.push((0xC0, 0));
        extra.push((0xC1, 40));
        Memory::load(image(&extra)).unwrap()
    }

    #[test]
    fn linear_search() {
        let mem = table();
        let key = Key::fetch(&mem, 21, 2, 0).unwrap();
        assert_eq!(linear(&mem, &key, 0x60, 4, 8, 2).unwrap(), 0x70);
        let key = Key::fetch(&mem, 21, 2, RETURN_INDEX).unwrap();
        assert_eq!(linear(&mem, &key, 0x60, 4, 8, 2).unwrap(), 4);

        let key = Key::fetch(&mem, 99, 2, RETURN_INDEX).unwrap();
        assert_eq!(linear(&mem, &key, 0x60, 4, 8, 2).unwrap(), 7);
        let key = Key::fetch(&mem, 99, 2, RETURN_INDEX | ZERO_KEY_TERMINATES).unwrap();
        assert_eq!(linear(&mem, &key, 0x60, 4, 8, 2).unwrap(), 0xFFFF_FFFF);
        let key = Key::fetch(&mem, 99, 2, ZERO_KEY_TERMINATES).unwrap();
        assert_eq!(linear(&mem, &key, 0x60, 4, 0xFFFF_FFFF, 2).unwrap(), 0);
    }

    #[test]
    fn binary_search() {
        let mem = table();
        let key = Key::fetch(&mem, 11, 2, RETURN_INDEX).unwrap();
        assert_eq!(binary(&mem, &key, 0x60, 4, 6, 2).unwrap(), 2);
        for (ix, k) in [3u32, 7, 11, 20, 21, 40].iter().enumerate() {
            let key = Key::fetch(&mem, *k, 2, 0).unwrap();
            assert_eq!(binary(&mem, &key, 0x60, 4, 6, 2).unwrap(), 0x60 + 4 * ix as u32);
        }
        let key = Key::fetch(&mem, 12, 2, 0).unwrap();
        assert_eq!(binary(&mem, &key, 0x60, 4, 6, 2).unwrap(), 0);

        let key = Key::fetch(&mem, 0xC0, 2, KEY_INDIRECT | RETURN_INDEX).unwrap();
        assert_eq!(binary(&mem, &key, 0x60, 4, 6, 2).unwrap(), 5);
    }

    #[test]
    fn linked_search() {
        let mem = table();
        let key = Key::fetch(&mem, 6, 1, 0).unwrap();
        assert_eq!(linked(&mem, &key, 0x90, 0, 4).unwrap(), 0xA0);
        let key = Key::fetch(&mem, 8, 1, 0).unwrap();
        assert_eq!(linked(&mem, &key, 0x90, 0, 4).unwrap(), 0);
    }

    #[test]
    fn direct_key_size() {
        let mem = table();
        assert!(Key::fetch(&mem, 1, 3, 0).is_err());
        assert!(Key::fetch(&mem, 0x60, 3, KEY_INDIRECT).is_ok());
    }
}
