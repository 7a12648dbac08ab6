//! Save file format: IFF chunks inside a `FORM`/`IFZS` container.
//!
//! Chunks written:
//!
//! | id     | contents                                            |
//! |--------|-----------------------------------------------------|
//! | `IFhd` | first 128 bytes of the original image               |
//! | `CMem` | RAM xor original image, run-length encoded          |
//! | `QFun` | function address of each frame, bottom first        |
//! | `Stks` | serialized frames, bottom first                     |
//! | `MAll` | heap start, block count, (addr, size) pairs         |

use crate::{
    heap::Block,
    stack::{Frame, Function},
};
use std::{collections::BTreeMap, rc::Rc};
use thiserror::Error;

pub const IFHD_LEN: usize = 128;

pub type ChunkId = [u8; 4];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuetzalError {
    #[error("IFF chunk is truncated")]
    Truncated,
    #[error("file doesn't start with FORM/IFZS header")]
    NotQuetzal,
    #[error("missing required {0} chunk")]
    MissingChunk(&'static str),
    #[error("this save image is for a different game")]
    WrongGame,
    #[error("bad memory chunk: {0}")]
    BadMemory(String),
    #[error("bad stack frame: {0}")]
    BadFrame(String),
    #[error("corrupt dynamic heap")]
    BadHeap,
}

/// Run-length encode `data`: each run of up to 256 zeros becomes a zero
/// byte followed by the run length minus one.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut i = 0;
    while i < data.len() {
        let mut zeros = 0usize;
        while i < data.len() && data[i] == 0 && zeros < 256 {
            zeros += 1;
            i += 1;
        }
        if zeros > 0 {
            out.push(0);
            out.push((zeros - 1) as u8);
        }
        while i < data.len() && data[i] != 0 {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, QuetzalError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut bytes = data.iter();
    while let Some(&b) = bytes.next() {
        if b == 0 {
            let count = *bytes.next().ok_or(QuetzalError::Truncated)? as usize + 1;
            out.resize(out.len() + count, 0);
        } else {
            out.push(b);
        }
    }
    Ok(out)
}

/// Xor `ram` against the original image bytes. Bytes past the end of
/// `orig` are taken as-is.
pub fn xor_ram(ram: &[u8], orig: &[u8]) -> Vec<u8> {
    ram.iter()
        .enumerate()
        .map(|(ix, b)| b ^ orig.get(ix).copied().unwrap_or(0))
        .collect()
}

/// Chunks in id order: id, big-endian length, data.
pub fn pack_chunks(chunks: &BTreeMap<ChunkId, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, data) in chunks {
        out.extend_from_slice(id);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
    }
    out
}

pub fn unpack_chunks(bytes: &[u8]) -> Result<BTreeMap<ChunkId, Vec<u8>>, QuetzalError> {
    let mut chunks = BTreeMap::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if pos + 8 > bytes.len() {
            return Err(QuetzalError::Truncated);
        }
        let id = [bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]];
        let size = read4(bytes, pos + 4)? as usize;
        pos += 8;
        let end = pos.checked_add(size).ok_or(QuetzalError::Truncated)?;
        if end > bytes.len() {
            return Err(QuetzalError::Truncated);
        }
        chunks.insert(id, bytes[pos..end].to_vec());
        pos = end;
    }
    Ok(chunks)
}

fn read4(bytes: &[u8], pos: usize) -> Result<u32, QuetzalError> {
    bytes
        .get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(QuetzalError::Truncated)
}

fn push4(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_be_bytes());
}

/// Append `frame` as laid out on the machine stack.
pub fn serialize_frame(frame: &Frame, out: &mut Vec<u8>) {
    let start = out.len();
    let func = &frame.func;
    push4(out, frame.frame_len());
    push4(out, func.locals_pos());
    out.extend_from_slice(&func.raw_format);

    for slot in &func.slots {
        let val = frame.locals[slot.pos as usize];
        while (out.len() - start) % slot.size as usize != 0 {
            out.push(0);
        }
        match slot.size {
            4 => push4(out, val),
            2 => out.extend_from_slice(&(val as u16).to_be_bytes()),
            _ => out.push(val as u8),
        }
    }
    while (out.len() - start) % 4 != 0 {
        out.push(0);
    }

    for &val in &frame.values {
        push4(out, val);
    }
}

/// Rebuild frames from `stks`, top frame first. Each frame's trailing
/// word is its own start offset, left there by the call stub pushed
/// before saving.
pub fn deserialize_frames(
    stks: &[u8],
    funcs: &[Rc<Function>],
) -> Result<Vec<Frame>, QuetzalError> {
    let mut end = stks.len();
    let mut frames = Vec::with_capacity(funcs.len());
    for func in funcs.iter().rev() {
        if end < 4 || end % 4 != 0 {
            return Err(QuetzalError::BadFrame("stack is truncated".into()));
        }
        let start = read4(stks, end - 4)? as usize;
        if start >= end {
            return Err(QuetzalError::BadFrame(format!("bad frame pointer {}", start)));
        }
        let bytes = &stks[start..end];

        let frame_len = read4(bytes, 0)?;
        let locals_pos = read4(bytes, 4)?;
        if locals_pos != func.locals_pos() {
            return Err(QuetzalError::BadFrame(format!(
                "LocalsPos {} doesn't match function (${:X})",
                locals_pos, func.addr
            )));
        }
        if frame_len != func.frame_len() || frame_len as usize > bytes.len() {
            return Err(QuetzalError::BadFrame(format!(
                "FrameLen {} doesn't match function (${:X})",
                frame_len, func.addr
            )));
        }

        let mut frame = Frame::new(func.clone(), start as u32);
        for slot in &func.slots {
            let at = (locals_pos + slot.pos) as usize;
            frame.locals[slot.pos as usize] = match slot.size {
                4 => read4(bytes, at)?,
                2 => u16::from_be_bytes([bytes[at], bytes[at + 1]]) as u32,
                _ => bytes[at] as u32,
            };
        }
        let mut pos = frame_len as usize;
        while pos < bytes.len() {
            frame.values.push(read4(bytes, pos)?);
            pos += 4;
        }

        frames.push(frame);
        end = start;
    }
    if end != 0 {
        return Err(QuetzalError::BadFrame("unused data below the first frame".into()));
    }
    frames.reverse();
    Ok(frames)
}

/// Contents of a save file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFile {
    pub ifhd: Vec<u8>,
    /// RAM xor the original image, uncompressed.
    pub ram_xor: Vec<u8>,
    pub funcs: Vec<u32>,
    pub stks: Vec<u8>,
    pub heap: Option<(u32, Vec<Block>)>,
}

impl SaveFile {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut chunks = BTreeMap::new();
        chunks.insert(*b"IFhd", self.ifhd.clone());
        chunks.insert(*b"CMem", compress(&self.ram_xor));
        let mut qfun = Vec::with_capacity(4 * self.funcs.len());
        for &addr in &self.funcs {
            push4(&mut qfun, addr);
        }
        chunks.insert(*b"QFun", qfun);
        chunks.insert(*b"Stks", self.stks.clone());
        if let Some((start, blocks)) = &self.heap {
            let mut mall = Vec::new();
            push4(&mut mall, *start);
            push4(&mut mall, blocks.len() as u32);
            for block in blocks {
                push4(&mut mall, block.addr);
                push4(&mut mall, block.size);
            }
            chunks.insert(*b"MAll", mall);
        }

        let mut payload = b"IFZS".to_vec();
        payload.extend(pack_chunks(&chunks));
        let mut form = BTreeMap::new();
        form.insert(*b"FORM", payload);
        pack_chunks(&form)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, QuetzalError> {
        let mut outer = unpack_chunks(bytes)?;
        let form = outer.remove(b"FORM").ok_or(QuetzalError::NotQuetzal)?;
        if form.get(..4) != Some(&b"IFZS"[..]) {
            return Err(QuetzalError::NotQuetzal);
        }
        let mut chunks = unpack_chunks(&form[4..])?;

        let ifhd = chunks.remove(b"IFhd").ok_or(QuetzalError::MissingChunk("IFhd"))?;
        let cmem = chunks.remove(b"CMem").ok_or(QuetzalError::MissingChunk("CMem"))?;
        let qfun = chunks.remove(b"QFun").ok_or(QuetzalError::MissingChunk("QFun"))?;
        let stks = chunks.remove(b"Stks").ok_or(QuetzalError::MissingChunk("Stks"))?;

        if qfun.len() % 4 != 0 {
            return Err(QuetzalError::Truncated);
        }
        let funcs = (0..qfun.len())
            .step_by(4)
            .map(|pos| read4(&qfun, pos))
            .collect::<Result<Vec<_>, _>>()?;

        let heap = match chunks.remove(b"MAll") {
            Some(mall) => {
                let start = read4(&mall, 0)?;
                let count = read4(&mall, 4)? as usize;
                let blocks = (0..count)
                    .map(|ix| {
                        Ok(Block {
                            addr: read4(&mall, 8 + 8 * ix)?,
                            size: read4(&mall, 12 + 8 * ix)?,
                        })
                    })
                    .collect::<Result<Vec<_>, QuetzalError>>()?;
                Some((start, blocks))
            }
            None => None,
        };

        Ok(SaveFile {
            ifhd,
            ram_xor: decompress(&cmem)?,
            funcs,
            stks,
            heap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Memory, stack::Stack};
    use proptest::prelude::*;

    #[test]
    fn run_length_encoding() {
        assert_eq!(compress(&[1, 0, 0, 0, 2]), vec![1, 0, 2, 2]);
        assert_eq!(compress(&[0; 300]), vec![0, 255, 0, 43]);
        assert_eq!(decompress(&[0, 255, 0, 43]).unwrap(), vec![0; 300]);
        assert_eq!(decompress(&[5, 0]), Err(QuetzalError::Truncated));
    }

    #[test]
    fn chunk_containers() {
        let mut chunks = BTreeMap::new();
        chunks.insert(*b"ZZZZ", vec![1]);
        chunks.insert(*b"AAAA", vec![2, 3]);
        let bytes = pack_chunks(&chunks);
        assert_eq!(&bytes[..4], b"AAAA");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 2]);
        assert_eq!(unpack_chunks(&bytes).unwrap(), chunks);
        assert_eq!(
            unpack_chunks(&bytes[..bytes.len() - 1]),
            Err(QuetzalError::Truncated)
        );
    }

    #[test]
    fn missing_chunks() {
        let file = SaveFile {
            ifhd: vec![1; 128],
            ram_xor: vec![],
            funcs: vec![],
            stks: vec![],
            heap: None,
        };
        let bytes = file.to_bytes();
        assert_eq!(SaveFile::from_bytes(&bytes).unwrap(), file);
        let mut chunks = BTreeMap::new();
        chunks.insert(*b"FORM", b"XXXX".to_vec());
        assert_eq!(
            SaveFile::from_bytes(&pack_chunks(&chunks)),
            Err(QuetzalError::NotQuetzal)
        );

        let mut chunks = BTreeMap::new();
        chunks.insert(*b"FORM", b"IFZS".to_vec());
        assert_eq!(
            SaveFile::from_bytes(&pack_chunks(&chunks)),
            Err(QuetzalError::MissingChunk("IFhd"))
        );
    }

    #[test]
    fn frames() {
        // 0x40: local-argument function with one byte, one word and one
        // short local. 0x50: stack-argument function without locals.
        let image = crate::memory::tests::image(&[
            (0x40, 0xC1),
            (0x41, 1),
            (0x42, 1),
            (0x43, 4),
            (0x44, 1),
            (0x45, 2),
            (0x46, 1),
            (0x50, 0xC0),
        ]);
        let mem = Memory::load(image).unwrap();
        let outer = Rc::new(Function::parse(&mem, 0x40).unwrap());
        let inner = Rc::new(Function::parse(&mem, 0x50).unwrap());

        let mut stack = Stack::default();
        let frame = stack.enter(outer.clone());
        frame.fill_locals(&[0x1FF, 0xDEADBEEF, 0x12345]);
        frame.push(7);
        frame.push_stub(0, 0, 0x99);
        let frame = stack.enter(inner.clone());
        frame.push(1);
        frame.push_stub(3, 0, 0x77);

        let mut stks = Vec::new();
        for frame in &stack.frames {
            serialize_frame(frame, &mut stks);
        }
        assert_eq!(stks.len() as u32, stack.frames[1].end());

        let frames = deserialize_frames(&stks, &[outer.clone(), inner.clone()]).unwrap();
        assert_eq!(frames, stack.frames);
        assert_eq!(frames[0].local(4, 4).unwrap(), 0xDEADBEEF);

        assert!(matches!(
            deserialize_frames(&stks, &[inner.clone(), inner]),
            Err(QuetzalError::BadFrame(_))
        ));
    }

    proptest! {
        #[test]
        fn rle_round_trip(data in proptest::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 0..2000)) {
            prop_assert_eq!(decompress(&compress(&data)).unwrap(), data);
        }
    }
}
