//! Main memory of the machine: the loaded image, its header and the
//! resizable RAM above `ram_start`.

use anyhow::{anyhow, bail};

/// 'Glul'
pub const MAGIC: u32 = 0x476C_756C;
pub const HEADER_LEN: usize = 36;

const MIN_VERSION: u32 = 0x0002_0000;
const MAX_VERSION: u32 = 0x0003_0200;

/// Fields of the 36-byte image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub ram_start: u32,
    pub end_game_file: u32,
    pub orig_end_mem: u32,
    /// Informational only. Stacks grow on demand.
    pub stack_size: u32,
    pub start_func: u32,
    pub string_table: u32,
    pub checksum: u32,
}

impl Header {
    /// Parse and validate the header of `image`.
    pub fn parse(image: &[u8]) -> anyhow::Result<Self> {
        if image.len() < HEADER_LEN {
            bail!("This is too short to be a valid image.");
        }
        if read_be(image, 0) != MAGIC {
            bail!("This is not a valid image file.");
        }
        let version = read_be(image, 4);
        if version < MIN_VERSION {
            bail!("This image is too old a version to execute.");
        }
        if version >= MAX_VERSION {
            bail!("This image is too new a version to execute.");
        }

        let header = Header {
            version,
            ram_start: read_be(image, 8),
            end_game_file: read_be(image, 12),
            orig_end_mem: read_be(image, 16),
            stack_size: read_be(image, 20),
            start_func: read_be(image, 24),
            string_table: read_be(image, 28),
            checksum: read_be(image, 32),
        };

        if header.ram_start < 0x100
            || header.end_game_file < header.ram_start
            || header.orig_end_mem < header.end_game_file
        {
            bail!("The segment boundaries in the header are in an impossible order.");
        }
        if header.end_game_file as usize != image.len() {
            bail!("The image length does not agree with the header.");
        }

        Ok(header)
    }
}

fn read_be(bytes: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
}

/// Contents of the protected range, copied out before memory is replaced.
#[derive(Debug, Clone)]
pub struct Protected {
    start: u32,
    end: u32,
    bytes: Vec<u8>,
}

/// The byte-addressable address space.
#[derive(Debug, Clone)]
pub struct Memory {
    image: Vec<u8>,
    header: Header,
    bytes: Vec<u8>,
    protect_start: u32,
    protect_end: u32,
}

impl Memory {
    /// Validate `image` and build memory in its initial state.
    pub fn load(image: Vec<u8>) -> anyhow::Result<Self> {
        let header = Header::parse(&image)?;
        let mut memory = Memory {
            image,
            header,
            bytes: Vec::new(),
            protect_start: 0,
            protect_end: 0,
        };
        memory.reset();
        Ok(memory)
    }

    /// Rebuild memory from the original image. The protected range is not
    /// carried over here; see [`Memory::copy_protected`].
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.bytes
            .extend_from_slice(&self.image[..self.header.end_game_file as usize]);
        self.bytes.resize(self.header.orig_end_mem as usize, 0);
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn ram_start(&self) -> u32 {
        self.header.ram_start
    }

    pub fn end_mem(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn check(&self, addr: u32, len: u32) -> anyhow::Result<usize> {
        match addr.checked_add(len) {
            Some(end) if end as usize <= self.bytes.len() => Ok(addr as usize),
            _ => Err(anyhow!("Memory access out of range (${:X}).", addr)),
        }
    }

    fn check_write(&self, addr: u32, len: u32) -> anyhow::Result<usize> {
        if addr < self.header.ram_start {
            bail!("Attempt to write to read-only memory (${:X}).", addr);
        }
        self.check(addr, len)
    }

    pub fn read1(&self, addr: u32) -> anyhow::Result<u32> {
        let pos = self.check(addr, 1)?;
        Ok(self.bytes[pos] as u32)
    }

    pub fn read2(&self, addr: u32) -> anyhow::Result<u32> {
        let pos = self.check(addr, 2)?;
        Ok(u16::from_be_bytes([self.bytes[pos], self.bytes[pos + 1]]) as u32)
    }

    pub fn read4(&self, addr: u32) -> anyhow::Result<u32> {
        let pos = self.check(addr, 4)?;
        Ok(read_be(&self.bytes, pos))
    }

    pub fn write1(&mut self, addr: u32, val: u32) -> anyhow::Result<()> {
        let pos = self.check_write(addr, 1)?;
        self.bytes[pos] = val as u8;
        Ok(())
    }

    pub fn write2(&mut self, addr: u32, val: u32) -> anyhow::Result<()> {
        let pos = self.check_write(addr, 2)?;
        self.bytes[pos..pos + 2].copy_from_slice(&(val as u16).to_be_bytes());
        Ok(())
    }

    pub fn write4(&mut self, addr: u32, val: u32) -> anyhow::Result<()> {
        let pos = self.check_write(addr, 4)?;
        self.bytes[pos..pos + 4].copy_from_slice(&val.to_be_bytes());
        Ok(())
    }

    /// Read `len` bytes starting at `addr`.
    pub fn slice(&self, addr: u32, len: u32) -> anyhow::Result<&[u8]> {
        let pos = self.check(addr, len)?;
        Ok(&self.bytes[pos..pos + len as usize])
    }

    /// Change the size of memory. New bytes are zeroed.
    ///
    /// Callers that are not the heap allocator must refuse first when the
    /// heap is active.
    pub fn resize(&mut self, new_len: u32) -> anyhow::Result<()> {
        if new_len == self.end_mem() {
            return Ok(());
        }
        if new_len < self.header.orig_end_mem {
            bail!("Cannot resize memory space smaller than it started.");
        }
        if new_len & 0xFF != 0 {
            bail!("Can only resize memory space to a 256-byte boundary.");
        }
        self.bytes.resize(new_len as usize, 0);
        Ok(())
    }

    /// Set the protected range. An empty range turns protection off.
    pub fn protect(&mut self, start: u32, len: u32) {
        let end = start.wrapping_add(len);
        if start == end {
            self.protect_start = 0;
            self.protect_end = 0;
        } else {
            self.protect_start = start;
            self.protect_end = end;
        }
    }

    pub fn protected_range(&self) -> (u32, u32) {
        (self.protect_start, self.protect_end)
    }

    /// Copy the protected range out. Bytes beyond the end of memory are
    /// taken as zero.
    pub fn copy_protected(&self) -> Option<Protected> {
        if self.protect_start >= self.protect_end {
            return None;
        }
        let len = (self.protect_end - self.protect_start) as usize;
        let mut bytes = Vec::with_capacity(len);
        for ix in 0..len {
            let addr = self.protect_start as usize + ix;
            bytes.push(self.bytes.get(addr).copied().unwrap_or(0));
        }
        Some(Protected {
            start: self.protect_start,
            end: self.protect_end,
            bytes,
        })
    }

    /// Write a previously copied range back, clipped to the end of memory.
    pub fn paste_protected(&mut self, protected: Option<Protected>) {
        let Some(protected) = protected else {
            return;
        };
        let end = protected.end.min(self.end_mem());
        for (ix, addr) in (protected.start..end).enumerate() {
            self.bytes[addr as usize] = protected.bytes[ix];
        }
    }

    /// RAM contents, from `ram_start` to the end of memory.
    pub fn ram(&self) -> &[u8] {
        &self.bytes[self.header.ram_start as usize..]
    }

    /// Replace everything from `ram_start` on with `ram`.
    pub fn replace_ram(&mut self, ram: &[u8]) {
        self.bytes.truncate(self.header.ram_start as usize);
        self.bytes.extend_from_slice(ram);
    }

    /// Checksum test of the original image: 0 on success, 1 on failure.
    pub fn verify(&self) -> u32 {
        let len = self.image.len();
        if len < 0x100 || len & 0xFF != 0 {
            return 1;
        }
        if len as u32 != read_be(&self.image, 12) {
            return 1;
        }
        let checksum = read_be(&self.image, 32);
        let sum = (0..len)
            .step_by(4)
            .fold(checksum.wrapping_neg(), |sum, pos| {
                sum.wrapping_add(read_be(&self.image, pos))
            });
        if sum == checksum {
            0
        } else {
            1
        }
    }

    /// Hex fingerprint of the first 64 image bytes.
    pub fn signature(&self) -> String {
        self.image
            .iter()
            .take(64)
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}
