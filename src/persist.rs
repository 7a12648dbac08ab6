//! Saving and restoring machine state: save files and the undo chain.

use crate::{
    bytecode::Operand,
    heap::Heap,
    host::{Glk, IoSys},
    quetzal::{deserialize_frames, serialize_frame, xor_ram, QuetzalError, SaveFile, IFHD_LEN},
    stack::{Function, Stack},
    vm::{Flow, Snapshot, Vm},
};
use anyhow::bail;
use log::{debug, warn};
use std::rc::Rc;

/// A save file that passed every check, ready to be installed.
struct Restored {
    ram: Vec<u8>,
    stack: Stack,
    heap: Heap,
}

impl<H: Glk> Vm<H> {
    /// `save`: write the state to `stream`, storing 0 on success and 1 on
    /// failure. A later restore stores -1 through the same stub.
    pub(crate) fn save(&mut self, stream: u32, dest: Operand) -> anyhow::Result<Flow> {
        if self.iosys != IoSys::Glk {
            bail!("Streams are only available in Glk I/O system.");
        }
        self.push_callstub(dest)?;
        let bytes = self.save_file().to_bytes();
        let ok = self.host.write_save(stream, &bytes);
        debug!("saved {} bytes to stream {}: {}", bytes.len(), stream, ok);
        self.pop_callstub(if ok { 0 } else { 1 })?;
        Ok(Flow::Jump)
    }

    fn save_file(&self) -> SaveFile {
        let image = self.memory.image();
        let orig = image.get(self.memory.ram_start() as usize..).unwrap_or_default();

        let mut stks = Vec::new();
        for frame in &self.stack.frames {
            serialize_frame(frame, &mut stks);
        }

        SaveFile {
            ifhd: image[..IFHD_LEN].to_vec(),
            ram_xor: xor_ram(self.memory.ram(), orig),
            funcs: self.stack.frames.iter().map(|frame| frame.func.addr).collect(),
            stks,
            heap: self
                .heap
                .is_active()
                .then(|| (self.heap.start(), self.heap.used().to_vec())),
        }
    }

    /// `restore`: replace the state with the save file read from
    /// `stream`. On failure nothing changes and 1 is stored in `dest`.
    pub(crate) fn restore(&mut self, stream: u32, dest: Operand) -> anyhow::Result<Flow> {
        if self.iosys != IoSys::Glk {
            bail!("Streams are only available in Glk I/O system.");
        }
        let restored = match self.host.read_save(stream) {
            Some(bytes) => self.check_save(&bytes),
            None => Err(anyhow::anyhow!("stream {} holds no save data", stream)),
        };
        let restored = match restored {
            Ok(restored) => restored,
            Err(err) => {
                warn!("restore failed: {}", err);
                self.store(dest, 1)?;
                return Ok(Flow::Next);
            }
        };

        let protected = self.memory.copy_protected();
        self.memory.replace_ram(&restored.ram);
        self.memory.paste_protected(protected);
        self.stack = restored.stack;
        self.heap = restored.heap;
        debug!("restored from stream {}", stream);
        self.pop_callstub(0xFFFF_FFFF)?;
        Ok(Flow::Jump)
    }

    /// Parse and validate a save file against the running image.
    fn check_save(&mut self, bytes: &[u8]) -> anyhow::Result<Restored> {
        let save = SaveFile::from_bytes(bytes)?;
        let image = self.memory.image();
        if save.ifhd.as_slice() != &image[..IFHD_LEN] {
            return Err(QuetzalError::WrongGame.into());
        }

        let ram_start = self.memory.ram_start();
        let orig = image.get(ram_start as usize..).unwrap_or_default();
        let ram = xor_ram(&save.ram_xor, orig);
        let end_mem = ram_start as u64 + ram.len() as u64;
        if end_mem < self.memory.header().orig_end_mem as u64 || end_mem & 0xFF != 0 {
            return Err(QuetzalError::BadMemory(format!("memory size {:#x}", end_mem)).into());
        }
        let end_mem = end_mem as u32;

        // Functions in RAM are parsed from the memory being restored.
        let mut scratch = self.memory.clone();
        scratch.replace_ram(&ram);
        let mut funcs = Vec::with_capacity(save.funcs.len());
        for &addr in &save.funcs {
            let func = if addr < ram_start {
                self.function(addr)?
            } else {
                Rc::new(Function::parse(&scratch, addr)?)
            };
            funcs.push(func);
        }
        let frames = deserialize_frames(&save.stks, &funcs)?;
        if frames.is_empty() {
            return Err(QuetzalError::BadFrame("no frames".into()).into());
        }

        let heap = match save.heap {
            // The heap can only begin at or above the image's own memory.
            Some((start, blocks))
                if !blocks.is_empty() && start < self.memory.header().orig_end_mem =>
            {
                return Err(QuetzalError::BadHeap.into());
            }
            Some((start, blocks)) => {
                Heap::rebuild(start, blocks, end_mem).map_err(|_| QuetzalError::BadHeap)?
            }
            None => Heap::default(),
        };

        Ok(Restored {
            ram,
            stack: Stack { frames },
            heap,
        })
    }

    /// `saveundo`: push a snapshot, dropping the oldest beyond the
    /// configured depth. Stores 0, or -1 when the snapshot is restored.
    pub(crate) fn save_undo(&mut self, dest: Operand) -> anyhow::Result<Flow> {
        self.push_callstub(dest)?;
        self.undo.push_back(Snapshot {
            ram: self.memory.ram().to_vec(),
            pc: self.pc,
            stack: self.stack.clone(),
            heap: self.heap.clone(),
        });
        while self.undo.len() > self.options.undo_depth {
            self.undo.pop_front();
        }
        self.pop_callstub(0)?;
        Ok(Flow::Jump)
    }

    /// `restoreundo`: return to the newest snapshot. Stores 1 when there
    /// is none.
    pub(crate) fn restore_undo(&mut self, dest: Operand) -> anyhow::Result<Flow> {
        let Some(snapshot) = self.undo.pop_back() else {
            self.store(dest, 1)?;
            return Ok(Flow::Next);
        };

        let protected = self.memory.copy_protected();
        self.memory.replace_ram(&snapshot.ram);
        self.memory.paste_protected(protected);
        self.stack = snapshot.stack;
        self.heap = snapshot.heap;
        self.pc = snapshot.pc;
        self.pop_callstub(0xFFFF_FFFF)?;
        Ok(Flow::Jump)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        asm::assemble,
        host::BufferHost,
        quetzal::SaveFile,
        vm::{Status, Vm},
    };

    const SAVER: &str = r"
        .start main
        .func main c1 4:1
            setiosys 2 0
            copy 5 ram:0
            malloc 8 ram:20
            save 1 l0
            jeq l0 -1 >restored
            copy l0 ram:4
            copy 9 ram:0
            mfree ram:20
            restore 1 ram:8
            copy 77 ram:12
            return 0
        restored:
            add ram:16 1 ram:16
            return 0
        .ram
            .word 0 0 0 0 0 0
    ";

    fn vm(src: &str) -> Vm<BufferHost> {
        Vm::load(assemble(src).unwrap(), BufferHost::default()).unwrap()
    }

    fn read(vm: &Vm<BufferHost>, off: u32) -> u32 {
        vm.memory().read4(vm.memory().ram_start() + off).unwrap()
    }

    #[test]
    fn save_and_restore() {
        let mut vm = vm(SAVER);
        assert_eq!(vm.start().unwrap(), Status::Finished);
        assert!(vm.host().streams.contains_key(&1));
        assert_eq!(read(&vm, 0), 5);
        assert_eq!(read(&vm, 4), 0);
        assert_eq!(read(&vm, 12), 0);
        assert_eq!(read(&vm, 16), 1);
        // the heap block allocated before saving is live again
        assert_ne!(read(&vm, 20), 0);
        assert!(vm.memory().end_mem() > vm.memory().header().orig_end_mem);
    }

    #[test]
    fn save_to_unusable_stream() {
        let vm = {
            let mut vm = vm(r"
                .start main
                .func main c1
                    setiosys 2 0
                    save 0 ram:0
                    return 0
                .ram
                    .word 7
            ");
            vm.start().unwrap();
            vm
        };
        assert_eq!(read(&vm, 0), 1);
    }

    #[test]
    fn failed_restores_leave_state_alone() {
        let mut saver = vm(SAVER);
        saver.start().unwrap();
        let foreign = saver.host().streams[&1].clone();

        let mut vm = vm(r"
            .start main
            .func main c1
                setiosys 2 0
                copy 3 ram:0
                restore 1 ram:4
                restore 2 ram:8
                restore 3 ram:12
                copy 4 ram:16
                return 0
            .ram
                .word 0 0 0 0 0
        ");
        vm.host_mut().streams.insert(1, foreign);
        vm.host_mut().streams.insert(3, b"FORM".to_vec());
        assert_eq!(vm.start().unwrap(), Status::Finished);
        assert_eq!(read(&vm, 0), 3);
        assert_eq!(read(&vm, 4), 1);
        assert_eq!(read(&vm, 8), 1);
        assert_eq!(read(&vm, 12), 1);
        assert_eq!(read(&vm, 16), 4);
        assert!(vm.host().errors.is_empty());
    }

    #[test]
    fn heap_below_original_memory_is_refused() {
        const PROGRAM: &str = r"
            .start main
            .func main c1 4:1
                setiosys 2 0
                malloc 8 ram:20
                save 1 l0
                jeq l0 -1 >restored
                restore 2 ram:8
                return 0
            restored:
                copy 1 ram:16
                return 0
            .ram
                .word 0 0 0 0 0 0
        ";
        let mut first = vm(PROGRAM);
        first.start().unwrap();
        let bytes = first.host().streams[&1].clone();

        // an untouched save restores
        let mut vm1 = vm(PROGRAM);
        vm1.host_mut().streams.insert(2, bytes.clone());
        assert_eq!(vm1.start().unwrap(), Status::Finished);
        assert_eq!(read(&vm1, 16), 1);

        let mut save = SaveFile::from_bytes(&bytes).unwrap();
        let ram_start = first.memory().ram_start();
        let (_, blocks) = save.heap.take().unwrap();
        assert!(!blocks.is_empty());
        save.heap = Some((ram_start, blocks));

        let mut vm2 = vm(PROGRAM);
        vm2.host_mut().streams.insert(2, save.to_bytes());
        assert_eq!(vm2.start().unwrap(), Status::Finished);
        assert_eq!(read(&vm2, 8), 1);
        assert_eq!(read(&vm2, 16), 0);
        assert!(vm2.host().errors.is_empty());
    }

    #[test]
    fn save_needs_glk_output() {
        let mut vm = vm(r"
            .start main
            .func main c1
                save 1 discard
                return 0
        ");
        assert!(vm.start().is_err());
        assert_eq!(
            vm.host().errors,
            vec!["Streams are only available in Glk I/O system.".to_string()]
        );
    }

    #[test]
    fn undo_depth_zero_keeps_nothing() {
        let image = assemble(r"
            .start main
            .func main c1
                saveundo ram:0
                restoreundo ram:4
                return 0
            .ram
                .word 9 9
        ")
        .unwrap();
        let options = crate::vm::VmOptions {
            undo_depth: 0,
            ..Default::default()
        };
        let mut vm = Vm::with_options(image, BufferHost::default(), options).unwrap();
        vm.start().unwrap();
        assert_eq!(read(&vm, 0), 0);
        assert_eq!(read(&vm, 4), 1);
        assert_eq!(vm.undo_count(), 0);
    }
}
