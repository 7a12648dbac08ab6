use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use gvm::{
    host::{Glk, GlkResult},
    memory::Memory,
    Status, Vm, VmOptions,
};
use log::warn;

/// Run a program image, or assemble and run a `.gasm` source file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Image or assembler source
    program: PathBuf,

    /// Number of undo snapshots to keep
    #[arg(long, default_value_t = 10)]
    undo_depth: usize,

    /// Disable the compiled path cache
    #[arg(long)]
    no_path_cache: bool,

    /// Disable decoding trees and compiled strings
    #[arg(long)]
    no_string_cache: bool,

    /// Check heap consistency after every allocation
    #[arg(long)]
    check_heap: bool,

    /// Seed for a repeatable random sequence
    #[arg(long)]
    seed: Option<u32>,

    /// Directory for save files
    #[arg(long, default_value = ".")]
    save_dir: PathBuf,
}

/// Host that prints to stdout and keeps save streams as files.
struct StdoutHost {
    out: io::Stdout,
    save_dir: PathBuf,
}

impl StdoutHost {
    fn save_path(&self, stream: u32) -> PathBuf {
        self.save_dir.join(format!("save-{}.glksave", stream))
    }
}

impl Glk for StdoutHost {
    fn put_char(&mut self, ch: u8) {
        let mut buf = [0; 4];
        let _ = self.out.write_all((ch as char).encode_utf8(&mut buf).as_bytes());
    }

    fn put_char_uni(&mut self, ch: u32) {
        let ch = char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER);
        let mut buf = [0; 4];
        let _ = self.out.write_all(ch.encode_utf8(&mut buf).as_bytes());
    }

    fn put_string(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    fn call(&mut self, _mem: &mut Memory, selector: u32, args: &[u32]) -> anyhow::Result<GlkResult> {
        warn!("unsupported glk selector {:#x} {:?}", selector, args);
        Ok(GlkResult::Value(0))
    }

    fn write_save(&mut self, stream: u32, data: &[u8]) -> bool {
        fs::write(self.save_path(stream), data).is_ok()
    }

    fn read_save(&mut self, stream: u32) -> Option<Vec<u8>> {
        fs::read(self.save_path(stream)).ok()
    }

    fn fatal_error(&mut self, msg: &str) {
        let _ = self.out.flush();
        eprintln!("\nGlulx fatal error: {}", msg);
    }

    fn exit(&mut self) {
        let _ = self.out.flush();
    }
}

fn load(path: &Path) -> anyhow::Result<Vec<u8>> {
    if path.extension().map_or(false, |ext| ext == "gasm") {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        gvm::asm::assemble(&source)
    } else {
        fs::read(path).with_context(|| format!("reading {}", path.display()))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let image = load(&args.program)?;
    let options = VmOptions {
        undo_depth: args.undo_depth,
        cache_paths: !args.no_path_cache,
        cache_strings: !args.no_string_cache,
        check_heap: args.check_heap,
        random_seed: args.seed,
    };
    let host = StdoutHost {
        out: io::stdout(),
        save_dir: args.save_dir,
    };

    let mut vm = Vm::with_options(image, host, options)?;
    let status = vm.start()?;
    if status == Status::Suspended {
        println!("\nProgram is waiting for input that this runner cannot provide.");
    }

    let stats = vm.statistics();
    log::info!(
        "{} function calls ({} accelerated), {} paths run, {} compiled",
        stats.total_function_calls,
        stats.accel_function_calls,
        stats.total_path_calls,
        stats.paths_compiled
    );
    println!("\nProcess is finished with status: {:?}", status);
    Ok(())
}
