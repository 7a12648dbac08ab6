//! Native replacements for common library routines, enabled by
//! `accelfunc` and configured by `accelparam`.

use crate::{memory::Memory, search};
use log::debug;
use std::collections::HashMap;

pub const NUM_PARAMS: usize = 9;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AccelFunc {
    ZRegion,
    CpTab,
    RaPr,
    RlPr,
    OcCl,
    RvPr,
    OpPr,
}

impl AccelFunc {
    pub fn from_index(index: u32) -> Option<Self> {
        let func = match index {
            1 => AccelFunc::ZRegion,
            2 => AccelFunc::CpTab,
            3 => AccelFunc::RaPr,
            4 => AccelFunc::RlPr,
            5 => AccelFunc::OcCl,
            6 => AccelFunc::RvPr,
            7 => AccelFunc::OpPr,
            _ => return None,
        };
        Some(func)
    }
}

/// Table of accelerated function addresses and their shared parameters.
#[derive(Debug, Default, Clone)]
pub struct Accel {
    params: [u32; NUM_PARAMS],
    funcs: HashMap<u32, AccelFunc>,
}

impl Accel {
    pub fn is_supported(index: u32) -> bool {
        AccelFunc::from_index(index).is_some()
    }

    /// Out of range indices are ignored.
    pub fn set_param(&mut self, index: u32, val: u32) {
        if let Some(param) = self.params.get_mut(index as usize) {
            *param = val;
        }
    }

    /// Bind `addr` to the function `index`. Index zero, or an unknown
    /// index, turns acceleration off for the address.
    pub fn set_func(&mut self, index: u32, addr: u32) {
        match AccelFunc::from_index(index) {
            Some(func) => {
                debug!("accelerating ${:X} as function {}", addr, index);
                self.funcs.insert(addr, func);
            }
            None => {
                self.funcs.remove(&addr);
            }
        }
    }

    pub fn lookup(&self, addr: u32) -> Option<AccelFunc> {
        self.funcs.get(&addr).copied()
    }

    /// Run `func`. Arguments past the end of `args` read as zero.
    /// Diagnostics the routine would print are appended to `out`.
    pub fn call(
        &self,
        func: AccelFunc,
        mem: &Memory,
        args: &[u32],
        out: &mut String,
    ) -> anyhow::Result<u32> {
        let mut ctx = Context {
            mem,
            params: &self.params,
            out,
        };
        match func {
            AccelFunc::ZRegion => ctx.z_region(args),
            AccelFunc::CpTab => ctx.cp_tab(args),
            AccelFunc::RaPr => ctx.ra_pr(args),
            AccelFunc::RlPr => ctx.rl_pr(args),
            AccelFunc::OcCl => ctx.oc_cl(args),
            AccelFunc::RvPr => ctx.rv_pr(args),
            AccelFunc::OpPr => ctx.op_pr(args),
        }
    }
}

fn arg(args: &[u32], ix: usize) -> u32 {
    args.get(ix).copied().unwrap_or(0)
}

struct Context<'a> {
    mem: &'a Memory,
    params: &'a [u32; NUM_PARAMS],
    out: &'a mut String,
}

impl Context<'_> {
    fn z_region(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        let Some(&addr) = args.first() else {
            return Ok(0);
        };
        if addr < 36 || addr >= self.mem.end_mem() {
            return Ok(0);
        }
        let tb = self.mem.read1(addr)?;
        let region = match tb {
            0xE0.. => 3,
            0xC0.. => 2,
            0x70..=0x7F if addr >= self.mem.ram_start() => 1,
            _ => 0,
        };
        Ok(region)
    }

    fn cp_tab(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        let (obj, id) = (arg(args, 0), arg(args, 1));
        if self.z_region(args)? != 1 {
            self.out
                .push_str("\n[** Programming error: tried to find the \".\" of (something) **]\n");
            return Ok(0);
        }
        let otab = self.mem.read4(obj.wrapping_add(16))?;
        if otab == 0 {
            return Ok(0);
        }
        let max = self.mem.read4(otab)?;
        let key = search::Key::fetch(self.mem, id, 2, 0)?;
        search::binary(self.mem, &key, otab + 4, 10, max, 0)
    }

    fn ra_pr(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        match self.get_prop(arg(args, 0), arg(args, 1))? {
            0 => Ok(0),
            prop => self.mem.read4(prop + 4),
        }
    }

    fn rl_pr(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        match self.get_prop(arg(args, 0), arg(args, 1))? {
            0 => Ok(0),
            prop => Ok(4 * self.mem.read2(prop + 2)?),
        }
    }

    fn oc_cl(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        let (obj, cla) = (arg(args, 0), arg(args, 1));
        let p = *self.params;
        match self.z_region(args)? {
            3 => return Ok((cla == p[5]) as u32),
            2 => return Ok((cla == p[4]) as u32),
            1 => {}
            _ => return Ok(0),
        }

        let is_metaclass = |obj: u32| obj == p[2] || obj == p[5] || obj == p[4] || obj == p[3];
        if cla == p[2] {
            let member = self.obj_in_class(obj)? || is_metaclass(obj);
            return Ok(member as u32);
        }
        if cla == p[3] {
            let member = self.obj_in_class(obj)? || is_metaclass(obj);
            return Ok(!member as u32);
        }
        if cla == p[5] || cla == p[4] {
            return Ok(0);
        }

        if !self.obj_in_class(cla)? {
            self.out
                .push_str("\n[** Programming error: tried to apply 'ofclass' with non-class **]\n");
            return Ok(0);
        }

        let prop = self.get_prop(obj, 2)?;
        if prop == 0 {
            return Ok(0);
        }
        let inlist = self.mem.read4(prop + 4)?;
        if inlist == 0 {
            return Ok(0);
        }
        let len = self.mem.read2(prop + 2)?;
        for jx in 0..len {
            if self.mem.read4(inlist + 4 * jx)? == cla {
                return Ok(1);
            }
        }
        Ok(0)
    }

    fn rv_pr(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        let id = arg(args, 1);
        let addr = self.ra_pr(args)?;
        if addr != 0 {
            return self.mem.read4(addr);
        }
        if id > 0 && id < self.params[1] {
            return self.mem.read4(self.params[8].wrapping_add(4 * id));
        }
        self.out
            .push_str("\n[** Programming error: tried to read (something) **]\n");
        Ok(0)
    }

    fn op_pr(&mut self, args: &[u32]) -> anyhow::Result<u32> {
        let (obj, id) = (arg(args, 0), arg(args, 1));
        let indiv_prop_start = self.params[1];
        match self.z_region(args)? {
            3 => {
                let provided = id == indiv_prop_start + 6 || id == indiv_prop_start + 7;
                return Ok(provided as u32);
            }
            2 => return Ok((id == indiv_prop_start + 5) as u32),
            1 => {}
            _ => return Ok(0),
        }
        if id >= indiv_prop_start && id < indiv_prop_start + 8 && self.obj_in_class(obj)? {
            return Ok(1);
        }
        Ok((self.ra_pr(args)? != 0) as u32)
    }

    /// True when `obj` is itself a class object.
    fn obj_in_class(&self, obj: u32) -> anyhow::Result<bool> {
        let addr = obj.wrapping_add(13).wrapping_add(self.params[7]);
        Ok(self.mem.read4(addr)? == self.params[2])
    }

    fn get_prop(&mut self, obj: u32, id: u32) -> anyhow::Result<u32> {
        let (mut obj, mut id) = (obj, id);
        let mut cla = 0;
        if id & 0xFFFF_0000 != 0 {
            cla = self
                .mem
                .read4(self.params[0].wrapping_add((id & 0xFFFF) * 4))?;
            if self.oc_cl(&[obj, cla])? == 0 {
                return Ok(0);
            }
            id >>= 16;
            obj = cla;
        }

        let prop = self.cp_tab(&[obj, id])?;
        if prop == 0 {
            return Ok(0);
        }
        if cla == 0
            && self.obj_in_class(obj)?
            && (id < self.params[1] || id >= self.params[1] + 8)
        {
            return Ok(0);
        }
        if self.mem.read4(self.params[6])? != obj && self.mem.read1(prop + 9)? & 1 != 0 {
            return Ok(0);
        }
        Ok(prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put4(mem: &mut [u8], at: usize, val: u32) {
        mem[at..at + 4].copy_from_slice(&val.to_be_bytes());
    }

    // RAM starts at 0x100. Object at 0x200 with a property table at
    // 0x300 holding properties 4 and 9.
    fn world() -> (Memory, Accel) {
        let mut image = crate::memory::tests::image(&[]);
        image.resize(0x400, 0);
        put4(&mut image, 16, 0x400);
        put4(&mut image, 12, 0x400);
        image[0xC0] = 0xE0;
        image[0xD0] = 0xC1;
        image[0x200] = 0x70;
        put4(&mut image, 0x210, 0x300);
        put4(&mut image, 0x300, 2);
        // property 4: length 1, data at 0x340
        image[0x304..0x306].copy_from_slice(&4u16.to_be_bytes());
        image[0x306..0x308].copy_from_slice(&1u16.to_be_bytes());
        put4(&mut image, 0x308, 0x340);
        // property 9: length 2, data at 0x348, private
        image[0x30E..0x310].copy_from_slice(&9u16.to_be_bytes());
        image[0x310..0x312].copy_from_slice(&2u16.to_be_bytes());
        put4(&mut image, 0x312, 0x348);
        image[0x317] = 1;
        put4(&mut image, 0x340, 77);
        put4(&mut image, 0x348, 88);
        put4(&mut image, 0x37C, 55);
        let mem = Memory::load(image).unwrap();

        let mut accel = Accel::default();
        // params: classes table, indiv_prop_start, class metaclass,
        // object, routine, string, self, num_attr_bytes, cpv start
        for (ix, val) in [0x3C0, 64, 0x3F0, 0x3F4, 0x3F8, 0x3FC, 0x3E0, 7, 0x370]
            .iter()
            .enumerate()
        {
            accel.set_param(ix as u32, *val);
        }
        for index in 1..=7 {
            accel.set_func(index, 0x1000 + index);
        }
        (mem, accel)
    }

    fn call(accel: &Accel, mem: &Memory, index: u32, args: &[u32]) -> (u32, String) {
        let mut out = String::new();
        let func = accel.lookup(0x1000 + index).unwrap();
        let val = accel.call(func, mem, args, &mut out).unwrap();
        (val, out)
    }

    #[test]
    fn regions() {
        let (mem, accel) = world();
        assert_eq!(call(&accel, &mem, 1, &[]).0, 0);
        assert_eq!(call(&accel, &mem, 1, &[0xC0]).0, 3);
        assert_eq!(call(&accel, &mem, 1, &[0xD0]).0, 2);
        assert_eq!(call(&accel, &mem, 1, &[0x200]).0, 1);
        assert_eq!(call(&accel, &mem, 1, &[10]).0, 0);
        assert_eq!(call(&accel, &mem, 1, &[0x5000]).0, 0);
    }

    #[test]
    fn property_lookup() {
        let (mem, accel) = world();
        assert_eq!(call(&accel, &mem, 2, &[0x200, 4]).0, 0x304);
        assert_eq!(call(&accel, &mem, 3, &[0x200, 4]).0, 0x340);
        assert_eq!(call(&accel, &mem, 4, &[0x200, 4]).0, 4);
        assert_eq!(call(&accel, &mem, 6, &[0x200, 4]).0, 77);
        assert_eq!(call(&accel, &mem, 7, &[0x200, 4]).0, 1);
        // private property hidden unless self is the object
        assert_eq!(call(&accel, &mem, 3, &[0x200, 9]).0, 0);
        assert_eq!(call(&accel, &mem, 7, &[0x200, 5]).0, 0);
    }

    #[test]
    fn missing_property_falls_back_to_defaults() {
        let (mem, accel) = world();
        assert_eq!(call(&accel, &mem, 6, &[0x200, 3]), (55, String::new()));
        let (val, out) = call(&accel, &mem, 6, &[0x200, 70]);
        assert_eq!(val, 0);
        assert!(out.contains("tried to read (something)"));
    }

    #[test]
    fn cp_tab_on_non_object() {
        let (mem, accel) = world();
        let (val, out) = call(&accel, &mem, 2, &[0xC0, 4]);
        assert_eq!(val, 0);
        assert!(out.contains("tried to find the \".\" of (something)"));
    }

    #[test]
    fn ofclass_metaclasses() {
        let (mem, accel) = world();
        assert_eq!(call(&accel, &mem, 5, &[0xC0, 0x3FC]).0, 1);
        assert_eq!(call(&accel, &mem, 5, &[0xD0, 0x3F8]).0, 1);
        assert_eq!(call(&accel, &mem, 5, &[0x200, 0x3F4]).0, 1);
        assert_eq!(call(&accel, &mem, 5, &[0x200, 0x3F0]).0, 0);
        let (val, out) = call(&accel, &mem, 5, &[0x200, 0x200]);
        assert_eq!(val, 0);
        assert!(out.contains("non-class"));
    }

    #[test]
    fn unbinding() {
        let mut accel = Accel::default();
        accel.set_func(3, 0x500);
        assert_eq!(accel.lookup(0x500), Some(AccelFunc::RaPr));
        accel.set_func(0, 0x500);
        assert_eq!(accel.lookup(0x500), None);
        assert!(Accel::is_supported(7));
        assert!(!Accel::is_supported(8));
    }
}
