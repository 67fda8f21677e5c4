use std::fmt;
use std::io::Write;

use log::trace;
use thiserror::Error;

use crate::error::{CompileError, Result};

/// Target of a jump or call that has not been patched yet.
pub const PLACEHOLDER: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    AllocBlock(usize),
    LoadImInt(i64),
    LoadAddrRel(i64),
    Deref,
    Store,
    StoreRev,
    #[allow(dead_code)]
    Dup,
    Call(usize),
    Return(usize),
    CondJump(usize),
    UncondJump(usize),
    AddInt,
    SubInt,
    MultInt,
    DivTruncInt,
    ModTruncInt,
    DivFloorInt,
    ModFloorInt,
    DivEuclInt,
    ModEuclInt,
    EqInt,
    NeInt,
    LtInt,
    GtInt,
    LeInt,
    GeInt,
    InputInt(String),
    InputBool(String),
    OutputInt(String),
    OutputBool(String),
    Stop,
}

fn fmt_target(f: &mut fmt::Formatter<'_>, name: &str, target: usize) -> fmt::Result {
    if target == PLACEHOLDER {
        write!(f, "{name}(?)")
    } else {
        write!(f, "{name}({target})")
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::AllocBlock(n) => write!(f, "AllocBlock({n})"),
            Instr::LoadImInt(v) => write!(f, "LoadImInt({v})"),
            Instr::LoadAddrRel(o) => write!(f, "LoadAddrRel({o})"),
            Instr::Call(t) => fmt_target(f, "Call", *t),
            Instr::CondJump(t) => fmt_target(f, "CondJump", *t),
            Instr::UncondJump(t) => fmt_target(f, "UncondJump", *t),
            Instr::Return(n) => write!(f, "Return({n})"),
            Instr::InputInt(l) => write!(f, "InputInt({l:?})"),
            Instr::InputBool(l) => write!(f, "InputBool({l:?})"),
            Instr::OutputInt(l) => write!(f, "OutputInt({l:?})"),
            Instr::OutputBool(l) => write!(f, "OutputBool({l:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Fixed-capacity instruction array addressed by location.
#[derive(Debug, Clone)]
pub struct CodeArray {
    code: Vec<Instr>,
    capacity: usize,
}

impl CodeArray {
    pub fn new(capacity: usize) -> Self {
        Self {
            code: Vec::new(),
            capacity,
        }
    }

    /// Writes `instr` at `loc`: appends at the end, overwrites below it.
    pub fn put(&mut self, loc: usize, instr: Instr) -> Result<()> {
        if loc >= self.capacity {
            return Err(CompileError::Capacity {
                capacity: self.capacity,
            });
        }
        match loc.cmp(&self.code.len()) {
            std::cmp::Ordering::Less => self.code[loc] = instr,
            std::cmp::Ordering::Equal => self.code.push(instr),
            std::cmp::Ordering::Greater => {
                return Err(CompileError::Internal(format!(
                    "write at {loc} leaves a gap after {}",
                    self.code.len()
                )))
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.code
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("division by zero at {pc}")]
    DivisionByZero { pc: usize },
    #[error("stack overflow at {pc}")]
    StackOverflow { pc: usize },
    #[error("stack underflow at {pc}")]
    StackUnderflow { pc: usize },
    #[error("address {addr} out of range at {pc}")]
    BadAddress { pc: usize, addr: i64 },
    #[error("unpatched jump or call at {pc}")]
    Unpatched { pc: usize },
    #[error("program counter {0} outside the code")]
    PcOutOfRange(usize),
    #[error("no input left for {label}")]
    MissingInput { label: String },
    #[error("invalid input {token:?} for {label}")]
    BadInput { label: String, token: String },
    #[error("output failed: {0}")]
    Output(#[from] std::io::Error),
}

pub struct Machine<'a> {
    code: &'a [Instr],
    store: Vec<i64>,
    sp: usize,
    fp: usize,
    ep: usize,
    pc: usize,
}

fn div_floor(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

impl<'a> Machine<'a> {
    pub fn new(code: &'a [Instr], store_size: usize) -> Self {
        Self {
            code,
            store: vec![0; store_size],
            sp: 0,
            fp: 0,
            ep: 0,
            pc: 0,
        }
    }

    /// Cell `addr` of the store, for inspection after a run.
    #[cfg(test)]
    pub fn cell(&self, addr: usize) -> Option<i64> {
        self.store.get(addr).copied()
    }

    fn push(&mut self, v: i64) -> std::result::Result<(), VmError> {
        let slot = self
            .store
            .get_mut(self.sp)
            .ok_or(VmError::StackOverflow { pc: self.pc })?;
        *slot = v;
        self.sp += 1;
        self.ep = self.ep.max(self.sp);
        Ok(())
    }

    fn pop(&mut self) -> std::result::Result<i64, VmError> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow { pc: self.pc });
        }
        self.sp -= 1;
        Ok(self.store[self.sp])
    }

    fn addr(&self, a: i64) -> std::result::Result<usize, VmError> {
        usize::try_from(a)
            .ok()
            .filter(|&u| u < self.store.len())
            .ok_or(VmError::BadAddress { pc: self.pc, addr: a })
    }

    fn load(&self, a: i64) -> std::result::Result<i64, VmError> {
        Ok(self.store[self.addr(a)?])
    }

    fn write(&mut self, a: i64, v: i64) -> std::result::Result<(), VmError> {
        let u = self.addr(a)?;
        self.store[u] = v;
        Ok(())
    }

    fn target(&self, t: usize) -> std::result::Result<usize, VmError> {
        if t == PLACEHOLDER {
            return Err(VmError::Unpatched { pc: self.pc });
        }
        Ok(t)
    }

    fn binary(&mut self, f: impl Fn(i64, i64) -> i64) -> std::result::Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(a, b))
    }

    fn division(&mut self, f: impl Fn(i64, i64) -> i64) -> std::result::Result<(), VmError> {
        let b = self.pop()?;
        let a = self.pop()?;
        if b == 0 {
            return Err(VmError::DivisionByZero { pc: self.pc });
        }
        self.push(f(a, b))
    }

    fn compare(&mut self, f: impl Fn(i64, i64) -> bool) -> std::result::Result<(), VmError> {
        self.binary(|a, b| i64::from(f(a, b)))
    }

    /// Runs from location 0 until `Stop`, reading `debugin` values from `input`.
    pub fn run<I, W>(&mut self, input: &mut I, out: &mut W) -> std::result::Result<(), VmError>
    where
        I: Iterator<Item = String>,
        W: Write,
    {
        let code = self.code;
        loop {
            let instr = code
                .get(self.pc)
                .ok_or(VmError::PcOutOfRange(self.pc))?;
            trace!("{:>5} sp={:<5} fp={:<5} {instr}", self.pc, self.sp, self.fp);
            let mut next = self.pc + 1;
            match instr {
                Instr::Stop => return Ok(()),
                Instr::AllocBlock(n) => {
                    for _ in 0..*n {
                        self.push(0)?;
                    }
                }
                Instr::LoadImInt(v) => self.push(*v)?,
                Instr::LoadAddrRel(o) => self.push(self.fp as i64 + o)?,
                Instr::Deref => {
                    let a = self.pop()?;
                    let v = self.load(a)?;
                    self.push(v)?;
                }
                Instr::Store => {
                    let v = self.pop()?;
                    let a = self.pop()?;
                    self.write(a, v)?;
                }
                Instr::StoreRev => {
                    let a = self.pop()?;
                    let v = self.pop()?;
                    self.write(a, v)?;
                }
                Instr::Dup => {
                    let v = self.pop()?;
                    self.push(v)?;
                    self.push(v)?;
                }
                Instr::Call(t) => {
                    let t = self.target(*t)?;
                    let frame = self.sp;
                    self.push(self.fp as i64)?;
                    self.push(self.ep as i64)?;
                    self.push(next as i64)?;
                    self.fp = frame;
                    next = t;
                }
                Instr::Return(n) => {
                    let frame = self.fp;
                    let ret = self.load(frame as i64 + 2)?;
                    let saved_ep = self.load(frame as i64 + 1)?;
                    let saved_fp = self.load(frame as i64)?;
                    self.sp = frame
                        .checked_sub(*n)
                        .ok_or(VmError::StackUnderflow { pc: self.pc })?;
                    self.fp = self.addr(saved_fp)?;
                    self.ep = usize::try_from(saved_ep).unwrap_or(0);
                    next = usize::try_from(ret).map_err(|_| VmError::PcOutOfRange(self.pc))?;
                }
                Instr::CondJump(t) => {
                    let t = self.target(*t)?;
                    if self.pop()? == 0 {
                        next = t;
                    }
                }
                Instr::UncondJump(t) => next = self.target(*t)?,
                Instr::AddInt => self.binary(i64::wrapping_add)?,
                Instr::SubInt => self.binary(i64::wrapping_sub)?,
                Instr::MultInt => self.binary(i64::wrapping_mul)?,
                Instr::DivTruncInt => self.division(i64::wrapping_div)?,
                Instr::ModTruncInt => self.division(i64::wrapping_rem)?,
                Instr::DivFloorInt => self.division(div_floor)?,
                Instr::ModFloorInt => {
                    self.division(|a, b| a.wrapping_sub(b.wrapping_mul(div_floor(a, b))))?
                }
                Instr::DivEuclInt => self.division(i64::wrapping_div_euclid)?,
                Instr::ModEuclInt => self.division(i64::wrapping_rem_euclid)?,
                Instr::EqInt => self.compare(|a, b| a == b)?,
                Instr::NeInt => self.compare(|a, b| a != b)?,
                Instr::LtInt => self.compare(|a, b| a < b)?,
                Instr::GtInt => self.compare(|a, b| a > b)?,
                Instr::LeInt => self.compare(|a, b| a <= b)?,
                Instr::GeInt => self.compare(|a, b| a >= b)?,
                Instr::InputInt(label) | Instr::InputBool(label) => {
                    let token = input.next().ok_or_else(|| VmError::MissingInput {
                        label: label.clone(),
                    })?;
                    let bad = || VmError::BadInput {
                        label: label.clone(),
                        token: token.clone(),
                    };
                    let v = match instr {
                        Instr::InputBool(_) => match token.as_str() {
                            "true" => 1,
                            "false" => 0,
                            _ => return Err(bad()),
                        },
                        _ => token.parse::<i64>().map_err(|_| bad())?,
                    };
                    let a = self.pop()?;
                    self.write(a, v)?;
                }
                Instr::OutputInt(label) => {
                    let v = self.pop()?;
                    writeln!(out, "{label} = {v}")?;
                }
                Instr::OutputBool(label) => {
                    let v = self.pop()?;
                    writeln!(out, "{label} = {}", v != 0)?;
                }
            }
            self.pc = next;
        }
    }
}
