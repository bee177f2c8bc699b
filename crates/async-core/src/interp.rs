//! Execution of guest function bodies.
//!
//! Each instruction is charged against the store's fuel meter before it
//! runs. Fuel and epoch checkpoints happen at function entry and on every
//! loop back-edge, and fuel is checked again right before each call, which
//! are the only places where guest code can trap on or suspend for a
//! budget. Calls into asynchronous host functions are the third kind of
//! suspension point.

use crate::instance::InstanceData;
use crate::module::{FuncBody, Instr};
use crate::store::StoreInner;
use crate::values::typecheck;
use crate::{Func, Trap, Val, ValType};
use anyhow::{anyhow, ensure, Result};

/// Runs `func` to completion (or until it traps) on the current stack.
pub(crate) fn invoke<T>(store: &mut StoreInner<T>, func: Func, args: Vec<Val>) -> Result<Vec<Val>> {
    let instance = store
        .instances
        .get(func.instance)
        .cloned()
        .ok_or_else(|| anyhow!("function refers to an unknown instance"))?;
    log::trace!("invoking function {} of instance {}", func.index, func.instance);
    Interpreter {
        store,
        instance: &instance,
    }
    .call(func.index, args)
}

/// How control leaves a sequence of instructions.
#[derive(Debug, PartialEq)]
enum Flow {
    /// Fell off the end.
    Next,
    /// Branching to the label this many levels out.
    Branch(u32),
    Return,
}

impl Flow {
    /// Adjusts a flow which escaped from a labelled construct: `Branch(0)`
    /// targeted it, deeper branches lose one level.
    fn leave_label(self) -> Option<Flow> {
        match self {
            Flow::Next | Flow::Branch(0) => None,
            Flow::Branch(n) => Some(Flow::Branch(n - 1)),
            Flow::Return => Some(Flow::Return),
        }
    }
}

struct Frame {
    locals: Vec<Val>,
    stack: Vec<Val>,
}

impl Frame {
    fn pop(&mut self) -> Result<Val> {
        self.stack
            .pop()
            .ok_or_else(|| anyhow!("operand stack underflow"))
    }

    fn pop_i32(&mut self) -> Result<i32> {
        match self.pop()? {
            Val::I32(v) => Ok(v),
            other => Err(type_mismatch(ValType::I32, other)),
        }
    }

    fn pop_i64(&mut self) -> Result<i64> {
        match self.pop()? {
            Val::I64(v) => Ok(v),
            other => Err(type_mismatch(ValType::I64, other)),
        }
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Val>> {
        ensure!(self.stack.len() >= n, "operand stack underflow");
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn local(&self, index: u32) -> Result<Val> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| anyhow!("unknown local {index}"))
    }

    fn set_local(&mut self, index: u32, val: Val) -> Result<()> {
        let slot = self
            .locals
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("unknown local {index}"))?;
        ensure!(
            slot.ty() == val.ty(),
            "local {index}: expected {}, found {}",
            slot.ty(),
            val.ty()
        );
        *slot = val;
        Ok(())
    }

    fn binop_i32(&mut self, op: impl FnOnce(i32, i32) -> Result<i32, Trap>) -> Result<()> {
        let b = self.pop_i32()?;
        let a = self.pop_i32()?;
        self.stack.push(Val::I32(op(a, b)?));
        Ok(())
    }

    fn binop_i64(&mut self, op: impl FnOnce(i64, i64) -> i64) -> Result<()> {
        let b = self.pop_i64()?;
        let a = self.pop_i64()?;
        self.stack.push(Val::I64(op(a, b)));
        Ok(())
    }

    fn cmp_i64(&mut self, op: impl FnOnce(i64, i64) -> bool) -> Result<()> {
        let b = self.pop_i64()?;
        let a = self.pop_i64()?;
        self.stack.push(Val::I32(i32::from(op(a, b))));
        Ok(())
    }
}

fn type_mismatch(expected: ValType, found: Val) -> anyhow::Error {
    anyhow!("type mismatch: expected {expected}, found {}", found.ty())
}

struct Interpreter<'a, T> {
    store: &'a mut StoreInner<T>,
    instance: &'a InstanceData<T>,
}

impl<T> Interpreter<'_, T> {
    fn call(&mut self, index: u32, args: Vec<Val>) -> Result<Vec<Val>> {
        let instance = self.instance;
        if let Some(host) = instance.imports.get(index as usize) {
            return host.call(self.store, &args);
        }
        let func = instance
            .module
            .body(index)
            .ok_or_else(|| anyhow!("call to unknown function {index}"))?;
        self.store.enter_call()?;
        let result = self.run(func, args);
        self.store.exit_call();
        result
    }

    fn run(&mut self, func: &FuncBody, args: Vec<Val>) -> Result<Vec<Val>> {
        self.store.fuel_check()?;
        self.store.epoch_check()?;

        typecheck("params", func.ty.params(), &args)?;
        let mut frame = Frame {
            locals: args,
            stack: Vec::new(),
        };
        frame
            .locals
            .extend(func.locals.iter().map(|ty| ty.default_value()));

        // Falling off the end, returning, and branching to the function's
        // own label all leave the function.
        self.exec(&mut frame, &func.body)?;

        let results = frame.pop_n(func.ty.results().len())?;
        typecheck("results", func.ty.results(), &results)?;
        Ok(results)
    }

    /// Runs a labelled body, discarding whatever it left on the stack if it
    /// was exited with a branch.
    fn block(&mut self, frame: &mut Frame, code: &[Instr]) -> Result<Option<Flow>> {
        let height = frame.stack.len();
        let flow = self.exec(frame, code)?;
        if flow == Flow::Branch(0) {
            frame.stack.truncate(height);
        }
        Ok(flow.leave_label())
    }

    fn exec(&mut self, frame: &mut Frame, code: &[Instr]) -> Result<Flow> {
        let instance = self.instance;
        for instr in code {
            self.store.consume_fuel(instr.fuel_cost());
            match instr {
                Instr::Unreachable => return Err(Trap::UnreachableCodeReached.into()),
                Instr::Nop => {}
                Instr::Block(body) => {
                    if let Some(flow) = self.block(frame, body)? {
                        return Ok(flow);
                    }
                }
                Instr::Loop(body) => loop {
                    let height = frame.stack.len();
                    match self.exec(frame, body)? {
                        Flow::Branch(0) => {
                            // Back-edge.
                            frame.stack.truncate(height);
                            self.store.fuel_check()?;
                            self.store.epoch_check()?;
                        }
                        flow => match flow.leave_label() {
                            Some(flow) => return Ok(flow),
                            None => break,
                        },
                    }
                },
                Instr::If(then, else_) => {
                    let body = if frame.pop_i32()? != 0 { then } else { else_ };
                    if let Some(flow) = self.block(frame, body)? {
                        return Ok(flow);
                    }
                }
                Instr::Br(depth) => return Ok(Flow::Branch(*depth)),
                Instr::BrIf(depth) => {
                    if frame.pop_i32()? != 0 {
                        return Ok(Flow::Branch(*depth));
                    }
                }
                Instr::Return => return Ok(Flow::Return),
                Instr::Call(index) => {
                    self.store.fuel_check()?;
                    let ty = instance.module.func_type(*index);
                    let args = frame.pop_n(ty.params().len())?;
                    let results = self.call(*index, args)?;
                    frame.stack.extend(results);
                }
                Instr::Drop => {
                    frame.pop()?;
                }
                Instr::LocalGet(i) => {
                    let val = frame.local(*i)?;
                    frame.stack.push(val);
                }
                Instr::LocalSet(i) => {
                    let val = frame.pop()?;
                    frame.set_local(*i, val)?;
                }
                Instr::LocalTee(i) => {
                    let val = frame.pop()?;
                    frame.set_local(*i, val)?;
                    frame.stack.push(val);
                }
                Instr::I32Const(v) => frame.stack.push(Val::I32(*v)),
                Instr::I64Const(v) => frame.stack.push(Val::I64(*v)),
                Instr::F32Const(v) => frame.stack.push(Val::from(*v)),
                Instr::F64Const(v) => frame.stack.push(Val::from(*v)),
                Instr::I32Add => frame.binop_i32(|a, b| Ok(a.wrapping_add(b)))?,
                Instr::I32Sub => frame.binop_i32(|a, b| Ok(a.wrapping_sub(b)))?,
                Instr::I32Mul => frame.binop_i32(|a, b| Ok(a.wrapping_mul(b)))?,
                Instr::I32DivS => frame.binop_i32(|a, b| {
                    if b == 0 {
                        Err(Trap::IntegerDivisionByZero)
                    } else {
                        a.checked_div(b).ok_or(Trap::IntegerOverflow)
                    }
                })?,
                Instr::I32Eqz => {
                    let a = frame.pop_i32()?;
                    frame.stack.push(Val::I32(i32::from(a == 0)));
                }
                Instr::I32Eq => frame.binop_i32(|a, b| Ok(i32::from(a == b)))?,
                Instr::I32Ne => frame.binop_i32(|a, b| Ok(i32::from(a != b)))?,
                Instr::I32LtS => frame.binop_i32(|a, b| Ok(i32::from(a < b)))?,
                Instr::I32GtS => frame.binop_i32(|a, b| Ok(i32::from(a > b)))?,
                Instr::I64Add => frame.binop_i64(i64::wrapping_add)?,
                Instr::I64Sub => frame.binop_i64(i64::wrapping_sub)?,
                Instr::I64Mul => frame.binop_i64(i64::wrapping_mul)?,
                Instr::I64Eqz => {
                    let a = frame.pop_i64()?;
                    frame.stack.push(Val::I32(i32::from(a == 0)));
                }
                Instr::I64LtS => frame.cmp_i64(|a, b| a < b)?,
            }
        }
        Ok(Flow::Next)
    }
}
