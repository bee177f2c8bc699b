//! Guest modules.
//!
//! A [`Module`] is a validated, immutable description of guest code: a list
//! of imported host functions followed by functions defined in the module,
//! sharing one index space, plus named exports and an optional start
//! function. Function bodies are structured instruction trees in the style
//! of WebAssembly; blocks, loops and `if`s take no parameters and produce no
//! results.

use crate::{FuncType, ValType};
use anyhow::{anyhow, ensure, Context as _, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// A single guest instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instr {
    /// Traps with `Trap::UnreachableCodeReached`.
    Unreachable,
    /// Does nothing.
    Nop,
    /// A block; `br 0` inside it jumps to its end.
    Block(Vec<Instr>),
    /// A loop; `br 0` inside it jumps back to its start.
    Loop(Vec<Instr>),
    /// Pops an `i32` and runs the first body if it is nonzero, the second
    /// otherwise. Either body is a block.
    If(Vec<Instr>, Vec<Instr>),
    /// Branches to the enclosing label at the given depth. The function body
    /// itself is the outermost label.
    Br(u32),
    /// Pops an `i32` and branches if it is nonzero.
    BrIf(u32),
    /// Returns from the current function.
    Return,
    /// Calls the function at the given index.
    Call(u32),
    /// Pops and discards one value.
    Drop,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    I32Add,
    I32Sub,
    I32Mul,
    /// Signed division; traps on division by zero and on overflow.
    I32DivS,
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I64Add,
    I64Sub,
    I64Mul,
    I64Eqz,
    I64LtS,
}

impl Instr {
    /// Units of fuel charged for executing this instruction.
    pub fn fuel_cost(&self) -> u64 {
        match self {
            Instr::Nop | Instr::Drop | Instr::Block(_) | Instr::Loop(_) => 0,
            _ => 1,
        }
    }
}

/// A host function a module expects to be supplied at instantiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    module: String,
    name: String,
    ty: FuncType,
}

impl Import {
    /// The module namespace of this import.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The field name of this import.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The expected signature.
    pub fn ty(&self) -> &FuncType {
        &self.ty
    }
}

#[derive(Debug)]
pub(crate) struct FuncBody {
    pub(crate) ty: FuncType,
    pub(crate) locals: Box<[ValType]>,
    pub(crate) body: Box<[Instr]>,
}

/// A compiled guest module, ready to be instantiated with a
/// [`Linker`](crate::Linker).
///
/// Modules are cheap to clone and may be instantiated any number of times,
/// into any number of stores.
#[derive(Clone, Debug)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

#[derive(Debug)]
struct ModuleInner {
    imports: Vec<Import>,
    funcs: Vec<FuncBody>,
    exports: Vec<(String, u32)>,
    start: Option<u32>,
}

impl Module {
    /// Returns a builder for a new module.
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder::default()
    }

    /// The functions this module imports, in index order.
    pub fn imports(&self) -> impl ExactSizeIterator<Item = &Import> + '_ {
        self.inner.imports.iter()
    }

    /// The names of this module's exports, with their signatures.
    pub fn exports(&self) -> impl ExactSizeIterator<Item = (&str, &FuncType)> + '_ {
        self.inner
            .exports
            .iter()
            .map(|(name, index)| (name.as_str(), self.func_type(*index)))
    }

    pub(crate) fn export_index(&self, name: &str) -> Option<u32> {
        self.inner
            .exports
            .iter()
            .find(|(export, _)| export == name)
            .map(|(_, index)| *index)
    }

    pub(crate) fn start(&self) -> Option<u32> {
        self.inner.start
    }

    pub(crate) fn func_type(&self, index: u32) -> &FuncType {
        let index = index as usize;
        match self.inner.imports.get(index) {
            Some(import) => &import.ty,
            None => &self.inner.funcs[index - self.inner.imports.len()].ty,
        }
    }

    /// The body of a defined function, or `None` for an import.
    pub(crate) fn body(&self, index: u32) -> Option<&FuncBody> {
        let index = (index as usize).checked_sub(self.inner.imports.len())?;
        self.inner.funcs.get(index)
    }
}

/// Incrementally describes a [`Module`].
///
/// Imports must be declared before any function is defined so that the
/// indices returned by [`ModuleBuilder::import`] and
/// [`ModuleBuilder::func`] are final.
#[derive(Default)]
pub struct ModuleBuilder {
    imports: Vec<Import>,
    funcs: Vec<FuncBody>,
    exports: Vec<(String, u32)>,
    start: Option<u32>,
    error: Option<anyhow::Error>,
}

impl ModuleBuilder {
    /// Declares an imported function and returns its index.
    pub fn import(&mut self, module: &str, name: &str, ty: FuncType) -> u32 {
        if !self.funcs.is_empty() && self.error.is_none() {
            self.error = Some(anyhow!(
                "import `{module}::{name}` declared after a function definition"
            ));
        }
        self.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        });
        self.next_index() - 1
    }

    /// Defines a function with extra `locals` beyond its parameters and
    /// returns its index.
    pub fn func(
        &mut self,
        ty: FuncType,
        locals: impl IntoIterator<Item = ValType>,
        body: impl IntoIterator<Item = Instr>,
    ) -> u32 {
        self.funcs.push(FuncBody {
            ty,
            locals: locals.into_iter().collect(),
            body: body.into_iter().collect(),
        });
        self.next_index() - 1
    }

    /// Exports the function at `index` under `name`.
    pub fn export(&mut self, name: &str, index: u32) -> &mut Self {
        self.exports.push((name.to_string(), index));
        self
    }

    /// Runs the function at `index` when the module is instantiated.
    pub fn start(&mut self, index: u32) -> &mut Self {
        self.start = Some(index);
        self
    }

    /// Validates everything declared so far and produces the module.
    ///
    /// The builder is left empty.
    pub fn build(&mut self) -> Result<Module> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let inner = ModuleInner {
            imports: std::mem::take(&mut self.imports),
            funcs: std::mem::take(&mut self.funcs),
            exports: std::mem::take(&mut self.exports),
            start: self.start.take(),
        };
        validate(&inner)?;
        Ok(Module {
            inner: Arc::new(inner),
        })
    }

    fn next_index(&self) -> u32 {
        u32::try_from(self.imports.len() + self.funcs.len()).unwrap_or(u32::MAX)
    }
}

fn validate(module: &ModuleInner) -> Result<()> {
    let num_funcs = module.imports.len() + module.funcs.len();

    let mut names = HashSet::new();
    for (name, index) in &module.exports {
        ensure!(names.insert(name.as_str()), "duplicate export `{name}`");
        ensure!(
            (*index as usize) < num_funcs,
            "export `{name}` refers to unknown function {index}"
        );
    }

    if let Some(start) = module.start {
        ensure!(
            (start as usize) < num_funcs,
            "start function {start} is out of bounds"
        );
        let ty = match module.imports.get(start as usize) {
            Some(import) => &import.ty,
            None => &module.funcs[start as usize - module.imports.len()].ty,
        };
        ensure!(
            ty.params().is_empty() && ty.results().is_empty(),
            "start function must have type `(func)`, found `{ty}`"
        );
    }

    for (i, func) in module.funcs.iter().enumerate() {
        let index = module.imports.len() + i;
        let cx = BodyValidator {
            num_locals: func.ty.params().len() + func.locals.len(),
            num_funcs,
        };
        cx.validate(&func.body, 0)
            .with_context(|| format!("invalid body for function {index}"))?;
    }
    Ok(())
}

struct BodyValidator {
    num_locals: usize,
    num_funcs: usize,
}

impl BodyValidator {
    fn validate(&self, code: &[Instr], depth: u32) -> Result<()> {
        for instr in code {
            match instr {
                Instr::LocalGet(i) | Instr::LocalSet(i) | Instr::LocalTee(i) => {
                    ensure!((*i as usize) < self.num_locals, "unknown local {i}");
                }
                Instr::Br(n) | Instr::BrIf(n) => {
                    ensure!(*n <= depth, "branch depth {n} exceeds nesting of {depth}");
                }
                Instr::Call(f) => {
                    ensure!((*f as usize) < self.num_funcs, "call to unknown function {f}");
                }
                Instr::Block(body) | Instr::Loop(body) => self.validate(body, depth + 1)?,
                Instr::If(then, else_) => {
                    self.validate(then, depth + 1)?;
                    self.validate(else_, depth + 1)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
