//! Guest modules used by the scenarios. Each exports `main`.

use anyhow::Result;
use wasmtime_async_core::{FuncType, Instr, Module, ModuleBuilder, ValType};

fn import_print(b: &mut ModuleBuilder) -> u32 {
    b.import("host", "print", FuncType::new([ValType::I32], []))
}

/// `main(x: i32) -> i32`: prints `x` once and returns `x * 2`.
pub fn print_once() -> Result<Module> {
    let mut b = Module::builder();
    let print = import_print(&mut b);
    let main = b.func(
        FuncType::new([ValType::I32], [ValType::I32]),
        [],
        [
            Instr::LocalGet(0),
            Instr::Call(print),
            Instr::LocalGet(0),
            Instr::I32Const(2),
            Instr::I32Mul,
        ],
    );
    b.export("main", main);
    b.build()
}

/// `main() -> ()`: prints `0..n` in a loop.
pub fn print_loop(n: i32) -> Result<Module> {
    let mut b = Module::builder();
    let print = import_print(&mut b);
    let main = b.func(
        FuncType::new([], []),
        [ValType::I32],
        [Instr::Block(vec![Instr::Loop(vec![
            Instr::LocalGet(0),
            Instr::I32Const(n),
            Instr::I32LtS,
            Instr::I32Eqz,
            Instr::BrIf(1),
            Instr::LocalGet(0),
            Instr::Call(print),
            Instr::LocalGet(0),
            Instr::I32Const(1),
            Instr::I32Add,
            Instr::LocalSet(0),
            Instr::Br(0),
        ])])],
    );
    b.export("main", main);
    b.build()
}

/// `main(n: i32) -> i32`: sums `1..=n` in a loop costing 12 fuel per
/// iteration.
pub fn spin() -> Result<Module> {
    let mut b = Module::builder();
    let main = b.func(
        FuncType::new([ValType::I32], [ValType::I32]),
        [ValType::I32],
        [
            Instr::Block(vec![Instr::Loop(vec![
                Instr::LocalGet(0),
                Instr::I32Eqz,
                Instr::BrIf(1),
                Instr::LocalGet(1),
                Instr::LocalGet(0),
                Instr::I32Add,
                Instr::LocalSet(1),
                Instr::LocalGet(0),
                Instr::I32Const(1),
                Instr::I32Sub,
                Instr::LocalSet(0),
                Instr::Br(0),
            ])]),
            Instr::LocalGet(1),
        ],
    );
    b.export("main", main);
    b.build()
}

/// What `spin` returns for `n`.
pub fn spin_result(n: i32) -> i32 {
    n * (n + 1) / 2
}

/// `main() -> ()`: never returns.
pub fn forever() -> Result<Module> {
    let mut b = Module::builder();
    let main = b.func(FuncType::new([], []), [], [Instr::Loop(vec![Instr::Br(0)])]);
    b.export("main", main);
    b.build()
}

/// `main() -> i32`: hits `unreachable`.
pub fn unreachable() -> Result<Module> {
    let mut b = Module::builder();
    let main = b.func(FuncType::new([], [ValType::I32]), [], [Instr::Unreachable]);
    b.export("main", main);
    b.build()
}

/// `main() -> i32`: prints 1 from a nested call, then hits `unreachable`.
pub fn print_then_trap() -> Result<Module> {
    let mut b = Module::builder();
    let print = import_print(&mut b);
    let inner = b.func(
        FuncType::new([], []),
        [],
        [Instr::I32Const(1), Instr::Call(print)],
    );
    let main = b.func(
        FuncType::new([], [ValType::I32]),
        [],
        [Instr::Call(inner), Instr::Unreachable],
    );
    b.export("main", main);
    b.build()
}

/// `main() -> i32`: waits on `host::when-ready`, then returns 7.
pub fn wait_ready() -> Result<Module> {
    let mut b = Module::builder();
    let when_ready = b.import("host", "when-ready", FuncType::new([], []));
    let main = b.func(
        FuncType::new([], [ValType::I32]),
        [],
        [Instr::Call(when_ready), Instr::I32Const(7)],
    );
    b.export("main", main);
    b.build()
}

/// Calls the import `module::name: () -> results` from `main` and returns
/// its results.
pub fn call_import(module: &str, name: &str, results: &[ValType]) -> Result<Module> {
    let mut b = Module::builder();
    let ty = FuncType::new([], results.iter().copied());
    let import = b.import(module, name, ty.clone());
    let main = b.func(ty, [], [Instr::Call(import)]);
    b.export("main", main);
    b.build()
}
