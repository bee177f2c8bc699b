use anyhow::Result;
use async_core_tests::util::{self, drive, instantiate_main, returned};
use async_core_tests::{guest, print_host, Ctx};
use wasmtime_async_core::{
    CallOutcome, Config, Engine, FuncType, Instr, Linker, Module, Store, Val, ValType,
};

fn constant(linker: &mut Linker<Ctx>, value: i32) -> Result<()> {
    linker.func_new(
        "host",
        "value",
        FuncType::new([], [ValType::I32]),
        move |_caller, _params, results| {
            results[0] = Val::I32(value);
            Ok(())
        },
    )?;
    Ok(())
}

#[test]
fn duplicate_definitions() -> Result<()> {
    util::init_logger();
    let engine = Engine::new(&Config::new())?;
    let mut linker = Linker::new(&engine);
    constant(&mut linker, 1)?;
    let err = constant(&mut linker, 2).unwrap_err();
    assert!(err.to_string().contains("defined twice"), "{err}");

    linker.allow_shadowing(true);
    constant(&mut linker, 3)?;

    let module = guest::call_import("host", "value", &[ValType::I32])?;
    let mut store = Store::new(&engine, Ctx::default());
    let instance = linker.instantiate(&mut store, &module)?;
    let main = instance.get_func(&store, "main").unwrap();
    let mut results = [Val::I32(0)];
    main.call(&mut store, &[], &mut results)?;
    assert_eq!(results, [Val::I32(3)]);
    Ok(())
}

#[test]
fn missing_and_mismatched_imports() -> Result<()> {
    util::init_logger();
    let engine = Engine::new(&Config::new())?;
    let mut linker = Linker::new(&engine);
    constant(&mut linker, 1)?;
    let mut store = Store::new(&engine, Ctx::default());

    let missing = guest::call_import("host", "other", &[ValType::I32])?;
    let err = linker.instantiate(&mut store, &missing).unwrap_err();
    assert!(err.to_string().contains("unknown import"), "{err}");

    let mismatched = guest::call_import("host", "value", &[ValType::I64])?;
    let err = linker.instantiate(&mut store, &mismatched).unwrap_err();
    assert_eq!(
        err.to_string(),
        "incompatible import type for `host::value`: expected (func (result i64)), found (func (result i32))"
    );
    assert_eq!(
        linker.get_ty("host", "value"),
        Some(&FuncType::new([], [ValType::I32]))
    );
    assert_eq!(linker.get_ty("host", "other"), None);
    Ok(())
}

#[test]
fn async_functions_need_async_support() -> Result<()> {
    util::init_logger();
    let engine = Engine::new(&Config::new())?;
    let mut linker = Linker::<Ctx>::new(&engine);
    let err = print_host::add_to_linker(&mut linker).unwrap_err();
    assert!(err.to_string().contains("async support"), "{err}");
    assert!(linker.get_ty("host", "print").is_none());
    Ok(())
}

#[test]
fn instantiation_must_match_the_engine() -> Result<()> {
    let async_engine = Engine::new(&util::config())?;
    let sync_engine = Engine::new(&Config::new())?;
    let module = guest::spin()?;

    let mut store = Store::new(&async_engine, Ctx::default());
    let linker = util::linker(&async_engine)?;
    assert!(linker.instantiate(&mut store, &module).is_err());

    let mut store = Store::new(&sync_engine, Ctx::default());
    let linker = Linker::new(&sync_engine);
    assert!(futures::executor::block_on(linker.instantiate_async(&mut store, &module)).is_err());

    let linker = util::linker(&async_engine)?;
    let err = futures::executor::block_on(linker.instantiate_async(&mut store, &module))
        .unwrap_err();
    assert!(err.to_string().contains("async"), "{err}");
    Ok(())
}

#[test]
fn calls_must_match_the_engine() -> Result<()> {
    let async_engine = Engine::new(&util::config())?;
    let mut store = Store::new(&async_engine, Ctx::default());
    let main = instantiate_main(&mut store, &guest::spin()?)?;
    let err = main
        .call(&mut store, &[Val::I32(1)], &mut [Val::I32(0)])
        .unwrap_err();
    assert!(err.to_string().contains("call_async"), "{err}");

    util::init_logger();
    let sync_engine = Engine::new(&Config::new())?;
    let mut store = Store::new(&sync_engine, Ctx::default());
    let instance = Linker::new(&sync_engine).instantiate(&mut store, &guest::spin()?)?;
    let main = instance.get_func(&store, "main").unwrap();
    let mut call = main.call_async(&mut store, &[Val::I32(1)]);
    assert!(call.poll());
    assert!(matches!(call.get_results()?, CallOutcome::Error(_)));
    Ok(())
}

#[test]
fn bad_arguments_complete_with_an_error() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut store = Store::new(&engine, Ctx::default());
    let main = instantiate_main(&mut store, &guest::spin()?)?;

    let cases: [&[Val]; 3] = [&[], &[Val::I64(1)], &[Val::I32(1), Val::I32(2)]];
    for params in cases {
        let mut call = main.call_async(&mut store, params);
        assert!(call.is_done());
        assert!(call.poll());
        match call.get_results()? {
            CallOutcome::Error(e) => assert!(e.to_string().contains("params"), "{e:#}"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(main.ty(&store), FuncType::new([ValType::I32], [ValType::I32]));
    Ok(())
}

#[test]
fn functions_belong_to_their_store() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let module = guest::spin()?;
    let mut a = Store::new(&engine, Ctx::default());
    let mut b = Store::new(&engine, Ctx::default());
    let main_a = instantiate_main(&mut a, &module)?;
    instantiate_main(&mut b, &module)?;

    let mut call = main_a.call_async(&mut b, &[Val::I32(1)]);
    assert!(call.poll());
    match call.get_results()? {
        CallOutcome::Error(e) => assert!(e.to_string().contains("wrong store"), "{e:#}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    Ok(())
}

#[test]
fn async_start_function_runs_on_instantiation() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut b = Module::builder();
    let print = b.import("host", "print", FuncType::new([ValType::I32], []));
    let start = b.func(
        FuncType::new([], []),
        [],
        [Instr::I32Const(9), Instr::Call(print)],
    );
    b.start(start);
    let module = b.build()?;
    assert_eq!(module.exports().len(), 0);

    let mut store = Store::new(&engine, Ctx::new(4));
    let linker = util::linker(&engine)?;
    futures::executor::block_on(linker.instantiate_async(&mut store, &module))?;
    assert_eq!(store.data().printed, [9]);
    assert_eq!(store.data().cleanups(), 1);
    Ok(())
}

#[test]
fn sync_host_functions_on_an_async_engine() -> Result<()> {
    let engine = Engine::new(&util::config())?;
    let mut linker = Linker::new(&engine);
    constant(&mut linker, 11)?;
    let module = guest::call_import("host", "value", &[ValType::I32])?;
    let mut store = Store::new(&engine, Ctx::default());
    let instance = futures::executor::block_on(linker.instantiate_async(&mut store, &module))?;
    let main = instance.get_func(&store, "main").unwrap();

    let mut call = main.call_async(&mut store, &[]);
    let trace = drive(&mut call, || {});
    assert_eq!(trace.pending, 0);
    assert_eq!(returned(&call)?, [Val::I32(11)]);
    Ok(())
}
