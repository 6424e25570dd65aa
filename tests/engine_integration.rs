//! End-to-end engine tests: build IR, add modules, look up and call the
//! resulting native code.

use std::sync::Arc;

use kiln::ir::module::Global;
use kiln::ir::IntCond;
use kiln::pipeline::optimize::NoTransform;
use kiln::{
    AddModuleError, FuncBuilder, Function, JitConfig, JitEngine, Linkage, LookupError, Module,
    Signature, Type, VerifyPolicy,
};

type NiladicI32 = extern "C" fn() -> i32;
type UnaryI64 = extern "C" fn(i64) -> i64;

fn const_fn_module(module_name: &str, func_name: &str, value: i32) -> Module {
    let mut func = Function::new(func_name, Signature::returning(Type::I32), Linkage::Export);
    let mut b = FuncBuilder::new(&mut func);
    let v = b.const_i32(value);
    b.ret(Some(v));
    let mut module = Module::new(module_name);
    module.push_function(func);
    module
}

fn call_i32(engine: &JitEngine, name: &str) -> i32 {
    let sym = engine.lookup(name).unwrap();
    let f: NiladicI32 = unsafe { std::mem::transmute(sym.address) };
    f()
}

#[test]
fn test_lookup_before_add_is_unresolved() {
    let engine = JitEngine::create().unwrap();
    let err = engine.lookup("never_added").unwrap_err();
    assert!(matches!(err, LookupError::Unresolved { .. }));
}

#[test]
fn test_compile_and_call_constant_function() {
    let engine = JitEngine::create().unwrap();
    engine.add_module(const_fn_module("demo", "testFun", 42)).unwrap();
    assert_eq!(call_i32(&engine, "testFun"), 42);
}

#[test]
fn test_optimizer_folds_before_codegen() {
    // 6 * 7 with an added zero; the pipeline folds it, the result must
    // still be exactly 42.
    let mut func = Function::new("folded", Signature::returning(Type::I32), Linkage::Export);
    let mut b = FuncBuilder::new(&mut func);
    let six = b.const_i32(6);
    let seven = b.const_i32(7);
    let product = b.imul(six, seven);
    let zero = b.const_i32(0);
    let sum = b.iadd(product, zero);
    b.ret(Some(sum));
    let mut module = Module::new("demo");
    module.push_function(func);

    let engine = JitEngine::create().unwrap();
    engine.add_module(module).unwrap();
    assert_eq!(call_i32(&engine, "folded"), 42);
}

#[test]
fn test_branches_and_parameters() {
    // abs(x) as a two-armed branch
    let sig = Signature { params: vec![Type::I64], ret: Some(Type::I64) };
    let mut func = Function::new("abs64", sig, Linkage::Export);
    let x = func.param(0);
    let mut b = FuncBuilder::new(&mut func);
    let neg_block = b.create_block();
    let pos_block = b.create_block();
    let zero = b.const_i64(0);
    let is_neg = b.icmp(IntCond::Lt, x, zero);
    b.branch(is_neg, neg_block, pos_block);
    b.switch_to_block(neg_block);
    let negated = b.isub(zero, x);
    b.ret(Some(negated));
    b.switch_to_block(pos_block);
    b.ret(Some(x));
    let mut module = Module::new("demo");
    module.push_function(func);

    let engine = JitEngine::create().unwrap();
    engine.add_module(module).unwrap();
    let sym = engine.lookup("abs64").unwrap();
    let abs64: UnaryI64 = unsafe { std::mem::transmute(sym.address) };
    assert_eq!(abs64(-5), 5);
    assert_eq!(abs64(9), 9);
}

#[test]
fn test_cross_module_call() {
    // Module A exports inc; module B calls it by name.
    let sig = Signature { params: vec![Type::I64], ret: Some(Type::I64) };
    let mut inc = Function::new("inc", sig.clone(), Linkage::Export);
    let x = inc.param(0);
    let mut b = FuncBuilder::new(&mut inc);
    let one = b.const_i64(1);
    let sum = b.iadd(x, one);
    b.ret(Some(sum));
    let mut module_a = Module::new("a");
    module_a.push_function(inc);

    let mut twice = Function::new("inc_twice", sig, Linkage::Export);
    let x = twice.param(0);
    let mut b = FuncBuilder::new(&mut twice);
    let once = b.call("inc", vec![x], Type::I64);
    let result = b.call("inc", vec![once], Type::I64);
    b.ret(Some(result));
    let mut module_b = Module::new("b");
    module_b.push_function(twice);

    let engine = JitEngine::create().unwrap();
    engine.add_module(module_a).unwrap();
    engine.add_module(module_b).unwrap();

    let sym = engine.lookup("inc_twice").unwrap();
    let inc_twice: UnaryI64 = unsafe { std::mem::transmute(sym.address) };
    assert_eq!(inc_twice(40), 42);
}

#[test]
fn test_duplicate_symbol_rejected_and_original_kept() {
    let engine = JitEngine::create().unwrap();
    engine.add_module(const_fn_module("first", "dup", 1)).unwrap();
    let err = engine.add_module(const_fn_module("second", "dup", 2)).unwrap_err();
    assert!(matches!(err, AddModuleError::Link(_)));
    assert_eq!(call_i32(&engine, "dup"), 1);
}

#[test]
fn test_global_data_symbol() {
    // A 32-bit global initialized to 42, plus a function reading it
    // through its symbol.
    let mut reader = Function::new("read_exposed", Signature::returning(Type::I32), Linkage::Export);
    let mut b = FuncBuilder::new(&mut reader);
    let addr = b.global_addr("exposed_global");
    let value = b.load(Type::I32, addr, 0);
    b.ret(Some(value));

    let mut module = Module::new("demo");
    module.push_global(Global {
        name: "exposed_global".into(),
        ty: Type::I32,
        init: 42,
        linkage: Linkage::Export,
    });
    module.push_function(reader);

    let engine = JitEngine::create().unwrap();
    engine.add_module(module).unwrap();

    let global = engine.lookup("exposed_global").unwrap();
    assert!(!global.flags.callable);
    let stored = unsafe { *(global.address as *const i32) };
    assert_eq!(stored, 42);
    assert_eq!(call_i32(&engine, "read_exposed"), 42);
}

#[cfg(unix)]
#[test]
fn test_jit_code_calls_process_symbol() {
    // strlen comes from the process-symbol generator, not from any module.
    let sig = Signature { params: vec![Type::Ptr], ret: Some(Type::I64) };
    let mut func = Function::new("measure", sig, Linkage::Export);
    let p = func.param(0);
    let mut b = FuncBuilder::new(&mut func);
    let len = b.call("strlen", vec![p], Type::I64);
    b.ret(Some(len));
    let mut module = Module::new("demo");
    module.push_function(func);

    let engine = JitEngine::create().unwrap();
    engine.add_module(module).unwrap();

    let sym = engine.lookup("measure").unwrap();
    let measure: extern "C" fn(*const u8) -> i64 = unsafe { std::mem::transmute(sym.address) };
    assert_eq!(measure(c"hello".as_ptr() as *const u8), 5);
}

#[test]
fn test_remove_tracker_frees_symbols() {
    let engine = JitEngine::create().unwrap();
    let keep = engine.create_resource_tracker();
    let scratch = engine.create_resource_tracker();
    engine
        .add_module_with_tracker(&keep, const_fn_module("kept", "kept_fn", 7))
        .unwrap();
    engine
        .add_module_with_tracker(&scratch, const_fn_module("scratch", "scratch_fn", 8))
        .unwrap();

    engine.remove_tracker(&scratch).unwrap();
    assert!(matches!(
        engine.lookup("scratch_fn").unwrap_err(),
        LookupError::Unresolved { .. }
    ));
    assert_eq!(call_i32(&engine, "kept_fn"), 7);

    // The freed name may be defined again under a fresh tracker.
    let again = engine.create_resource_tracker();
    engine
        .add_module_with_tracker(&again, const_fn_module("redo", "scratch_fn", 9))
        .unwrap();
    assert_eq!(call_i32(&engine, "scratch_fn"), 9);
}

#[test]
fn test_add_to_removed_tracker_fails() {
    let engine = JitEngine::create().unwrap();
    let tracker = engine.create_resource_tracker();
    engine.remove_tracker(&tracker).unwrap();
    let err = engine
        .add_module_with_tracker(&tracker, const_fn_module("late", "late_fn", 1))
        .unwrap_err();
    assert!(matches!(err, AddModuleError::Link(_)));
    assert!(engine.lookup("late_fn").is_err());
}

#[test]
fn test_concurrent_module_adds() {
    let engine = Arc::new(JitEngine::create().unwrap());
    let mut handles = vec![];
    for i in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            let name = format!("worker_fn_{i}");
            engine
                .add_module(const_fn_module(&format!("worker_{i}"), &name, i))
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for i in 0..4 {
        assert_eq!(call_i32(&engine, &format!("worker_fn_{i}")), i);
    }
}

#[test]
fn test_strict_verification_rejects_bad_module() {
    let mut broken = Function::new("broken", Signature::returning(Type::I32), Linkage::Export);
    broken.add_block();
    let mut module = Module::new("demo");
    module.push_function(broken);

    let engine = JitEngine::create().unwrap();
    let err = engine.add_module(module).unwrap_err();
    assert!(matches!(err, AddModuleError::Verify(_)));
    assert!(engine.lookup("broken").is_err());
}

#[test]
fn test_permissive_verification_reports_and_continues() {
    let mut broken = Function::new("trapping", Signature::returning(Type::I32), Linkage::Export);
    broken.add_block();
    let mut module = Module::new("demo");
    module.push_function(broken);

    let config = JitConfig { verify: VerifyPolicy::Permissive, ..JitConfig::default() };
    let engine = JitEngine::with_config(config).unwrap();
    engine.add_module(module).unwrap();

    // The defect was reported, and the symbol still materialized (as a
    // trap, which we never call).
    let errors = engine.session().take_errors();
    assert_eq!(errors.len(), 1);
    assert!(engine.lookup("trapping").is_ok());
}

#[test]
fn test_transform_strategy_is_injectable() {
    let config = JitConfig {
        transform: Some(Arc::new(NoTransform)),
        ..JitConfig::default()
    };
    let engine = JitEngine::with_config(config).unwrap();
    engine.add_module(const_fn_module("raw", "raw_fn", 11)).unwrap();
    assert_eq!(call_i32(&engine, "raw_fn"), 11);
}

#[test]
fn test_dump_shows_published_symbols() {
    let engine = JitEngine::create().unwrap();
    engine.add_module(const_fn_module("demo", "visible", 3)).unwrap();
    let text = engine.dump();
    assert!(text.contains("dylib \"main\""));
    assert!(text.contains("visible"));
}
