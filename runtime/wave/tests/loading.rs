//! Whole-module parsing through the public loader.

mod common;

use common::ValType::{I32, I64};
use common::{body, ConstExpr, Instruction as I, TestModule};
use wave::loader;
use wave::module::ImportDesc;
use wave::types::ExternalKind;
use wave::{Value, ValueKind, WaveError};

#[test]
fn test_parse_full_module() {
    let mut m = TestModule::new();
    let write_ty = m.ty(&[I32, I32, I32], &[I32]);
    let void_ty = m.ty(&[], &[]);
    // Structurally equal to `write_ty`.
    let alias_ty = m.ty(&[I32, I32, I32], &[I32]);
    let write = m.import_function("wasm_write_fd", write_ty);
    let init = m.function(void_ty, &body(&[(2, I32), (1, I64)], &[I::End]));
    let main = m.function(alias_ty, &body(&[], &[I::I32Const(0), I::End]));
    m.memory(2, Some(8));
    m.table(4);
    m.global(I64, true, &ConstExpr::i64_const(5));
    m.start(init);
    m.elements(1, &[main, write]);
    m.data(10, b"abc");
    m.export_function("main", main);

    let module = loader::parse(&m.finish()).unwrap();
    assert_eq!(module.function_count(), 3);
    assert_eq!(module.imported_function_count(), 1);
    assert!(module.is_import(write));
    assert!(matches!(
        module.imports[0].desc,
        ImportDesc::Function { type_index: 0, .. }
    ));
    assert_eq!(module.canonical_types, vec![0, 1, 0]);
    assert_eq!(
        module.canonical_function_type(main),
        module.canonical_function_type(write)
    );
    assert_eq!(module.frame_slots(init), Some(3));
    assert_eq!(module.memory_pages(), 2);
    assert_eq!(module.memory.and_then(|limits| limits.maximum), Some(8));
    assert_eq!(module.globals[0].kind, ValueKind::I64);
    assert_eq!(module.globals[0].init, Value::I64(5));
    assert_eq!(module.start, Some(init));
    assert_eq!(module.elements[0].offset, 1);
    assert_eq!(module.elements[0].functions, vec![main, write]);
    assert_eq!(module.data[0].bytes, b"abc".to_vec());
    assert_eq!(
        module.export("main", ExternalKind::Function).map(|export| export.index),
        Some(main)
    );
    assert!(module.export("memory", ExternalKind::Memory).is_some());
}

#[test]
fn test_unknown_builtin_is_rejected() {
    let mut m = TestModule::new();
    let ty = m.ty(&[], &[]);
    m.import_function("wasm_open_fd", ty);

    assert_eq!(
        loader::parse(&m.finish()).unwrap_err(),
        WaveError::UnknownBuiltin {
            module: "env".into(),
            name: "wasm_open_fd".into()
        }
    );
}

#[test]
fn test_mismatched_builtin_prototype_still_loads() {
    let mut m = TestModule::new();
    let ty = m.ty(&[I64], &[]);
    m.import_function("wasm_close_fd", ty);

    let module = loader::parse(&m.finish()).unwrap();
    assert_eq!(module.host_function(0), Some(0));
}

#[test]
fn test_segments_must_fit() {
    let mut m = TestModule::new();
    m.memory(1, None);
    m.data(65534, &[1, 2, 3]);
    assert!(matches!(
        loader::parse(&m.finish()),
        Err(WaveError::OutOfBounds(_))
    ));

    let mut m = TestModule::new();
    let ty = m.ty(&[], &[]);
    let f = m.function(ty, &body(&[], &[I::End]));
    m.table(1);
    m.elements(1, &[f]);
    assert!(matches!(
        loader::parse(&m.finish()),
        Err(WaveError::OutOfBounds(_))
    ));
}

#[test]
fn test_start_function_must_be_nullary() {
    let mut m = TestModule::new();
    let ty = m.ty(&[I32], &[]);
    let f = m.function(ty, &body(&[], &[I::End]));
    m.start(f);
    assert!(matches!(
        loader::parse(&m.finish()),
        Err(WaveError::MalformedSection(_))
    ));
}

#[test]
fn test_global_initializers_are_checked() {
    let mut m = TestModule::new();
    m.global(I32, false, &ConstExpr::i32_const(40));
    m.global(I32, true, &ConstExpr::global_get(0));
    assert_eq!(
        loader::parse(&m.finish()).unwrap_err(),
        WaveError::MalformedConstExpr(0x23)
    );

    let mut m = TestModule::new();
    m.global(I64, false, &ConstExpr::i32_const(1));
    assert!(matches!(
        loader::parse(&m.finish()),
        Err(WaveError::MalformedSection(_))
    ));
}

#[test]
fn test_truncated_module() {
    let mut m = TestModule::new();
    let ty = m.ty(&[], &[I32]);
    let f = m.function(ty, &body(&[], &[I::I32Const(1), I::End]));
    m.export_function("f", f);
    let bytes = m.finish();

    for len in [3, 7, bytes.len() - 1] {
        assert!(loader::parse(&bytes[..len]).is_err(), "prefix of {len} bytes");
    }
}
