//! # Module Loader
//!
//! Decodes the header and then one section record at a time:
//!
//! ```text
//! magic "\0asm" | version 1 | { id: u8, len: varuint32, payload: [u8; len] }*
//! ```
//!
//! The module ends cleanly only when the input is exhausted exactly at a
//! section boundary. Each section parser must consume its payload exactly.

use crate::builtins;
use crate::config::{MAX_PAGES, PAGE_SIZE};
use crate::const_expr;
use crate::error::{Result, WaveError};
use crate::module::{
    DataSegment, ElementSegment, Export, FunctionBody, Global, Import, ImportDesc, LocalGroup,
    Module, ResizableLimits, TableType, HOST_NAMESPACE, MEMORY_EXPORT,
};
use crate::reader::BinaryReader;
use crate::types::{ExternalKind, FunctionType, SectionId, Value, ValueKind};

/// `\0asm`
const WASM_MAGIC: u32 = 0x6d73_6100;
const WASM_VERSION: u32 = 1;

/// Function type constructor byte.
const FUNC_FORM: u8 = 0x60;

/// Parse a binary module.
pub fn parse(bytes: &[u8]) -> Result<Module> {
    let mut reader = BinaryReader::new(bytes);
    let magic = reader
        .read_u32_le()
        .map_err(|_| WaveError::InvalidHeader("file is shorter than the header".into()))?;
    if magic != WASM_MAGIC {
        return Err(WaveError::InvalidHeader(format!("bad magic {magic:#010x}")));
    }
    let version = reader
        .read_u32_le()
        .map_err(|_| WaveError::InvalidHeader("file is shorter than the header".into()))?;
    if version != WASM_VERSION {
        return Err(WaveError::InvalidHeader(format!("unsupported version {version}")));
    }

    let mut module = Module::default();
    let mut last: Option<SectionId> = None;
    let mut saw_code = false;

    while !reader.is_empty() {
        let raw_id = reader.read_u8()?;
        let len = reader.read_var_u32()? as usize;
        let payload = reader.read_bytes(len)?;

        let id = SectionId::from_u8(raw_id)
            .ok_or_else(|| WaveError::MalformedSection(format!("unknown section id {raw_id}")))?;
        if id != SectionId::Custom {
            if last.is_some_and(|prev| prev >= id) {
                return Err(WaveError::MalformedSection(format!(
                    "{id:?} section is duplicated or out of order"
                )));
            }
            last = Some(id);
        }
        log::debug!("section {id:?}: {len} bytes");

        let mut section = BinaryReader::new(payload);
        parse_section(&mut module, id, &mut section).map_err(|err| match err {
            WaveError::Truncated => {
                WaveError::MalformedSection(format!("{id:?} section payload is truncated"))
            }
            other => other,
        })?;
        if !section.is_empty() {
            return Err(WaveError::MalformedSection(format!(
                "{id:?} section has {} trailing bytes",
                section.remaining()
            )));
        }
        saw_code |= id == SectionId::Code;
    }

    let defined = module.functions.len() - module.host_functions.len();
    if defined > 0 && !saw_code {
        return Err(WaveError::MalformedSection(format!(
            "{defined} functions declared but no code section"
        )));
    }

    log::debug!(
        "loaded module: {} types, {} functions ({} imported), {} exports, {} bytes of memory",
        module.types.len(),
        module.functions.len(),
        module.host_functions.len(),
        module.exports.len(),
        module.memory_size
    );
    Ok(module)
}

fn parse_section(module: &mut Module, id: SectionId, section: &mut BinaryReader<'_>) -> Result<()> {
    match id {
        SectionId::Custom => {
            let name = section.read_name()?;
            log::trace!("skipping custom section `{name}`");
            section.skip(section.remaining())
        }
        SectionId::Type => parse_types(module, section),
        SectionId::Import => parse_imports(module, section),
        SectionId::Function => parse_functions(module, section),
        SectionId::Table => parse_tables(module, section),
        SectionId::Memory => parse_memories(module, section),
        SectionId::Global => parse_globals(module, section),
        SectionId::Export => parse_exports(module, section),
        SectionId::Start => parse_start(module, section),
        SectionId::Element => parse_elements(module, section),
        SectionId::Code => parse_code(module, section),
        SectionId::Data => parse_data(module, section),
    }
}

fn read_value_kind(reader: &mut BinaryReader<'_>) -> Result<ValueKind> {
    let byte = reader.read_u8()?;
    ValueKind::from_byte(byte)
        .filter(|kind| kind.is_numeric())
        .ok_or_else(|| WaveError::MalformedSection(format!("invalid value type 0x{byte:02x}")))
}

fn read_limits(reader: &mut BinaryReader<'_>) -> Result<ResizableLimits> {
    let flags = reader.read_var_u32()?;
    let initial = reader.read_var_u32()?;
    let maximum = match flags {
        0 => None,
        1 => Some(reader.read_var_u32()?),
        _ => {
            return Err(WaveError::UnsupportedFeature(format!(
                "limits flags {flags:#x}"
            )))
        }
    };
    if maximum.is_some_and(|max| max < initial) {
        return Err(WaveError::MalformedSection(
            "limits maximum is below the initial size".into(),
        ));
    }
    Ok(ResizableLimits { initial, maximum })
}

fn read_i32_offset(reader: &mut BinaryReader<'_>, what: &str) -> Result<u32> {
    match const_expr::read(reader)? {
        Value::I32(offset) => Ok(offset as u32),
        other => Err(WaveError::MalformedSection(format!(
            "{what} offset must be i32, found {}",
            other.kind()
        ))),
    }
}

fn parse_types(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let form = section.read_u8()?;
        if form != FUNC_FORM {
            return Err(WaveError::MalformedSection(format!(
                "type form 0x{form:02x} is not func"
            )));
        }
        let param_count = section.read_var_u32()?;
        let mut params = Vec::with_capacity(param_count.min(64) as usize);
        for _ in 0..param_count {
            params.push(read_value_kind(section)?);
        }
        let result = match section.read_var_u32()? {
            0 => None,
            1 => Some(read_value_kind(section)?),
            n => {
                return Err(WaveError::UnsupportedFeature(format!(
                    "function type with {n} results"
                )))
            }
        };
        let ty = FunctionType::new(params, result);
        let canonical = module
            .types
            .iter()
            .position(|existing| *existing == ty)
            .unwrap_or(module.types.len());
        module.canonical_types.push(canonical as u32);
        module.types.push(ty);
    }
    Ok(())
}

fn check_type_index(module: &Module, type_idx: u32) -> Result<()> {
    if (type_idx as usize) < module.types.len() {
        Ok(())
    } else {
        Err(WaveError::OutOfBounds(format!(
            "type index {type_idx} (have {})",
            module.types.len()
        )))
    }
}

fn declare_memory(module: &mut Module, limits: ResizableLimits) -> Result<()> {
    if module.memory.is_some() {
        return Err(WaveError::UnsupportedFeature("multiple memories".into()));
    }
    if limits.initial > MAX_PAGES || limits.maximum.is_some_and(|max| max > MAX_PAGES) {
        return Err(WaveError::MalformedSection(format!(
            "memory larger than {MAX_PAGES} pages"
        )));
    }
    module.memory = Some(limits);
    module.memory_size = limits.initial as usize * PAGE_SIZE;
    Ok(())
}

fn parse_imports(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let module_name = section.read_name()?;
        let field = section.read_name()?;
        let kind_byte = section.read_u8()?;
        if module_name != HOST_NAMESPACE {
            return Err(WaveError::UnsupportedFeature(format!(
                "import from module `{module_name}`"
            )));
        }
        let desc = match ExternalKind::from_byte(kind_byte) {
            Some(ExternalKind::Function) => {
                let type_index = section.read_var_u32()?;
                check_type_index(module, type_index)?;
                let builtin = builtins::lookup(&field).ok_or_else(|| WaveError::UnknownBuiltin {
                    module: module_name.clone(),
                    name: field.clone(),
                })?;
                let declared = &module.types[type_index as usize];
                if !builtins::BUILTINS[builtin].matches(declared) {
                    log::warn!("import `{field}` declared as {declared} differs from the builtin prototype");
                }
                module.functions.push(type_index);
                module.host_functions.push(builtin);
                ImportDesc::Function {
                    type_index,
                    builtin,
                }
            }
            Some(ExternalKind::Table) => {
                return Err(WaveError::UnsupportedFeature(format!(
                    "table import `{field}`"
                )))
            }
            Some(ExternalKind::Memory) => {
                let limits = read_limits(section)?;
                declare_memory(module, limits)?;
                ImportDesc::Memory(limits)
            }
            Some(ExternalKind::Global) => {
                let kind = read_value_kind(section)?;
                if section.read_var_u1()? {
                    return Err(WaveError::UnsupportedFeature(format!(
                        "mutable global import `{field}`"
                    )));
                }
                let value = builtins::lookup_global(&field)
                    .filter(|value| value.kind() == kind)
                    .ok_or_else(|| WaveError::UnknownBuiltin {
                        module: module_name.clone(),
                        name: field.clone(),
                    })?;
                module.globals.push(Global {
                    kind,
                    mutable: false,
                    init: value,
                });
                ImportDesc::Global { kind, value }
            }
            None => {
                return Err(WaveError::MalformedSection(format!(
                    "import kind {kind_byte}"
                )))
            }
        };
        module.imports.push(Import {
            module: module_name,
            field,
            desc,
        });
    }
    Ok(())
}

fn parse_functions(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let type_idx = section.read_var_u32()?;
        check_type_index(module, type_idx)?;
        module.functions.push(type_idx);
    }
    Ok(())
}

fn parse_tables(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    if count > 1 {
        return Err(WaveError::UnsupportedFeature(format!("{count} tables")));
    }
    for _ in 0..count {
        let element = section.read_u8()?;
        if ValueKind::from_byte(element) != Some(ValueKind::FuncRef) {
            return Err(WaveError::UnsupportedFeature(format!(
                "table element type 0x{element:02x}"
            )));
        }
        let limits = read_limits(section)?;
        module.table = Some(TableType {
            element: ValueKind::FuncRef,
            limits,
        });
    }
    Ok(())
}

fn parse_memories(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let limits = read_limits(section)?;
        declare_memory(module, limits)?;
    }
    Ok(())
}

fn parse_globals(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let kind = read_value_kind(section)?;
        let mutable = section.read_var_u1()?;
        let init = const_expr::read(section)?;
        if init.kind() != kind {
            return Err(WaveError::MalformedSection(format!(
                "global of type {kind} initialized with {}",
                init.kind()
            )));
        }
        module.globals.push(Global {
            kind,
            mutable,
            init,
        });
    }
    Ok(())
}

fn parse_exports(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let name = section.read_name()?;
        let kind_byte = section.read_u8()?;
        let index = section.read_var_u32()?;
        let kind = ExternalKind::from_byte(kind_byte)
            .ok_or_else(|| WaveError::MalformedSection(format!("export kind {kind_byte}")))?;
        let limit = match kind {
            ExternalKind::Function => module.functions.len(),
            ExternalKind::Table => usize::from(module.table.is_some()),
            ExternalKind::Memory => usize::from(module.memory.is_some()),
            ExternalKind::Global => module.globals.len(),
        };
        if index as usize >= limit {
            return Err(WaveError::OutOfBounds(format!(
                "export `{name}` targets {kind:?} {index}"
            )));
        }
        if module.exports.iter().any(|export| export.name == name) {
            return Err(WaveError::MalformedSection(format!("duplicate export `{name}`")));
        }
        if name == MEMORY_EXPORT {
            let limits = match (kind, module.memory) {
                (ExternalKind::Memory, Some(limits)) => limits,
                _ => {
                    return Err(WaveError::MalformedSection(format!(
                        "`{MEMORY_EXPORT}` export is a {kind:?}"
                    )))
                }
            };
            module.memory_size = limits.initial as usize * PAGE_SIZE;
        }
        module.exports.push(Export { name, kind, index });
    }
    Ok(())
}

fn parse_start(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let index = section.read_var_u32()?;
    let ty = module
        .function_type(index)
        .ok_or_else(|| WaveError::OutOfBounds(format!("start function {index}")))?;
    if !ty.params.is_empty() || ty.has_return() {
        return Err(WaveError::MalformedSection(format!(
            "start function has type {ty}"
        )));
    }
    module.start = Some(index);
    Ok(())
}

fn parse_elements(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let table_idx = section.read_var_u32()?;
        if table_idx != 0 {
            return Err(WaveError::UnsupportedFeature(format!(
                "element segment for table {table_idx}"
            )));
        }
        let table = module
            .table
            .ok_or_else(|| WaveError::OutOfBounds("element segment without a table".into()))?;
        let offset = read_i32_offset(section, "element")?;
        let len = section.read_var_u32()?;
        let mut functions = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            let func_idx = section.read_var_u32()?;
            if func_idx >= module.function_count() {
                return Err(WaveError::OutOfBounds(format!(
                    "element references function {func_idx}"
                )));
            }
            functions.push(func_idx);
        }
        let end = u64::from(offset) + u64::from(len);
        if end > u64::from(table.limits.initial) {
            return Err(WaveError::OutOfBounds(format!(
                "element segment [{offset}, {end}) exceeds table size {}",
                table.limits.initial
            )));
        }
        module.elements.push(ElementSegment { offset, functions });
    }
    Ok(())
}

fn parse_code(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()? as usize;
    let declared = module.functions.len() - module.host_functions.len();
    if count != declared {
        return Err(WaveError::MalformedSection(format!(
            "{count} bodies for {declared} declared functions"
        )));
    }
    for i in 0..count {
        let size = section.read_var_u32()? as usize;
        let mut body = BinaryReader::new(section.read_bytes(size)?);
        let group_count = body.read_var_u32()?;
        let func_idx = (module.host_functions.len() + i) as u32;
        let params = module
            .function_type(func_idx)
            .map_or(0, |ty| ty.params.len() as u64);
        let mut total = params;
        let mut locals = Vec::with_capacity(group_count.min(64) as usize);
        for _ in 0..group_count {
            let count = body.read_var_u32()?;
            let kind = read_value_kind(&mut body)?;
            total += u64::from(count);
            if total > u64::from(u32::MAX) {
                return Err(WaveError::OutOfBounds(format!(
                    "function {func_idx} declares {total} locals"
                )));
            }
            locals.push(LocalGroup { count, kind });
        }
        module.bodies.push(FunctionBody {
            locals,
            code: body.rest().to_vec(),
        });
    }
    Ok(())
}

fn parse_data(module: &mut Module, section: &mut BinaryReader<'_>) -> Result<()> {
    let count = section.read_var_u32()?;
    for _ in 0..count {
        let memory_idx = section.read_var_u32()?;
        if memory_idx != 0 {
            return Err(WaveError::UnsupportedFeature(format!(
                "data segment for memory {memory_idx}"
            )));
        }
        let offset = read_i32_offset(section, "data")?;
        let len = section.read_var_u32()? as usize;
        let bytes = section.read_bytes(len)?.to_vec();
        let end = offset as usize + len;
        if end > module.memory_size {
            return Err(WaveError::OutOfBounds(format!(
                "data segment [{offset}, {end}) exceeds memory size {}",
                module.memory_size
            )));
        }
        module.data.push(DataSegment { offset, bytes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn module_with(sections: &[(u8, &[u8])]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        for (id, payload) in sections {
            bytes.push(*id);
            bytes.push(payload.len() as u8);
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    #[test]
    fn test_empty_module() {
        let module = parse(&HEADER).unwrap();
        assert!(module.types.is_empty());
        assert_eq!(module.memory_size, 0);
    }

    #[test]
    fn test_bad_header() {
        assert!(matches!(parse(&[0, 0x61, 0x73]), Err(WaveError::InvalidHeader(_))));
        let mut bytes = HEADER;
        bytes[4] = 2;
        assert!(matches!(parse(&bytes), Err(WaveError::InvalidHeader(_))));
    }

    #[test]
    fn test_truncated_section_header_is_fatal() {
        // Section id with no length.
        let mut bytes = HEADER.to_vec();
        bytes.push(1);
        assert_eq!(parse(&bytes).unwrap_err(), WaveError::Truncated);
        // Payload shorter than declared.
        bytes.extend_from_slice(&[5, 0x01, 0x60]);
        assert_eq!(parse(&bytes).unwrap_err(), WaveError::Truncated);
    }

    #[test]
    fn test_types_and_canonical_indices() {
        // (i32) -> i32, () , (i32) -> i32
        let payload = [3, 0x60, 1, 0x7f, 1, 0x7f, 0x60, 0, 0, 0x60, 1, 0x7f, 1, 0x7f];
        let module = parse(&module_with(&[(1, &payload)])).unwrap();
        assert_eq!(module.types.len(), 3);
        assert_eq!(module.canonical_types, vec![0, 1, 0]);
        assert_eq!(module.types[0].result, Some(ValueKind::I32));
    }

    #[test]
    fn test_payload_must_be_consumed_exactly() {
        // One type with a stray trailing byte.
        let payload = [1, 0x60, 0, 0, 0xaa];
        assert!(matches!(
            parse(&module_with(&[(1, &payload)])),
            Err(WaveError::MalformedSection(_))
        ));
        // Count says two types, payload holds one.
        let payload = [2, 0x60, 0, 0];
        assert!(matches!(
            parse(&module_with(&[(1, &payload)])),
            Err(WaveError::MalformedSection(_))
        ));
    }

    #[test]
    fn test_custom_section_is_skipped() {
        let payload = [4, b'n', b'a', b'm', b'e', 1, 2, 3];
        let module = parse(&module_with(&[(0, &payload), (1, &[0])])).unwrap();
        assert!(module.types.is_empty());
    }

    #[test]
    fn test_section_order_is_enforced() {
        let bytes = module_with(&[(3, &[0]), (1, &[0])]);
        assert!(matches!(parse(&bytes), Err(WaveError::MalformedSection(_))));
    }

    #[test]
    fn test_function_references_missing_type() {
        let bytes = module_with(&[(1, &[0]), (3, &[1, 0])]);
        assert!(matches!(parse(&bytes), Err(WaveError::OutOfBounds(_))));
    }

    #[test]
    fn test_unknown_builtin_import() {
        let mut import = vec![1, 3, b'e', b'n', b'v', 4, b'n', b'o', b'p', b'e', 0, 0];
        let bytes = module_with(&[(1, &[1, 0x60, 0, 0]), (2, &import)]);
        assert_eq!(
            parse(&bytes).unwrap_err(),
            WaveError::UnknownBuiltin {
                module: "env".into(),
                name: "nope".into()
            }
        );

        import[2..5].copy_from_slice(b"lib");
        let bytes = module_with(&[(1, &[1, 0x60, 0, 0]), (2, &import)]);
        assert!(matches!(parse(&bytes), Err(WaveError::UnsupportedFeature(_))));
    }

    #[test]
    fn test_mutable_global_import_is_rejected() {
        let mut import = vec![1, 3, b'e', b'n', b'v', 13];
        import.extend_from_slice(b"__memory_base");
        import.extend_from_slice(&[3, 0x7f, 1]);
        let bytes = module_with(&[(2, &import)]);
        assert!(matches!(parse(&bytes), Err(WaveError::UnsupportedFeature(_))));

        *import.last_mut().unwrap() = 0;
        let module = parse(&module_with(&[(2, &import)])).unwrap();
        assert_eq!(module.globals[0].init, Value::I32(0));
    }

    #[test]
    fn test_memory_export_sizes_memory() {
        let memory = [1, 1, 2, 4];
        let export = [1, 6, b'm', b'e', b'm', b'o', b'r', b'y', 2, 0];
        let module = parse(&module_with(&[(5, &memory), (7, &export)])).unwrap();
        assert_eq!(module.memory, Some(ResizableLimits { initial: 2, maximum: Some(4) }));
        assert_eq!(module.memory_size, 2 * PAGE_SIZE);
    }

    #[test]
    fn test_memory_export_must_name_memory() {
        let types = [1, 0x60, 0, 0];
        let export = [1, 6, b'm', b'e', b'm', b'o', b'r', b'y', 0, 0];
        let bytes = module_with(&[(1, &types), (3, &[1, 0]), (7, &export), (10, &[1, 2, 0, 0x0b])]);
        assert!(matches!(parse(&bytes), Err(WaveError::MalformedSection(_))));
    }

    #[test]
    fn test_data_segment_bounds() {
        let memory = [1, 0, 1];
        // 4 bytes at offset 65534 overrun one page.
        let data = [1, 0, 0x41, 0xfe, 0xff, 0x03, 0x0b, 4, 1, 2, 3, 4];
        let bytes = module_with(&[(5, &memory), (11, &data)]);
        assert!(matches!(parse(&bytes), Err(WaveError::OutOfBounds(_))));

        let data = [1, 0, 0x41, 0x00, 0x0b, 4, 1, 2, 3, 4];
        let module = parse(&module_with(&[(5, &memory), (11, &data)])).unwrap();
        assert_eq!(module.data[0].bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_element_segment_bounds() {
        let types = [1, 0x60, 0, 0];
        let table = [1, 0x70, 0, 2];
        let code = [1, 2, 0, 0x0b];
        // Offset 1 with two entries overruns a two-slot table.
        let elements = [1, 0, 0x41, 1, 0x0b, 2, 0, 0];
        let bytes = module_with(&[(1, &types), (3, &[1, 0]), (4, &table), (9, &elements), (10, &code)]);
        assert!(matches!(parse(&bytes), Err(WaveError::OutOfBounds(_))));

        let elements = [1, 0, 0x41, 0, 0x0b, 2, 0, 0];
        let bytes = module_with(&[(1, &types), (3, &[1, 0]), (4, &table), (9, &elements), (10, &code)]);
        let module = parse(&bytes).unwrap();
        assert_eq!(module.elements[0], ElementSegment { offset: 0, functions: vec![0, 0] });
    }

    #[test]
    fn test_code_count_must_match() {
        let bytes = module_with(&[(1, &[1, 0x60, 0, 0]), (3, &[2, 0, 0]), (10, &[1, 2, 0, 0x0b])]);
        assert!(matches!(parse(&bytes), Err(WaveError::MalformedSection(_))));
        let bytes = module_with(&[(1, &[1, 0x60, 0, 0]), (3, &[1, 0])]);
        assert!(matches!(parse(&bytes), Err(WaveError::MalformedSection(_))));
    }

    #[test]
    fn test_local_groups() {
        // (i32) -> (); locals: 2 x i64, 1 x i32
        let types = [1, 0x60, 1, 0x7f, 0];
        let code = [1, 6, 2, 2, 0x7e, 1, 0x7f, 0x0b];
        let module = parse(&module_with(&[(1, &types), (3, &[1, 0]), (10, &code)])).unwrap();
        assert_eq!(module.bodies[0].declared_locals(), 3);
        assert_eq!(module.frame_slots(0), Some(4));
        assert_eq!(module.bodies[0].code, vec![0x0b]);
    }
}
