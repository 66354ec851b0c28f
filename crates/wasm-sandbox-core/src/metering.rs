//! Gas metering by code injection.
//!
//! Before a module is compiled, every function body is cut into metered
//! blocks: straight-line runs of operators that end at the next branch, call,
//! block boundary or trap. Each block is prefixed with a call to the
//! `metering.gas` import carrying the block's operator count, so the whole
//! block is paid for before its first operator runs. When the meter cannot
//! cover a block, execution stops with nothing in that block executed.
//!
//! The import is appended after the module's own function imports, which
//! shifts every defined function index up by one. Custom sections are dropped.

use std::convert::Infallible;

use tracing::debug;
use wasm_encoder::reencode::{self, Reencode};
use wasm_encoder::{
    CodeSection, EntityType, Function, ImportSection, Instruction, Module, SectionId, TypeSection,
    ValType,
};
use wasmparser::{FunctionBody, Operator, Parser, Payload, TypeRef};

use wasm_sandbox_common::InvocationError;

/// Import module of the gas function.
pub const GAS_MODULE: &str = "metering";

/// Import name of the gas function, `(func (param i64))`.
pub const GAS_FUNCTION: &str = "gas";

/// Rewrite `bytes` so that every metered block charges for itself first.
///
/// `bytes` must already be a valid module. A module without code is
/// returned unchanged.
pub fn inject_gas_metering(bytes: &[u8]) -> Result<Vec<u8>, InvocationError> {
    let Some(layout) = ModuleLayout::scan(bytes)? else {
        return Ok(bytes.to_vec());
    };

    let mut injector = GasInjector {
        gas_type: layout.types,
        gas_function: layout.imported_functions,
        has_imports: layout.has_imports,
        blocks: 0,
    };

    let mut module = Module::new();
    injector
        .parse_core_module(&mut module, Parser::new(0), bytes)
        .map_err(|e| InvocationError::validation(format!("Gas metering injection failed: {e}")))?;

    debug!(metered_blocks = injector.blocks, "Gas metering injected");
    Ok(module.finish())
}

/// What the injector needs to know before rewriting.
struct ModuleLayout {
    types: u32,
    imported_functions: u32,
    has_imports: bool,
}

impl ModuleLayout {
    fn scan(bytes: &[u8]) -> Result<Option<Self>, InvocationError> {
        let parse_error = |e: wasmparser::BinaryReaderError| InvocationError::validation(e.to_string());

        let mut layout = Self {
            types: 0,
            imported_functions: 0,
            has_imports: false,
        };
        let mut has_code = false;

        for payload in Parser::new(0).parse_all(bytes) {
            match payload.map_err(parse_error)? {
                Payload::TypeSection(reader) => {
                    for group in reader {
                        let count = group.map_err(parse_error)?.types().len();
                        layout.types += u32::try_from(count).unwrap_or(u32::MAX);
                    }
                }
                Payload::ImportSection(reader) => {
                    layout.has_imports = true;
                    for import in reader {
                        if let TypeRef::Func(_) = import.map_err(parse_error)?.ty {
                            layout.imported_functions += 1;
                        }
                    }
                }
                Payload::CodeSectionStart { .. } => has_code = true,
                _ => {}
            }
        }

        Ok(has_code.then_some(layout))
    }
}

struct GasInjector {
    gas_type: u32,
    gas_function: u32,
    has_imports: bool,
    blocks: u64,
}

impl GasInjector {
    /// Emit the charge for `block`, then the block itself.
    fn emit_block(&mut self, function: &mut Function, block: &mut Vec<Instruction<'_>>) {
        if block.is_empty() {
            return;
        }

        let operations = i64::try_from(block.len()).unwrap_or(i64::MAX);
        function.instruction(&Instruction::I64Const(operations));
        function.instruction(&Instruction::Call(self.gas_function));
        for instruction in block.drain(..) {
            function.instruction(&instruction);
        }
        self.blocks += 1;
    }

    fn gas_import(&self, imports: &mut ImportSection) {
        imports.import(GAS_MODULE, GAS_FUNCTION, EntityType::Function(self.gas_type));
    }
}

impl Reencode for GasInjector {
    type Error = Infallible;

    fn function_index(&mut self, func: u32) -> u32 {
        if func >= self.gas_function {
            func + 1
        } else {
            func
        }
    }

    fn parse_type_section(
        &mut self,
        types: &mut TypeSection,
        section: wasmparser::TypeSectionReader<'_>,
    ) -> Result<(), reencode::Error<Self::Error>> {
        reencode::utils::parse_type_section(self, types, section)?;
        types.ty().function([ValType::I64], []);
        Ok(())
    }

    fn parse_import_section(
        &mut self,
        imports: &mut ImportSection,
        section: wasmparser::ImportSectionReader<'_>,
    ) -> Result<(), reencode::Error<Self::Error>> {
        reencode::utils::parse_import_section(self, imports, section)?;
        self.gas_import(imports);
        Ok(())
    }

    fn intersperse_section_hook(
        &mut self,
        module: &mut Module,
        after: Option<SectionId>,
        _before: Option<SectionId>,
    ) -> Result<(), reencode::Error<Self::Error>> {
        // A module with code always has a type section; the import section
        // goes right after it.
        if !self.has_imports && after == Some(SectionId::Type) {
            let mut imports = ImportSection::new();
            self.gas_import(&mut imports);
            module.section(&imports);
        }
        Ok(())
    }

    fn parse_custom_section(
        &mut self,
        _module: &mut Module,
        _section: wasmparser::CustomSectionReader<'_>,
    ) -> Result<(), reencode::Error<Self::Error>> {
        Ok(())
    }

    fn parse_function_body(
        &mut self,
        code: &mut CodeSection,
        body: FunctionBody<'_>,
    ) -> Result<(), reencode::Error<Self::Error>> {
        let mut function = self.new_function_with_parsed_locals(&body)?;
        let mut reader = body.get_operators_reader()?;
        let mut block = Vec::new();

        while !reader.eof() {
            let operator = reader.read()?;
            let ends_block = ends_metered_block(&operator);
            block.push(self.instruction(operator)?);
            if ends_block {
                self.emit_block(&mut function, &mut block);
            }
        }
        self.emit_block(&mut function, &mut block);

        code.function(&function);
        Ok(())
    }
}

/// Operators after which control may arrive from somewhere else, or may not
/// arrive at all.
fn ends_metered_block(operator: &Operator<'_>) -> bool {
    matches!(
        operator,
        Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::If { .. }
            | Operator::Else
            | Operator::End
            | Operator::Br { .. }
            | Operator::BrIf { .. }
            | Operator::BrTable { .. }
            | Operator::BrOnNull { .. }
            | Operator::BrOnNonNull { .. }
            | Operator::BrOnCast { .. }
            | Operator::BrOnCastFail { .. }
            | Operator::Return
            | Operator::Unreachable
            | Operator::Call { .. }
            | Operator::CallIndirect { .. }
            | Operator::CallRef { .. }
            | Operator::ReturnCall { .. }
            | Operator::ReturnCallIndirect { .. }
            | Operator::ReturnCallRef { .. }
            | Operator::Try { .. }
            | Operator::TryTable { .. }
            | Operator::Catch { .. }
            | Operator::CatchAll
            | Operator::Delegate { .. }
            | Operator::Throw { .. }
            | Operator::ThrowRef
            | Operator::Rethrow { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inject(wat: &str) -> Vec<u8> {
        let instrumented = inject_gas_metering(&wat::parse_str(wat).unwrap()).unwrap();
        wasmparser::validate(&instrumented).unwrap();
        instrumented
    }

    /// Charges injected into each function body, in order.
    fn charges(bytes: &[u8], gas_function: u32) -> Vec<Vec<i64>> {
        let mut functions = Vec::new();
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::CodeSectionEntry(body) = payload.unwrap() {
                let mut reader = body.get_operators_reader().unwrap();
                let mut pending = None;
                let mut charges = Vec::new();
                while !reader.eof() {
                    match reader.read().unwrap() {
                        Operator::I64Const { value } => pending = Some(value),
                        Operator::Call { function_index } if function_index == gas_function => {
                            charges.extend(pending.take());
                        }
                        _ => pending = None,
                    }
                }
                functions.push(charges);
            }
        }
        functions
    }

    fn imports(bytes: &[u8]) -> Vec<(String, String)> {
        let mut names = Vec::new();
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::ImportSection(reader) = payload.unwrap() {
                for import in reader {
                    let import = import.unwrap();
                    names.push((import.module.to_string(), import.name.to_string()));
                }
            }
        }
        names
    }

    fn exported_function(bytes: &[u8], name: &str) -> Option<u32> {
        for payload in Parser::new(0).parse_all(bytes) {
            if let Payload::ExportSection(reader) = payload.unwrap() {
                for export in reader {
                    let export = export.unwrap();
                    if export.name == name {
                        return Some(export.index);
                    }
                }
            }
        }
        None
    }

    #[test]
    fn test_module_without_code_is_unchanged() {
        let bytes = wat::parse_str("(module (memory 1))").unwrap();
        assert_eq!(inject_gas_metering(&bytes).unwrap(), bytes);
    }

    #[test]
    fn test_straight_line_body_is_one_block() {
        let bytes = inject(
            r#"(module (func (export "run") (param i32 i32) (result i32 i32)
                (i32.const 0)
                (i32.const 0)))"#,
        );

        // Two constants and the closing `end`.
        assert_eq!(charges(&bytes, 0), vec![vec![3]]);
        assert_eq!(imports(&bytes), vec![("metering".into(), "gas".into())]);
        assert_eq!(exported_function(&bytes, "run"), Some(1));
    }

    #[test]
    fn test_loop_body_is_charged_per_iteration() {
        let bytes = inject(
            r#"(module (func
                (local $i i32)
                (loop $again
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $again (i32.lt_u (local.get $i) (i32.const 10))))))"#,
        );

        // [loop] [body ... br_if] [end] [end]
        assert_eq!(charges(&bytes, 0), vec![vec![1, 8, 1, 1]]);
    }

    #[test]
    fn test_calls_end_blocks() {
        let bytes = inject(
            r#"(module
                (func $callee)
                (func (export "run")
                    (call $callee)
                    (drop (i32.const 1))))"#,
        );

        assert_eq!(charges(&bytes, 0), vec![vec![1], vec![1, 3]]);
    }

    #[test]
    fn test_function_indices_shift_past_imports() {
        let bytes = inject(
            r#"(module
                (import "env" "log" (func $log (param i32 i32 i32)))
                (import "env" "memory" (memory 1))
                (func $helper (result i32) (i32.const 7))
                (func $entry (export "run") (result i32) (call $helper))
                (table 1 funcref)
                (elem (i32.const 0) $entry)
                (start $helper2)
                (func $helper2))"#,
        );

        assert_eq!(
            imports(&bytes),
            vec![
                ("env".into(), "log".into()),
                ("env".into(), "memory".into()),
                ("metering".into(), "gas".into()),
            ]
        );
        // $log stays 0, the gas import is 1, $entry moves from 2 to 3.
        assert_eq!(exported_function(&bytes, "run"), Some(3));
        assert_eq!(charges(&bytes, 1).len(), 3);
    }

    #[test]
    fn test_custom_sections_are_dropped() {
        let bytes = inject(r#"(module (@custom "note" "hello") (func $named))"#);

        let custom = Parser::new(0)
            .parse_all(&bytes)
            .filter(|payload| matches!(payload, Ok(Payload::CustomSection(_))))
            .count();
        assert_eq!(custom, 0);
    }
}
