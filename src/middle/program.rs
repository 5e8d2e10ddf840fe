//! Whole-program item tables. Every module of a project is folded into one
//! flat namespace of records, functions, archetypes, level globals, and the
//! stream declaration; later stages address items by index.

use std::str::FromStr;

use hashbrown::HashMap;

use crate::{
    backend::mode::Callback,
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{
        ast::{self, LevelGlobalKind},
        intern::InternedSymbol,
    },
    index::{IndexVec, simple_index},
};

simple_index! {
    pub struct RecordId;
}

simple_index! {
    pub struct FunctionId;
}

simple_index! {
    pub struct ArchetypeId;
}

/// Names that resolve without being declared; user items may not shadow them
pub const BUILTIN_NAMES: &[&str] = &[
    "Scalar",
    "array",
    "isinstance",
    "issubclass",
    "len",
    "abs",
    "sign",
    "floor",
    "ceil",
    "round",
    "frac",
    "min",
    "max",
    "clamp",
    "lerp",
    "sin",
    "cos",
    "range",
    "spawn",
    "random",
    "random_integer",
    "entity_index",
    "debug_log",
];

#[derive(Debug)]
pub struct Program {
    pub records: IndexVec<RecordId, RecordItem>,
    pub functions: IndexVec<FunctionId, FunctionItem>,
    pub archetypes: IndexVec<ArchetypeId, ArchetypeItem>,
    pub level_memory: Option<LevelGlobalItem>,
    pub level_data: Option<LevelGlobalItem>,
    pub streams: Option<StreamsItem>,
    names: HashMap<InternedSymbol, ItemRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRef {
    Record(RecordId),
    Function(FunctionId),
    Archetype(ArchetypeId),
    LevelMemory,
    LevelData,
    Streams,
}

#[derive(Debug)]
pub struct RecordItem {
    pub name: ast::Identifier,
    pub type_parameters: Vec<ast::Identifier>,
    pub fields: Vec<ast::FieldDefinition>,
    pub methods: HashMap<InternedSymbol, FunctionId>,
}

impl RecordItem {
    pub fn field_index(&self, name: InternedSymbol) -> Option<usize> {
        self.fields.iter().position(|f| f.name.symbol == name)
    }
}

#[derive(Debug)]
pub struct FunctionItem {
    pub name: ast::Identifier,
    pub parameters: Vec<ast::Identifier>,
    pub body: ast::Block,
    pub owner: FunctionOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionOwner {
    Free,
    Method(RecordId),
    Callback(ArchetypeId, Callback),
}

#[derive(Debug)]
pub struct ArchetypeItem {
    pub name: ast::Identifier,
    pub fields: Vec<ast::ArchetypeFieldDefinition>,
    pub callbacks: HashMap<Callback, FunctionId>,
}

impl ArchetypeItem {
    pub fn field_index(&self, name: InternedSymbol) -> Option<usize> {
        self.fields.iter().position(|f| f.name.symbol == name)
    }
}

#[derive(Debug)]
pub struct LevelGlobalItem {
    pub name: ast::Identifier,
    pub kind: LevelGlobalKind,
    pub fields: Vec<ast::FieldDefinition>,
}

impl LevelGlobalItem {
    pub fn field_index(&self, name: InternedSymbol) -> Option<usize> {
        self.fields.iter().position(|f| f.name.symbol == name)
    }
}

#[derive(Debug)]
pub struct StreamsItem {
    pub name: ast::Identifier,
    pub entries: Vec<ast::StreamEntry>,
}

impl Program {
    pub fn from_modules(modules: Vec<ast::Module>) -> CompileResult<Program> {
        let mut program = Program {
            records: IndexVec::new(),
            functions: IndexVec::new(),
            archetypes: IndexVec::new(),
            level_memory: None,
            level_data: None,
            streams: None,
            names: HashMap::new(),
        };

        for module in modules {
            for item in module.items {
                program.add_item(item)?;
            }
        }

        Ok(program)
    }

    pub fn lookup(&self, name: InternedSymbol) -> Option<ItemRef> {
        self.names.get(&name).copied()
    }

    pub fn record(&self, id: RecordId) -> &RecordItem {
        &self.records[id]
    }

    pub fn function(&self, id: FunctionId) -> &FunctionItem {
        &self.functions[id]
    }

    pub fn archetype(&self, id: ArchetypeId) -> &ArchetypeItem {
        &self.archetypes[id]
    }

    pub fn archetype_by_name(&self, name: &str) -> Option<ArchetypeId> {
        match self.lookup(InternedSymbol::new(name)) {
            Some(ItemRef::Archetype(id)) => Some(id),
            _ => None,
        }
    }

    fn declare(&mut self, name: &ast::Identifier, item: ItemRef) -> CompileResult<()> {
        if BUILTIN_NAMES.contains(&name.symbol.value()) {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                name.span,
                format!("`{}` is a builtin name and cannot be redeclared", name.symbol),
            ));
        }

        if self.names.insert(name.symbol, item).is_some() {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                name.span,
                format!("the name `{}` is declared more than once", name.symbol),
            ));
        }

        Ok(())
    }

    fn add_function(
        &mut self,
        function: ast::FunctionDefinition,
        owner: FunctionOwner,
    ) -> CompileResult<()> {
        for (i, parameter) in function.parameters.iter().enumerate() {
            if function.parameters[..i]
                .iter()
                .any(|p| p.symbol == parameter.symbol)
            {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    parameter.span,
                    format!(
                        "function `{}` declares parameter `{}` more than once",
                        function.name.symbol, parameter.symbol
                    ),
                ));
            }
        }

        self.functions.push(FunctionItem {
            name: function.name,
            parameters: function.parameters,
            body: function.body,
            owner,
        });

        Ok(())
    }

    fn add_item(&mut self, item: ast::Item) -> CompileResult<()> {
        match item.kind {
            ast::ItemKind::FunctionDefinition(function) => {
                self.declare(&function.name, ItemRef::Function(self.functions.next_index()))?;
                self.add_function(*function, FunctionOwner::Free)?;
            }
            ast::ItemKind::RecordDefinition(record) => {
                let record_id = self.records.next_index();

                self.declare(&record.name, ItemRef::Record(record_id))?;

                let mut methods = HashMap::new();

                for method in record.methods {
                    if !method.has_self_parameter() {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            method.name.span,
                            format!(
                                "method `{}` of record `{}` must take `self` as its first parameter",
                                method.name.symbol, record.name.symbol
                            ),
                        ));
                    }

                    let name = method.name.symbol;

                    if methods
                        .insert(name, self.functions.next_index())
                        .is_some()
                    {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            record.name.span,
                            format!(
                                "record `{}` defines method `{name}` more than once",
                                record.name.symbol
                            ),
                        ));
                    }

                    self.add_function(method, FunctionOwner::Method(record_id))?;
                }

                self.records.push(RecordItem {
                    name: record.name,
                    type_parameters: record.type_parameters,
                    fields: record.fields,
                    methods,
                });
            }
            ast::ItemKind::ArchetypeDefinition(archetype) => {
                let archetype_id = self.archetypes.next_index();

                self.declare(&archetype.name, ItemRef::Archetype(archetype_id))?;

                let mut callbacks = HashMap::new();

                for callback in archetype.callbacks {
                    let Ok(kind) = Callback::from_str(callback.name.symbol.value()) else {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            callback.name.span,
                            format!(
                                "`{}` is not a lifecycle callback; archetype functions must be one of the fixed callback set",
                                callback.name.symbol
                            ),
                        ));
                    };

                    if !callback.has_self_parameter() {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            callback.name.span,
                            format!(
                                "callback `{}` must take `self` as its first parameter",
                                callback.name.symbol
                            ),
                        ));
                    }

                    if callback.parameters.len() != 1 {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            callback.name.span,
                            format!(
                                "callback `{}` takes no parameters beyond `self`",
                                callback.name.symbol
                            ),
                        ));
                    }

                    if callbacks
                        .insert(kind, self.functions.next_index())
                        .is_some()
                    {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::TypeResolution,
                            callback.name.span,
                            format!(
                                "archetype `{}` defines callback `{}` more than once",
                                archetype.name.symbol, callback.name.symbol
                            ),
                        ));
                    }

                    self.add_function(callback, FunctionOwner::Callback(archetype_id, kind))?;
                }

                self.archetypes.push(ArchetypeItem {
                    name: archetype.name,
                    fields: archetype.fields,
                    callbacks,
                });
            }
            ast::ItemKind::LevelGlobalDefinition(global) => {
                let (slot, item_ref) = match global.kind {
                    LevelGlobalKind::Memory => (&mut self.level_memory, ItemRef::LevelMemory),
                    LevelGlobalKind::Data => (&mut self.level_data, ItemRef::LevelData),
                };

                if slot.is_some() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        global.name.span,
                        "only one level global declaration of each kind is allowed per program",
                    ));
                }

                let name = global.name.clone();

                *slot = Some(LevelGlobalItem {
                    name: global.name,
                    kind: global.kind,
                    fields: global.fields,
                });

                self.declare(&name, item_ref)?;
            }
            ast::ItemKind::StreamsDefinition(streams) => {
                if self.streams.is_some() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        streams.name.span,
                        "only one streams declaration is allowed per program",
                    ));
                }

                let name = streams.name.clone();

                self.streams = Some(StreamsItem {
                    name: streams.name,
                    entries: streams.entries,
                });

                self.declare(&name, ItemRef::Streams)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::{SourceFile, SourceId, parser::Parser},
        index::Index,
    };

    fn build(source: &str) -> CompileResult<Program> {
        let file = SourceFile::new_in_memory(source);
        let module = Parser::parse_module(&file, SourceId::new(0))?;
        Program::from_modules(vec![module])
    }

    #[test]
    fn collects_items_into_tables() {
        let program = build(
            "record Pair[T] { first: T; second: T; }\n\
             fn double(x) { return x * 2; }\n\
             archetype Note { imported lane: Scalar; fn initialize(self) { pass; } }",
        )
        .unwrap();

        assert_eq!(program.records.len(), 1);
        assert_eq!(program.archetypes.len(), 1);
        // free function plus the callback
        assert_eq!(program.functions.len(), 2);

        let note = program.archetype_by_name("Note").unwrap();
        assert!(program.archetype(note).callbacks.contains_key(&Callback::Initialize));
    }

    #[test]
    fn rejects_duplicate_names() {
        let error = build("fn f() { pass; } record f { x: Scalar; }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }

    #[test]
    fn rejects_shadowing_builtins() {
        let error = build("fn len(x) { return 0; }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }

    #[test]
    fn rejects_unknown_callback_names() {
        let error =
            build("archetype Note { fn frobnicate(self) { pass; } }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }

    #[test]
    fn rejects_methods_without_self() {
        let error = build("record R { x: Scalar; fn add(other) { pass; } }").unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }
}
