//! Pulse engine-script compiler. The pipeline takes Pulse sources plus a
//! project's mode/archetype assignments and produces, per execution mode, a
//! flat node graph addressed by (archetype, callback, root) plus a memory
//! layout table; alongside them a level-data schema artifact and the stream
//! manifest used for append-only compatibility checking.

use backend::{
    codegen::Codegen,
    layout::{self, ProgramLayout},
    mode::{Callback, Mode},
    node::{NodeTable, OutputNode},
};
use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use frontend::{SourceFile, SourceMap, parser::Parser};
use middle::{
    defassign,
    program::{ArchetypeId, Program},
    specialize::{Specializer, UnitCtx},
    ty::{RecordInstances, TypeCtx},
};

pub mod backend;
pub mod diagnostics;
pub mod frontend;
pub mod index;
pub mod middle;
pub mod project;

/// Compile-time-selected behaviors external to the language semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileOptions {
    pub asserts: AssertMode,
}

/// How a source-level assertion lowers. Never an exception; the choice is
/// baked into the generated graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AssertMode {
    /// Failed assertions halt the callback
    #[default]
    Halt,
    /// Failed assertions emit a diagnostic notification and continue
    Log,
    /// Assertions are elided
    Off,
}

/// The archetypes to compile for one mode, in runtime id order
#[derive(Debug, Clone)]
pub struct ModePlan {
    pub mode: Mode,
    pub archetypes: Vec<String>,
}

/// One compiled (archetype, callback) entry point
#[derive(Debug, serde::Serialize)]
pub struct CallbackEntry {
    pub archetype: String,
    pub archetype_id: u32,
    pub callback: &'static str,
    pub root: usize,
}

/// The output of one compilation unit (one mode)
#[derive(Debug)]
pub struct UnitOutput {
    pub mode: Mode,
    pub nodes: Vec<OutputNode>,
    pub entries: Vec<CallbackEntry>,
    pub layout: project::LayoutTable,
}

/// The result of one whole compiler run
pub struct Compilation {
    pub sources: SourceMap,
    pub diagnostics: Diagnostics,
    pub units: Vec<UnitOutput>,
    pub schema: Option<serde_json::Value>,
    pub stream_manifest: Option<layout::StreamManifest>,
}

impl Compilation {
    pub fn succeeded(&self) -> bool {
        !self.diagnostics.has_errors() && !self.units.is_empty()
    }
}

/// Compiles a set of sources for the given mode plans. Modes are independent
/// compilation units: a fatal error aborts its own unit while the others
/// continue, so one run can report several unrelated errors.
pub fn compile(
    sources: Vec<SourceFile>,
    plans: &[ModePlan],
    options: &CompileOptions,
    level: &[project::LevelEntity],
) -> Compilation {
    let mut source_map = SourceMap::new();
    let mut diagnostics = Diagnostics::new();
    let mut modules = Vec::new();
    let mut parse_failed = false;

    for source in sources {
        let id = source_map.add(source);

        match Parser::parse_module(source_map.file(id), id) {
            Ok(module) => modules.push(module),
            Err(diagnostic) => {
                diagnostics.push(diagnostic);
                parse_failed = true;
            }
        }
    }

    if parse_failed {
        return Compilation {
            sources: source_map,
            diagnostics,
            units: Vec::new(),
            schema: None,
            stream_manifest: None,
        };
    }

    let program = match Program::from_modules(modules) {
        Ok(program) => program,
        Err(diagnostic) => {
            diagnostics.push(diagnostic);

            return Compilation {
                sources: source_map,
                diagnostics,
                units: Vec::new(),
                schema: None,
                stream_manifest: None,
            };
        }
    };

    let instances = RecordInstances::new();
    let types = TypeCtx::new(&program, &instances);

    let program_layout = match layout::compute_layout(types) {
        Ok(layout) => layout,
        Err(diagnostic) => {
            diagnostics.push(diagnostic);

            return Compilation {
                sources: source_map,
                diagnostics,
                units: Vec::new(),
                schema: None,
                stream_manifest: None,
            };
        }
    };

    if !level.is_empty() {
        project::validate_level(types, &program_layout, level, &mut diagnostics);
    }

    // Modes are independent units sharing only read-only program tables and
    // the read-through instantiation cache
    let mut units = Vec::new();

    std::thread::scope(|scope| {
        let mut handles = Vec::new();

        for plan in plans {
            let program = &program;
            let instances = &instances;
            let program_layout = &program_layout;

            handles.push(scope.spawn(move || {
                compile_unit(program, instances, program_layout, plan, options)
            }));
        }

        for handle in handles {
            match handle.join() {
                Ok((unit, unit_diagnostics)) => {
                    diagnostics.extend(unit_diagnostics);
                    units.extend(unit);
                }
                Err(_) => diagnostics.push(Diagnostic::internal(
                    "a compilation unit panicked; this is a compiler defect",
                )),
            }
        }
    });

    // Callbacks no compiled mode ever invokes are probably a mistake
    for archetype in program.archetypes.iter() {
        for callback in archetype.callbacks.keys() {
            let compiled = plans.iter().any(|plan| {
                plan.mode.supports_callback(*callback)
                    && plan
                        .archetypes
                        .iter()
                        .any(|name| name.as_str() == archetype.name.symbol.value())
            });

            if !compiled {
                diagnostics.warn(
                    Some(archetype.name.span),
                    format!(
                        "callback `{}` of archetype `{}` is not part of any compiled mode",
                        callback.engine_name(),
                        archetype.name.symbol
                    ),
                );
            }
        }
    }

    let schema = Some(project::level_schema(types, &program_layout));
    let stream_manifest = Some(program_layout.stream_manifest(types));

    Compilation {
        sources: source_map,
        diagnostics,
        units,
        schema,
        stream_manifest,
    }
}

fn compile_unit(
    program: &Program,
    instances: &RecordInstances,
    program_layout: &ProgramLayout,
    plan: &ModePlan,
    options: &CompileOptions,
) -> (Option<UnitOutput>, Diagnostics) {
    let mut diagnostics = Diagnostics::new();

    let mut archetype_order: Vec<ArchetypeId> = Vec::new();

    for name in &plan.archetypes {
        match program.archetype_by_name(name) {
            Some(id) => archetype_order.push(id),
            None => {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::TypeResolution,
                    None,
                    format!(
                        "unknown archetype `{name}` in the {} mode archetype list",
                        plan.mode
                    ),
                ));
                return (None, diagnostics);
            }
        }
    }

    let unit = UnitCtx {
        types: TypeCtx::new(program, instances),
        layout: program_layout,
        mode: plan.mode,
        archetype_order: &archetype_order,
    };

    let mut specializer = Specializer::new(unit);
    let mut compiled = Vec::new();

    for (number, archetype_id) in archetype_order.iter().enumerate() {
        let archetype = program.archetype(*archetype_id);

        let mut callbacks: Vec<(Callback, middle::program::FunctionId)> = archetype
            .callbacks
            .iter()
            .map(|(callback, function)| (*callback, *function))
            .collect();
        callbacks.sort_by_key(|(callback, _)| callback.engine_name());

        for (callback, function) in callbacks {
            if !plan.mode.supports_callback(callback) {
                continue;
            }

            match specializer.specialize_callback(*archetype_id, callback, function) {
                Ok(body) => match defassign::check(&body) {
                    Ok(()) => compiled.push((number as u32, *archetype_id, callback, body)),
                    Err(diagnostic) => diagnostics.push(diagnostic),
                },
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }
    }

    // Inlined instances carry their own definition sites and returns; they
    // are checked with the same rules as callback bodies
    for instance in specializer.instances.iter() {
        if let Err(diagnostic) = defassign::check(&instance.body) {
            diagnostics.push(diagnostic);
        }
    }

    if diagnostics.has_errors() {
        return (None, diagnostics);
    }

    let mut nodes = NodeTable::new();
    let mut entries = Vec::new();

    {
        let mut codegen = Codegen::new(unit, &specializer.instances, &mut nodes, options);

        for (number, archetype_id, callback, body) in &compiled {
            match codegen.lower_callback(body) {
                Ok(root) => entries.push(CallbackEntry {
                    archetype: program
                        .archetype(*archetype_id)
                        .name
                        .symbol
                        .value()
                        .to_owned(),
                    archetype_id: *number,
                    callback: callback.engine_name(),
                    root,
                }),
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }
    }

    if diagnostics.has_errors() {
        return (None, diagnostics);
    }

    (
        Some(UnitOutput {
            mode: plan.mode,
            nodes: nodes.nodes().to_vec(),
            entries,
            layout: project::layout_table(
                TypeCtx::new(program, instances),
                program_layout,
                plan.mode,
            ),
        }),
        diagnostics,
    )
}
