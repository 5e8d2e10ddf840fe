//! End-to-end source-to-graph tests: each compiles a small Pulse program and
//! inspects the diagnostics or the emitted node table.

use indoc::indoc;
use pulsec::{
    AssertMode, CompileOptions, Compilation, ModePlan,
    backend::{layout, mode::Mode},
    diagnostics::DiagnosticKind,
    frontend::SourceFile,
};

fn compile_play(source: &str, archetypes: &[&str]) -> Compilation {
    pulsec::compile(
        vec![SourceFile::new_in_memory(source)],
        &[ModePlan {
            mode: Mode::Play,
            archetypes: archetypes.iter().map(|s| s.to_string()).collect(),
        }],
        &CompileOptions::default(),
        &[],
    )
}

fn first_error_kind(compilation: &Compilation) -> Option<DiagnosticKind> {
    compilation
        .diagnostics
        .iter()
        .find(|d| d.kind.is_fatal())
        .map(|d| d.kind)
}

fn emitted_ops(compilation: &Compilation) -> Vec<&'static str> {
    compilation
        .units
        .iter()
        .flat_map(|unit| unit.nodes.iter())
        .filter_map(|node| match node {
            pulsec::backend::node::OutputNode::Function { func, .. } => Some(*func),
            pulsec::backend::node::OutputNode::Value { .. } => None,
        })
        .collect()
}

fn emitted_values(compilation: &Compilation) -> Vec<f64> {
    compilation
        .units
        .iter()
        .flat_map(|unit| unit.nodes.iter())
        .filter_map(|node| match node {
            pulsec::backend::node::OutputNode::Value { value } => Some(*value),
            pulsec::backend::node::OutputNode::Function { .. } => None,
        })
        .collect()
}

#[test]
fn compiles_a_minimal_archetype() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                imported lane: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    self.y = self.lane * 0.5;
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let unit = &compilation.units[0];
    assert_eq!(unit.entries.len(), 1);
    assert_eq!(unit.entries[0].callback, "initialize");
    assert_eq!(unit.entries[0].archetype_id, 0);
    assert!(!unit.nodes.is_empty());
}

#[test]
fn sibling_branch_definitions_are_ambiguous() {
    let compilation = compile_play(
        indoc! {"
            record Pair { first: Scalar; second: Scalar; }

            archetype Note {
                imported which: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    let p = Pair(1, 2);
                    if self.which > 0 {
                        p = Pair(3, 4);
                    } else {
                        p = Pair(5, 6);
                    }
                    self.y = p.first;
                }
            }
        "},
        &["Note"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::AmbiguousDefinition)
    );
}

#[test]
fn copy_from_in_a_loop_is_a_single_definition() {
    let compilation = compile_play(
        indoc! {"
            record Pair { first: Scalar; second: Scalar; }

            archetype Note {
                imported count: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    let p = Pair(0, 0);
                    let i = 0;
                    while i < self.count {
                        if i > 2 {
                            p.copy_from(Pair(i, i + 1));
                        }
                        i = i + 1;
                    }
                    self.y = p.first;
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn constant_true_condition_keeps_only_the_taken_arm() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    if true {
                        self.y = 1;
                    } else if false {
                        debug_log(2);
                    } else {
                        debug_log(3);
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    // The untaken arms contribute zero nodes: no DebugLog, no If
    let ops = emitted_ops(&compilation);
    assert!(!ops.contains(&"DebugLog"), "{ops:?}");
    assert!(!ops.contains(&"If"), "{ops:?}");
}

#[test]
fn eliminated_branches_may_contain_invalid_accesses() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    if false {
                        self.y = self.does_not_exist + nonsense(1);
                    } else {
                        self.y = 1;
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn constant_folding_matches_runtime_arithmetic() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    self.y = 2 + 3 * 4 - 10 / 4;
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let values = emitted_values(&compilation);
    assert!(values.contains(&11.5), "{values:?}");

    // No arithmetic survives to runtime
    let ops = emitted_ops(&compilation);
    assert!(!ops.contains(&"Add"), "{ops:?}");
    assert!(!ops.contains(&"Multiply"), "{ops:?}");
}

#[test]
fn tuple_iteration_unrolls_at_compile_time() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    for weight in (0.25, 0.5, 0.75) {
                        self.y = self.y + weight;
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    // Unrolled: three writes and no loop construct
    let ops = emitted_ops(&compilation);
    assert!(!ops.contains(&"While"), "{ops:?}");
    assert_eq!(ops.iter().filter(|op| **op == "Set").count(), 3, "{ops:?}");
}

#[test]
fn non_scalar_functions_inline_per_call_site() {
    let compilation = compile_play(
        indoc! {"
            record Pair { first: Scalar; second: Scalar; }

            fn make_pair(a, b) {
                return Pair(a, b);
            }

            archetype Note {
                imported lane: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    let p = make_pair(self.lane, 2);
                    self.y = p.first + p.second;
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn conditional_non_scalar_returns_are_rejected() {
    let compilation = compile_play(
        indoc! {"
            record Pair { first: Scalar; second: Scalar; }

            fn pick(a) {
                if a > 0 {
                    return Pair(1, 2);
                }
                return Pair(3, 4);
            }

            archetype Note {
                imported lane: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    let p = pick(self.lane);
                    self.y = p.first;
                }
            }
        "},
        &["Note"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::AmbiguousDefinition)
    );
}

#[test]
fn scalar_functions_may_return_from_branches() {
    let compilation = compile_play(
        indoc! {"
            fn judge(delta) {
                if delta < 0.05 {
                    return 2;
                }
                if delta < 0.1 {
                    return 1;
                }
                return 0;
            }

            archetype Note {
                imported time: Scalar;
                exported judgment: Scalar;

                fn touch(self) {
                    self.judgment = judge(self.time);
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let ops = emitted_ops(&compilation);
    assert!(ops.contains(&"ExportValue"), "{ops:?}");
    assert!(ops.contains(&"Break"), "{ops:?}");
}

#[test]
fn recursion_is_rejected() {
    let compilation = compile_play(
        indoc! {"
            fn spiral(n) {
                return spiral(n - 1);
            }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    self.y = spiral(3);
                }
            }
        "},
        &["Note"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::TypeResolution)
    );
}

#[test]
fn parallel_callbacks_cannot_write_shared_storage() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                shared slot: Scalar;

                fn update_parallel(self) {
                    self.slot = 1;
                }
            }
        "},
        &["Note"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::InvalidAccess)
    );

    // The same write is fine from a sequential callback
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                shared slot: Scalar;

                fn update_sequential(self) {
                    self.slot = 1;
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn match_prunes_statically_false_arms() {
    let compilation = compile_play(
        indoc! {"
            record Pair { first: Scalar; second: Scalar; }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    let p = Pair(1, 2);
                    match p {
                        0 => { debug_log(0); }
                        Pair(a, b) => { self.y = a + b; }
                        _ => { debug_log(1); }
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    // The literal arm can never match a record; the record arm always
    // matches, so nothing else survives
    let ops = emitted_ops(&compilation);
    assert!(!ops.contains(&"DebugLog"), "{ops:?}");
}

#[test]
fn loops_lower_to_while_nodes_with_breaks() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                imported count: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    for i in range(self.count) {
                        if i > 10 {
                            break;
                        }
                        self.y = self.y + i;
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let ops = emitted_ops(&compilation);
    assert!(ops.contains(&"While"), "{ops:?}");
    assert!(ops.contains(&"Break"), "{ops:?}");
}

#[test]
fn unsupported_constructs_are_rejected_with_their_own_kind() {
    for source in [
        "fn f() { try { pass; } except { pass; } }",
        "fn f() { global x; }",
        "fn f(a) { (x, *rest) = a; }",
        "fn f() { import math; }",
    ] {
        let compilation = compile_play(source, &[]);

        assert_eq!(
            first_error_kind(&compilation),
            Some(DiagnosticKind::UnsupportedConstruct),
            "{source}"
        );
    }
}

#[test]
fn generic_records_specialize_per_argument_tuple() {
    let compilation = compile_play(
        indoc! {"
            record Pair[T] { first: T; second: T; }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    let a = Pair(1, 2);
                    let b = Pair(3, 4);
                    let c = Pair(array(1, 2, 3), array(4, 5, 6));
                    let d = Pair(array(7, 8, 9), array(1, 1, 1));
                    self.y = a.first + b.second + c.first[0] + d.second[2];
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn cannot_infer_type_arguments_from_mismatched_fields() {
    let compilation = compile_play(
        indoc! {"
            record Pair[T] { first: T; second: T; }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    let p = Pair(1, array(1, 2));
                    self.y = p.first;
                }
            }
        "},
        &["Note"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::TypeResolution)
    );
}

#[test]
fn streams_record_in_play_and_replay_in_watch() {
    let source = indoc! {"
        streams Recording { taps: stream[Scalar, 256]; }

        archetype Note {
            imported time: Scalar;
            memory y: Scalar;

            fn touch(self) {
                Recording.taps.set(self.time, 1);
            }

            fn update_sequential(self) {
                self.y = Recording.taps.get(self.time);
            }
        }
    "};

    // Writing is a play-mode operation; reading back is watch-only, so the
    // sequential update fails in play mode
    let compilation = compile_play(source, &["Note"]);
    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::InvalidAccess)
    );

    // Watch mode accepts the read and rejects the write; a watch-only
    // archetype with just the read compiles
    let watch_only = indoc! {"
        streams Recording { taps: stream[Scalar, 256]; }

        archetype Note {
            imported time: Scalar;
            memory y: Scalar;

            fn update_sequential(self) {
                self.y = Recording.taps.get(self.time);
            }
        }
    "};

    let compilation = pulsec::compile(
        vec![SourceFile::new_in_memory(watch_only)],
        &[ModePlan {
            mode: Mode::Watch,
            archetypes: vec!["Note".to_owned()],
        }],
        &CompileOptions::default(),
        &[],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let ops = emitted_ops(&compilation);
    assert!(ops.contains(&"StreamGetValue"), "{ops:?}");
}

#[test]
fn stream_manifest_appends_compatibly() {
    let published = compile_play(
        "streams R { taps: stream[Scalar, 256]; }",
        &[],
    )
    .stream_manifest
    .unwrap();

    let appended = compile_play(
        "streams R { taps: stream[Scalar, 256]; holds: stream[Scalar, 64]; }",
        &[],
    )
    .stream_manifest
    .unwrap();

    let reordered = compile_play(
        "streams R { holds: stream[Scalar, 64]; taps: stream[Scalar, 256]; }",
        &[],
    )
    .stream_manifest
    .unwrap();

    assert!(layout::check_stream_compatibility(&published, &appended).is_ok());
    assert_eq!(
        layout::check_stream_compatibility(&published, &reordered)
            .unwrap_err()
            .kind,
        DiagnosticKind::LayoutCompatibility
    );
}

#[test]
fn asserts_lower_per_configuration() {
    let source = indoc! {"
        archetype Note {
            imported lane: Scalar;
            memory y: Scalar;

            fn initialize(self) {
                assert self.lane >= 0;
                self.y = self.lane;
            }
        }
    "};

    let halt = pulsec::compile(
        vec![SourceFile::new_in_memory(source)],
        &[ModePlan {
            mode: Mode::Play,
            archetypes: vec!["Note".to_owned()],
        }],
        &CompileOptions {
            asserts: AssertMode::Halt,
        },
        &[],
    );
    assert!(emitted_ops(&halt).contains(&"Halt"));

    let off = pulsec::compile(
        vec![SourceFile::new_in_memory(source)],
        &[ModePlan {
            mode: Mode::Play,
            archetypes: vec!["Note".to_owned()],
        }],
        &CompileOptions {
            asserts: AssertMode::Off,
        },
        &[],
    );
    assert!(!emitted_ops(&off).contains(&"Halt"));
    assert!(off.succeeded());
}

#[test]
fn cross_entity_reads_use_the_array_views() {
    let compilation = compile_play(
        indoc! {"
            archetype Head {
                imported lane: Scalar;
                shared slot: Scalar;
            }

            archetype Tail {
                imported head_ref: Scalar;
                memory y: Scalar;

                fn update_sequential(self) {
                    let head = Head.at(self.head_ref);
                    self.y = head.lane + head.slot;
                }
            }
        "},
        &["Head", "Tail"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    // 4101/4102 are the play-mode data and shared array views
    let values = emitted_values(&compilation);
    assert!(values.contains(&4101.0), "{values:?}");
    assert!(values.contains(&4102.0), "{values:?}");
}

#[test]
fn entity_memory_is_private_across_entities() {
    let compilation = compile_play(
        indoc! {"
            archetype Head {
                memory secret: Scalar;
            }

            archetype Tail {
                imported head_ref: Scalar;
                memory y: Scalar;

                fn update_sequential(self) {
                    self.y = Head.at(self.head_ref).secret;
                }
            }
        "},
        &["Head", "Tail"],
    );

    assert_eq!(
        first_error_kind(&compilation),
        Some(DiagnosticKind::InvalidAccess)
    );
}

#[test]
fn spawned_archetypes_use_runtime_ids_in_project_order() {
    let compilation = compile_play(
        indoc! {"
            archetype Marker {
                memory t: Scalar;
            }

            archetype Spawner {
                imported time: Scalar;

                fn update_sequential(self) {
                    spawn(Marker, self.time);
                }
            }
        "},
        &["Marker", "Spawner"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
    assert!(emitted_ops(&compilation).contains(&"Spawn"));
}

#[test]
fn function_instances_are_shared_per_argument_tuple() {
    use pulsec::{
        backend::{layout, mode::Callback},
        frontend::{SourceId, parser::Parser},
        index::Index,
        middle::{
            program::Program,
            specialize::{Specializer, UnitCtx},
            ty::{RecordInstances, TypeCtx},
        },
    };

    let source = SourceFile::new_in_memory(indoc! {"
        record Pair { first: Scalar; second: Scalar; }

        fn offset(x) { return x + 1; }
        fn wrap(a, b) { return Pair(a, b); }

        archetype Note {
            memory y: Scalar;

            fn initialize(self) {
                let p = wrap(offset(1), offset(2));
                let q = wrap(offset(offset(3)), 4);
                self.y = p.first + q.second;
            }
        }
    "});

    let module = Parser::parse_module(&source, SourceId::new(0)).unwrap();
    let program = Program::from_modules(vec![module]).unwrap();
    let instances = RecordInstances::new();
    let types = TypeCtx::new(&program, &instances);
    let program_layout = layout::compute_layout(types).unwrap();

    let note = program.archetype_by_name("Note").unwrap();
    let archetype_order = vec![note];

    let unit = UnitCtx {
        types,
        layout: &program_layout,
        mode: Mode::Play,
        archetype_order: &archetype_order,
    };

    let mut specializer = Specializer::new(unit);
    let function = program.archetype(note).callbacks[&Callback::Initialize];

    specializer
        .specialize_callback(note, Callback::Initialize, function)
        .unwrap();

    // Four `offset` calls and two `wrap` calls, all with Scalar arguments:
    // one specialization each
    assert_eq!(specializer.instances.len(), 2);
}

#[test]
fn level_content_is_validated_against_the_schema() {
    let source = indoc! {"
        archetype Note {
            imported lane: Scalar;
            imported time: Scalar;
        }
    "};

    let level = serde_json::from_str::<Vec<pulsec::project::LevelEntity>>(
        r#"[
            {"archetype": "Note", "data": {"lane": 1, "time": 2.5}},
            {"archetype": "Note", "data": {"lane": 0}},
            {"archetype": "Ghost", "data": {}}
        ]"#,
    )
    .unwrap();

    let compilation = pulsec::compile(
        vec![SourceFile::new_in_memory(source)],
        &[ModePlan {
            mode: Mode::Play,
            archetypes: vec!["Note".to_owned()],
        }],
        &CompileOptions::default(),
        &level,
    );

    // Missing `time` on the second entity and the unknown archetype are both
    // reported
    assert!(compilation.diagnostics.error_count() >= 2);
}

#[test]
fn while_else_runs_only_without_break() {
    let compilation = compile_play(
        indoc! {"
            archetype Note {
                imported count: Scalar;
                memory y: Scalar;

                fn initialize(self) {
                    let i = 0;
                    while i < self.count {
                        if i > 100 {
                            break;
                        }
                        i = i + 1;
                    } else {
                        self.y = 1;
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    // The else guard reads a broke flag
    let ops = emitted_ops(&compilation);
    assert!(ops.contains(&"Not"), "{ops:?}");
}

#[test]
fn transient_record_fields_need_no_layout() {
    let compilation = compile_play(
        indoc! {"
            record Box[T] { inner: T; }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    let b = Box((1, 2, 3));
                    for element in b.inner {
                        self.y = self.y + element;
                    }
                }
            }
        "},
        &["Note"],
    );

    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}

#[test]
fn transient_records_cannot_be_stored() {
    let compilation = compile_play(
        indoc! {"
            record Box[T] { inner: T; }

            archetype Note {
                memory y: Scalar;

                fn initialize(self) {
                    let b = Box((1, 2));
                    let c = Box(b.inner);
                    self.y = len(c.inner);
                }
            }
        "},
        &["Note"],
    );

    // Purely transient use is fine
    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);

    let compilation = compile_play(
        indoc! {"
            record Box[T] { inner: T; }
            record Holder { b: Box[Scalar]; }

            archetype Note {
                memory slot: [Scalar; 2];

                fn initialize(self) {
                    pass;
                }
            }

            fn bad(x) {
                return 0;
            }
        "},
        &["Note"],
    );

    // A concrete instantiation in a layout position still works
    assert!(compilation.succeeded(), "{:?}", compilation.diagnostics);
}
