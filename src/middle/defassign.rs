//! Definite-assignment / single-live-definition analysis. For every
//! non-scalar local, the set of definitions reaching each read is computed
//! over the body's control-flow graph with a forward may-analysis; a read is
//! valid iff exactly one definition reaches it. Scalars are exempt, and
//! `copy_from` updates are uses rather than definitions, which is what makes
//! them the sanctioned way to mutate a binding across branches and loops.
//!
//! Return statements follow the analogous rule with `return` as a
//! pseudo-definition of the call result: any number of scalar or bare
//! returns, but a non-scalar-returning body must have exactly one
//! syntactically-unconditional return as its sole exit. Branch elimination
//! has already removed statically-dead return sites before this runs.

use hashbrown::{HashMap, HashSet};

use crate::{
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    index::Index,
    middle::{
        cfg::{Action, BlockId, Cfg},
        hir::{Body, LocalId, Stmt},
    },
};

pub fn check(body: &Body) -> CompileResult<()> {
    check_return_shape(body)?;
    check_single_definitions(body)
}

fn check_single_definitions(body: &Body) -> CompileResult<()> {
    let cfg = Cfg::build(body);
    let reachable = cfg.reachable();

    // Forward may-analysis: OUT[b] = gen(b) ∪ (IN[b] − kill(b)), with IN the
    // union over predecessors. Sets only grow, so the worklist terminates.
    let mut outs: Vec<HashMap<LocalId, HashSet<usize>>> = vec![HashMap::new(); cfg.blocks.len()];
    let mut predecessors: Vec<Vec<BlockId>> = vec![Vec::new(); cfg.blocks.len()];

    for (id, block) in cfg.blocks.enumerate() {
        for successor in &block.successors {
            predecessors[successor.index()].push(id);
        }
    }

    let mut worklist: Vec<BlockId> = cfg.blocks.indices().collect();

    while let Some(block_id) = worklist.pop() {
        let mut state: HashMap<LocalId, HashSet<usize>> = HashMap::new();

        for predecessor in &predecessors[block_id.index()] {
            for (local, defs) in &outs[predecessor.index()] {
                state.entry(*local).or_default().extend(defs.iter().copied());
            }
        }

        for action in &cfg.blocks[block_id].actions {
            if let Action::Define { local, site } = action {
                state.insert(*local, HashSet::from([*site]));
            }
        }

        if state != outs[block_id.index()] {
            outs[block_id.index()] = state;

            for successor in &cfg.blocks[block_id].successors {
                if !worklist.contains(successor) {
                    worklist.push(*successor);
                }
            }
        }
    }

    // Validate every reachable read against its reaching set
    for (block_id, block) in cfg.blocks.enumerate() {
        if !reachable[block_id.index()] {
            continue;
        }

        let mut state: HashMap<LocalId, HashSet<usize>> = HashMap::new();

        for predecessor in &predecessors[block_id.index()] {
            for (local, defs) in &outs[predecessor.index()] {
                state.entry(*local).or_default().extend(defs.iter().copied());
            }
        }

        for action in &block.actions {
            match action {
                Action::Define { local, site } => {
                    state.insert(*local, HashSet::from([*site]));
                }
                Action::Use { local, span } => {
                    let reaching = state.get(local).map(HashSet::len).unwrap_or(0);

                    if reaching == 1 {
                        continue;
                    }

                    let name = body.locals[*local].name;

                    if reaching == 0 {
                        return Err(Diagnostic::spanned(
                            DiagnosticKind::AmbiguousDefinition,
                            *span,
                            format!("`{name}` is read before any definition reaches it"),
                        ));
                    }

                    let mut diagnostic = Diagnostic::spanned(
                        DiagnosticKind::AmbiguousDefinition,
                        *span,
                        format!(
                            "`{name}` has {reaching} reaching definitions at this read; a non-scalar \
                             variable must have exactly one (update it with `copy_from` instead of rebinding)"
                        ),
                    );

                    let mut sites: Vec<usize> =
                        state.get(local).into_iter().flatten().copied().collect();
                    sites.sort_unstable();

                    for site in sites {
                        let def = &cfg.def_sites[site];
                        let label = if def.is_parameter {
                            "defined as a parameter here"
                        } else {
                            "defined here"
                        };
                        diagnostic = diagnostic.with_related(label, def.span);
                    }

                    return Err(diagnostic);
                }
            }
        }
    }

    Ok(())
}

/// Locations and shapes of every return in a body
struct ReturnSites {
    aggregate: Vec<(bool, crate::frontend::Span)>,
    total: usize,
}

fn check_return_shape(body: &Body) -> CompileResult<()> {
    let mut sites = ReturnSites {
        aggregate: Vec::new(),
        total: 0,
    };

    collect_returns(&body.statements, true, &mut sites);

    if sites.aggregate.is_empty() {
        // All-scalar or all-bare mixes were already rejected during return
        // type unification; any combination of counts is fine here
        return Ok(());
    }

    let (unconditional, span) = sites.aggregate[0];

    if sites.total > 1 {
        let mut diagnostic = Diagnostic::spanned(
            DiagnosticKind::AmbiguousDefinition,
            span,
            format!(
                "a function returning {} must have exactly one return, found {}",
                describe(body),
                sites.total
            ),
        );

        for (_, other) in &sites.aggregate[1..] {
            diagnostic = diagnostic.with_related("another return here", *other);
        }

        return Err(diagnostic);
    }

    if !unconditional {
        return Err(Diagnostic::spanned(
            DiagnosticKind::AmbiguousDefinition,
            span,
            format!(
                "the return of a function returning {} must be syntactically unconditional; \
                 conditional return sites must be eliminated at compile time",
                describe(body)
            ),
        ));
    }

    Ok(())
}

fn describe(body: &Body) -> String {
    format!("a non-scalar value ({})", render_plain(&body.return_type))
}

fn render_plain(ty: &crate::middle::ty::Type) -> String {
    use crate::middle::ty::TypeKind;

    match &**ty {
        TypeKind::Scalar => "Scalar".into(),
        TypeKind::None => "none".into(),
        TypeKind::Array { length, .. } => format!("an array of {length}"),
        TypeKind::Record { .. } => "a record".into(),
        TypeKind::Tuple(_) => "a tuple".into(),
        TypeKind::FunctionRef(_) => "a function reference".into(),
        TypeKind::EntityRef(_) => "an entity reference".into(),
        TypeKind::Param(name) => name.value().into(),
    }
}

fn collect_returns(statements: &[Stmt], unconditional: bool, sites: &mut ReturnSites) {
    for statement in statements {
        match statement {
            Stmt::Return { value, span } => {
                sites.total += 1;

                match value {
                    None => {}
                    Some(expr) if expr.ty.is_scalar() => {}
                    Some(_) => sites.aggregate.push((unconditional, *span)),
                }
            }
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_returns(then_branch, false, sites);
                collect_returns(else_branch, false, sites);
            }
            Stmt::While {
                body,
                advance,
                else_branch,
                ..
            } => {
                collect_returns(body, false, sites);
                collect_returns(advance, false, sites);
                collect_returns(else_branch, false, sites);
            }
            _ => {}
        }
    }
}
