//! Project descriptor input and the external-facing artifacts: the
//! level-data schema, level content validation against that schema, and the
//! per-mode memory layout table.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    backend::{
        layout::{ProgramLayout, block_for_storage},
        mode::Mode,
    },
    diagnostics::{Diagnostic, DiagnosticKind, Diagnostics},
    frontend::ast::StorageClass,
    middle::ty::TypeCtx,
};

/// The on-disk project descriptor consumed by the CLI
#[derive(Debug, Deserialize)]
pub struct ProjectDescriptor {
    pub title: String,
    /// Source files, relative to the descriptor
    pub sources: Vec<PathBuf>,
    /// Mode name → archetypes compiled for that mode, in runtime id order
    pub modes: std::collections::BTreeMap<String, Vec<String>>,
    /// Optional level content to validate against the schema
    #[serde(default)]
    pub level: Vec<LevelEntity>,
}

/// One entity instantiation in level content: an archetype plus values for
/// its imported fields
#[derive(Debug, Deserialize)]
pub struct LevelEntity {
    pub archetype: String,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

impl ProjectDescriptor {
    pub fn parse(text: &str) -> Result<ProjectDescriptor, Diagnostic> {
        serde_json::from_str(text).map_err(|error| {
            Diagnostic::new(
                DiagnosticKind::Syntax,
                None,
                format!("invalid project descriptor: {error}"),
            )
        })
    }

    pub fn mode_plans(&self) -> Result<Vec<crate::ModePlan>, Diagnostic> {
        let mut plans = Vec::new();

        for (name, archetypes) in &self.modes {
            let Ok(mode) = name.parse::<Mode>() else {
                return Err(Diagnostic::new(
                    DiagnosticKind::Syntax,
                    None,
                    format!(
                        "unknown mode `{name}` in project descriptor; expected play, watch, preview, or tutorial"
                    ),
                ));
            };

            plans.push(crate::ModePlan {
                mode,
                archetypes: archetypes.clone(),
            });
        }

        Ok(plans)
    }
}

/// The schema artifact: the shape level-data entity declarations must have,
/// for external validation tooling
pub fn level_schema(ctx: TypeCtx<'_>, layout: &ProgramLayout) -> Value {
    let archetypes: Vec<Value> = ctx
        .program
        .archetypes
        .enumerate()
        .map(|(id, archetype)| {
            let imported: Vec<Value> = layout.archetypes[id]
                .imported_fields()
                .map(|slot| {
                    json!({
                        "name": slot.name.value(),
                        "type": ctx.render(&slot.ty),
                        "offset": slot.offset,
                    })
                })
                .collect();

            json!({
                "name": archetype.name.symbol.value(),
                "imported": imported,
            })
        })
        .collect();

    json!({ "archetypes": archetypes })
}

/// Validates level content against the compiled program's schema. Errors are
/// collected rather than short-circuiting so a level file's problems are all
/// reported at once.
pub fn validate_level(
    ctx: TypeCtx<'_>,
    layout: &ProgramLayout,
    level: &[LevelEntity],
    diagnostics: &mut Diagnostics,
) {
    for (index, entity) in level.iter().enumerate() {
        let Some(archetype_id) = ctx.program.archetype_by_name(&entity.archetype) else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::TypeResolution,
                None,
                format!(
                    "level entity #{index} names unknown archetype `{}`",
                    entity.archetype
                ),
            ));
            continue;
        };

        let archetype_layout = &layout.archetypes[archetype_id];

        for slot in archetype_layout.imported_fields() {
            match entity.data.get(slot.name.value()) {
                Some(value) if slot.ty.is_scalar() => {
                    if !value.is_number() {
                        diagnostics.push(Diagnostic::new(
                            DiagnosticKind::TypeResolution,
                            None,
                            format!(
                                "level entity #{index} field `{}` must be a number",
                                slot.name
                            ),
                        ));
                    }
                }
                Some(value) => {
                    // Aggregate imported fields are supplied as flat arrays
                    let expected = ctx
                        .size_of(&slot.ty, crate::frontend::Span::new(
                            crate::frontend::SourceId(0), 0, 0,
                        ))
                        .unwrap_or(0);

                    match value.as_array() {
                        Some(cells) if cells.len() as u32 == expected => {}
                        _ => diagnostics.push(Diagnostic::new(
                            DiagnosticKind::TypeResolution,
                            None,
                            format!(
                                "level entity #{index} field `{}` must be a flat array of {expected} number(s)",
                                slot.name
                            ),
                        )),
                    }
                }
                None => diagnostics.push(Diagnostic::new(
                    DiagnosticKind::TypeResolution,
                    None,
                    format!(
                        "level entity #{index} is missing imported field `{}` of archetype `{}`",
                        slot.name, entity.archetype
                    ),
                )),
            }
        }

        for name in entity.data.keys() {
            let known = archetype_layout
                .imported_fields()
                .any(|slot| slot.name.value() == name);

            if !known {
                diagnostics.warn(
                    None,
                    format!(
                        "level entity #{index} supplies `{name}`, which is not an imported field of `{}`",
                        entity.archetype
                    ),
                );
            }
        }
    }
}

/// The memory layout table for one compiled mode, addressable by
/// (archetype, storage class, offset) with that mode's numeric block ids
#[derive(Debug, Serialize)]
pub struct LayoutTable {
    pub mode: String,
    pub archetypes: Vec<ArchetypeLayoutEntry>,
    pub level_memory: Vec<GlobalFieldEntry>,
    pub level_data: Vec<GlobalFieldEntry>,
    pub streams: Vec<StreamEntry>,
}

#[derive(Debug, Serialize)]
pub struct ArchetypeLayoutEntry {
    pub name: String,
    pub fields: Vec<FieldEntry>,
}

#[derive(Debug, Serialize)]
pub struct FieldEntry {
    pub name: String,
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<u32>,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Serialize)]
pub struct GlobalFieldEntry {
    pub name: String,
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Serialize)]
pub struct StreamEntry {
    pub name: String,
    pub start: u32,
    pub size: u32,
    pub capacity: u32,
}

pub fn layout_table(ctx: TypeCtx<'_>, layout: &ProgramLayout, mode: Mode) -> LayoutTable {
    let span = crate::frontend::Span::new(crate::frontend::SourceId(0), 0, 0);

    let archetypes = ctx
        .program
        .archetypes
        .enumerate()
        .map(|(id, archetype)| ArchetypeLayoutEntry {
            name: archetype.name.symbol.value().to_owned(),
            fields: layout.archetypes[id]
                .fields
                .iter()
                .map(|slot| FieldEntry {
                    name: slot.name.value().to_owned(),
                    storage: slot.storage.to_string(),
                    block: block_for_storage(slot.storage).and_then(|b| b.id_in(mode)),
                    offset: slot.offset,
                    size: if slot.storage == StorageClass::Exported {
                        1
                    } else {
                        ctx.size_of(&slot.ty, span).unwrap_or(0)
                    },
                })
                .collect(),
        })
        .collect();

    let globals = |fields: &[crate::backend::layout::GlobalFieldSlot], block: u32| {
        fields
            .iter()
            .map(|slot| GlobalFieldEntry {
                name: slot.name.value().to_owned(),
                block,
                offset: slot.offset,
                size: ctx.size_of(&slot.ty, span).unwrap_or(0),
            })
            .collect::<Vec<_>>()
    };

    LayoutTable {
        mode: mode.to_string(),
        archetypes,
        level_memory: globals(
            &layout.level_memory.fields,
            crate::backend::blocks::Block::LevelMemory
                .id_in(mode)
                .unwrap_or(2000),
        ),
        level_data: globals(
            &layout.level_data.fields,
            crate::backend::blocks::Block::LevelData
                .id_in(mode)
                .unwrap_or(2001),
        ),
        streams: layout
            .streams
            .iter()
            .map(|slot| StreamEntry {
                name: slot.name.value().to_owned(),
                start: slot.start,
                size: slot.size,
                capacity: slot.capacity,
            })
            .collect(),
    }
}
