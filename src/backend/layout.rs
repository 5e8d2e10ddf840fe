//! Memory layout assignment. Every archetype field, level global, and stream
//! gets a flat cell offset within its storage class, in declaration order, so
//! offsets are stable under append-only edits. Stream layouts additionally
//! round-trip through a manifest so a recompilation can be checked against
//! the layout that persisted recordings were produced with.

use serde::{Deserialize, Serialize};

use crate::{
    backend::blocks::{Block, ENTITY_ARRAY_STRIDE},
    diagnostics::{CompileResult, Diagnostic, DiagnosticKind},
    frontend::{ast::StorageClass, intern::InternedSymbol},
    index::IndexVec,
    middle::{
        consteval,
        program::ArchetypeId,
        ty::{Type, TypeCtx},
    },
};

#[derive(Debug)]
pub struct ProgramLayout {
    pub archetypes: IndexVec<ArchetypeId, ArchetypeLayout>,
    pub level_memory: GlobalLayout,
    pub level_data: GlobalLayout,
    pub streams: Vec<StreamSlot>,
}

#[derive(Debug)]
pub struct ArchetypeLayout {
    /// Parallel to the archetype's field declarations
    pub fields: Vec<FieldSlot>,
    pub entity_data_size: u32,
    pub entity_memory_size: u32,
    pub shared_memory_size: u32,
    /// Names of exported fields; the slot index is the export key
    pub exported_keys: Vec<InternedSymbol>,
}

#[derive(Debug, Clone)]
pub struct FieldSlot {
    pub name: InternedSymbol,
    pub storage: StorageClass,
    pub ty: Type,
    /// Cell offset within the storage class block, or the export key index
    /// for exported fields
    pub offset: u32,
}

impl ArchetypeLayout {
    pub fn field(&self, name: InternedSymbol) -> Option<&FieldSlot> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Imported fields in declaration order; this is the shape level data
    /// must supply
    pub fn imported_fields(&self) -> impl Iterator<Item = &FieldSlot> {
        self.fields
            .iter()
            .filter(|f| f.storage == StorageClass::Imported)
    }
}

#[derive(Debug, Default)]
pub struct GlobalLayout {
    pub fields: Vec<GlobalFieldSlot>,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct GlobalFieldSlot {
    pub name: InternedSymbol,
    pub ty: Type,
    pub offset: u32,
}

impl GlobalLayout {
    pub fn field(&self, name: InternedSymbol) -> Option<&GlobalFieldSlot> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSlot {
    pub name: InternedSymbol,
    pub element: Type,
    /// First backing stream id; an aggregate element occupies one backing
    /// stream per cell
    pub start: u32,
    pub size: u32,
    pub capacity: u32,
}

/// The storage class an archetype field's block, shared with codegen
pub fn block_for_storage(storage: StorageClass) -> Option<Block> {
    match storage {
        StorageClass::Imported | StorageClass::EntityData => Some(Block::EntityData),
        StorageClass::EntityMemory => Some(Block::EntityMemory),
        StorageClass::SharedMemory => Some(Block::EntitySharedMemory),
        StorageClass::Exported => None,
    }
}

pub fn compute_layout(ctx: TypeCtx<'_>) -> CompileResult<ProgramLayout> {
    let mut archetypes = IndexVec::new();

    for (archetype_id, archetype) in ctx.program.archetypes.enumerate() {
        let mut fields = Vec::with_capacity(archetype.fields.len());
        let mut entity_data_size = 0u32;
        let mut entity_memory_size = 0u32;
        let mut shared_memory_size = 0u32;
        let mut exported_keys = Vec::new();

        // Imported fields first so their offsets follow level-data order,
        // then everything else in declaration order per class
        let ordered = archetype
            .fields
            .iter()
            .filter(|f| f.storage == StorageClass::Imported)
            .chain(
                archetype
                    .fields
                    .iter()
                    .filter(|f| f.storage != StorageClass::Imported),
            );

        for field in ordered {
            let ty = ctx.resolve_type(&field.ty)?;

            if field.storage == StorageClass::Exported {
                if !ty.is_scalar() {
                    return Err(Diagnostic::spanned(
                        DiagnosticKind::TypeResolution,
                        field.span,
                        format!(
                            "exported field `{}` must be a Scalar; exports are keyed single values",
                            field.name.symbol
                        ),
                    ));
                }

                fields.push(FieldSlot {
                    name: field.name.symbol,
                    storage: field.storage,
                    ty,
                    offset: exported_keys.len() as u32,
                });
                exported_keys.push(field.name.symbol);
                continue;
            }

            let size = ctx.size_of(&ty, field.span)?;

            let slot = match field.storage {
                StorageClass::Imported | StorageClass::EntityData => &mut entity_data_size,
                StorageClass::EntityMemory => &mut entity_memory_size,
                StorageClass::SharedMemory => &mut shared_memory_size,
                StorageClass::Exported => unreachable!("handled above"),
            };

            fields.push(FieldSlot {
                name: field.name.symbol,
                storage: field.storage,
                ty,
                offset: *slot,
            });

            *slot += size;
        }

        for (class, size) in [
            ("data", entity_data_size),
            ("memory", entity_memory_size),
            ("shared", shared_memory_size),
        ] {
            if size > ENTITY_ARRAY_STRIDE {
                return Err(Diagnostic::spanned(
                    DiagnosticKind::TypeResolution,
                    archetype.name.span,
                    format!(
                        "archetype `{}` uses {size} cells of {class} storage; the runtime provides {ENTITY_ARRAY_STRIDE} per entity",
                        archetype.name.symbol
                    ),
                ));
            }
        }

        let computed = ArchetypeLayout {
            fields,
            entity_data_size,
            entity_memory_size,
            shared_memory_size,
            exported_keys,
        };

        debug_assert_eq!(archetypes.next_index(), archetype_id);
        archetypes.push(computed);
    }

    let level_memory = layout_global(ctx, ctx.program.level_memory.as_ref())?;
    let level_data = layout_global(ctx, ctx.program.level_data.as_ref())?;
    let streams = layout_streams(ctx)?;

    Ok(ProgramLayout {
        archetypes,
        level_memory,
        level_data,
        streams,
    })
}

fn layout_global(
    ctx: TypeCtx<'_>,
    item: Option<&crate::middle::program::LevelGlobalItem>,
) -> CompileResult<GlobalLayout> {
    let Some(item) = item else {
        return Ok(GlobalLayout::default());
    };

    let mut fields = Vec::with_capacity(item.fields.len());
    let mut size = 0u32;

    for field in &item.fields {
        let ty = ctx.resolve_type(&field.ty)?;
        let field_size = ctx.size_of(&ty, field.span)?;

        fields.push(GlobalFieldSlot {
            name: field.name.symbol,
            ty,
            offset: size,
        });

        size += field_size;
    }

    Ok(GlobalLayout { fields, size })
}

fn layout_streams(ctx: TypeCtx<'_>) -> CompileResult<Vec<StreamSlot>> {
    let Some(streams) = &ctx.program.streams else {
        return Ok(Vec::new());
    };

    let mut slots = Vec::with_capacity(streams.entries.len());
    // Backing id 0 is reserved so an uninitialized stream handle is
    // distinguishable
    let mut next_id = 1u32;

    for entry in &streams.entries {
        let element = ctx.resolve_type(&entry.element)?;
        let size = ctx.size_of(&element, entry.span)?;

        let Some(capacity) = consteval::eval_literal_expression(&entry.capacity) else {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                entry.span,
                "stream capacity must be a compile-time integer constant",
            ));
        };

        if capacity.fract() != 0.0 || capacity <= 0.0 {
            return Err(Diagnostic::spanned(
                DiagnosticKind::TypeResolution,
                entry.span,
                format!("stream capacity must be a positive integer, found {capacity}"),
            ));
        }

        slots.push(StreamSlot {
            name: entry.name.symbol,
            element,
            start: next_id,
            size,
            capacity: capacity as u32,
        });

        next_id += size;
    }

    Ok(slots)
}

/* Stream manifest */

/// The serialized shape of the stream layout a build was published with.
/// Recordings persist across engine updates, so a newer compile must keep
/// every existing stream exactly where it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamManifest {
    pub streams: Vec<StreamManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamManifestEntry {
    pub name: String,
    pub element: String,
    pub start: u32,
    pub size: u32,
    pub capacity: u32,
}

impl ProgramLayout {
    pub fn stream_manifest(&self, ctx: TypeCtx<'_>) -> StreamManifest {
        StreamManifest {
            streams: self
                .streams
                .iter()
                .map(|slot| StreamManifestEntry {
                    name: slot.name.value().to_owned(),
                    element: ctx.render(&slot.element),
                    start: slot.start,
                    size: slot.size,
                    capacity: slot.capacity,
                })
                .collect(),
        }
    }
}

/// Append-only law: the new manifest must begin with every published entry,
/// bit for bit; only additions at the end are compatible.
pub fn check_stream_compatibility(
    published: &StreamManifest,
    current: &StreamManifest,
) -> CompileResult<()> {
    if current.streams.len() < published.streams.len() {
        return Err(Diagnostic::new(
            DiagnosticKind::LayoutCompatibility,
            None,
            format!(
                "stream declaration removed {} published stream(s); existing recordings would become undecodable",
                published.streams.len() - current.streams.len()
            ),
        ));
    }

    for (index, (old, new)) in published
        .streams
        .iter()
        .zip(current.streams.iter())
        .enumerate()
    {
        if old != new {
            return Err(Diagnostic::new(
                DiagnosticKind::LayoutCompatibility,
                None,
                format!(
                    "published stream #{index} changed from `{}: stream[{}, {}]` to `{}: stream[{}, {}]`; \
                     streams may only be appended after existing declarations",
                    old.name, old.element, old.capacity, new.name, new.element, new.capacity
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frontend::{SourceFile, SourceId, parser::Parser},
        index::Index,
        middle::{program::Program, ty::RecordInstances},
    };

    fn layout_of(source: &str) -> (Program, ProgramLayout) {
        let file = SourceFile::new_in_memory(source);
        let module = Parser::parse_module(&file, SourceId::new(0)).unwrap();
        let program = Program::from_modules(vec![module]).unwrap();
        let instances = RecordInstances::new();
        let layout = compute_layout(TypeCtx::new(&program, &instances)).unwrap();
        (program, layout)
    }

    fn manifest_of(source: &str) -> StreamManifest {
        let file = SourceFile::new_in_memory(source);
        let module = Parser::parse_module(&file, SourceId::new(0)).unwrap();
        let program = Program::from_modules(vec![module]).unwrap();
        let instances = RecordInstances::new();
        let ctx = TypeCtx::new(&program, &instances);
        compute_layout(ctx).unwrap().stream_manifest(ctx)
    }

    #[test]
    fn fields_pack_in_declaration_order_per_class() {
        let (program, layout) = layout_of(
            "archetype Note {\n\
                 imported lane: Scalar;\n\
                 imported time: Scalar;\n\
                 data speed: Scalar;\n\
                 memory y: Scalar;\n\
                 memory ease: [Scalar; 3];\n\
                 shared slot: Scalar;\n\
             }",
        );

        let note = program.archetype_by_name("Note").unwrap();
        let note_layout = &layout.archetypes[note];

        // imported and data share the entity data block, imported first
        assert_eq!(note_layout.field(InternedSymbol::new("lane")).unwrap().offset, 0);
        assert_eq!(note_layout.field(InternedSymbol::new("time")).unwrap().offset, 1);
        assert_eq!(note_layout.field(InternedSymbol::new("speed")).unwrap().offset, 2);
        assert_eq!(note_layout.entity_data_size, 3);

        assert_eq!(note_layout.field(InternedSymbol::new("y")).unwrap().offset, 0);
        assert_eq!(note_layout.field(InternedSymbol::new("ease")).unwrap().offset, 1);
        assert_eq!(note_layout.entity_memory_size, 4);

        assert_eq!(note_layout.shared_memory_size, 1);
    }

    #[test]
    fn appending_a_field_preserves_existing_offsets() {
        let base = "archetype Note { memory a: Scalar; memory b: [Scalar; 2]; }";
        let appended = "archetype Note { memory a: Scalar; memory b: [Scalar; 2]; memory c: Scalar; }";

        let (program_1, layout_1) = layout_of(base);
        let (program_2, layout_2) = layout_of(appended);

        let note_1 = &layout_1.archetypes[program_1.archetype_by_name("Note").unwrap()];
        let note_2 = &layout_2.archetypes[program_2.archetype_by_name("Note").unwrap()];

        for field in &note_1.fields {
            assert_eq!(note_2.field(field.name).unwrap().offset, field.offset);
        }
        assert_eq!(note_2.field(InternedSymbol::new("c")).unwrap().offset, 3);
    }

    #[test]
    fn storage_budget_is_enforced() {
        let file = SourceFile::new_in_memory(
            "archetype Big { memory xs: [Scalar; 33]; }",
        );
        let module = Parser::parse_module(&file, SourceId::new(0)).unwrap();
        let program = Program::from_modules(vec![module]).unwrap();
        let instances = RecordInstances::new();

        let error = compute_layout(TypeCtx::new(&program, &instances)).unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::TypeResolution);
    }

    #[test]
    fn stream_ids_start_at_one_and_cover_aggregate_cells() {
        let manifest = manifest_of(
            "record Vec2 { x: Scalar; y: Scalar; }\n\
             streams Recording { taps: stream[Scalar, 256]; cursor: stream[Vec2, 64]; }",
        );

        assert_eq!(manifest.streams[0].start, 1);
        assert_eq!(manifest.streams[0].size, 1);
        assert_eq!(manifest.streams[1].start, 2);
        assert_eq!(manifest.streams[1].size, 2);
    }

    #[test]
    fn appending_a_stream_is_compatible_reordering_is_not() {
        let published = manifest_of("streams R { taps: stream[Scalar, 256]; }");
        let appended = manifest_of(
            "streams R { taps: stream[Scalar, 256]; holds: stream[Scalar, 128]; }",
        );
        let reordered = manifest_of(
            "streams R { holds: stream[Scalar, 128]; taps: stream[Scalar, 256]; }",
        );
        let resized = manifest_of("streams R { taps: stream[Scalar, 512]; }");

        assert!(check_stream_compatibility(&published, &appended).is_ok());

        let error = check_stream_compatibility(&published, &reordered).unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::LayoutCompatibility);

        let error = check_stream_compatibility(&published, &resized).unwrap_err();
        assert_eq!(error.kind, DiagnosticKind::LayoutCompatibility);

        // appended offsets left the published stream untouched
        assert_eq!(appended.streams[0], published.streams[0]);
    }

    #[test]
    fn exported_fields_get_key_indexes() {
        let (program, layout) = layout_of(
            "archetype Note { exported judgment: Scalar; exported accuracy: Scalar; }",
        );

        let note = &layout.archetypes[program.archetype_by_name("Note").unwrap()];
        assert_eq!(note.field(InternedSymbol::new("judgment")).unwrap().offset, 0);
        assert_eq!(note.field(InternedSymbol::new("accuracy")).unwrap().offset, 1);
        assert_eq!(note.exported_keys.len(), 2);
    }
}
