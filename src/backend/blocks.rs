//! Runtime memory blocks. Every storable value in a compiled program lives in
//! one of these flat blocks; the instruction graph addresses cells as
//! (block, index, offset). Which blocks exist, their numeric ids, and which
//! callbacks may read or write them varies per execution mode, mirroring the
//! runtime's own access tables.

use super::mode::{Callback, Mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Block {
    RuntimeEnvironment,
    RuntimeUpdate,
    RuntimeTouchArray,
    RuntimeSkinTransform,
    RuntimeParticleTransform,
    RuntimeBackground,
    RuntimeUi,
    RuntimeUiConfiguration,
    RuntimeCanvas,
    LevelMemory,
    LevelData,
    LevelOption,
    LevelBucket,
    LevelScore,
    LevelLife,
    EngineRom,
    EntityMemory,
    EntityData,
    EntitySharedMemory,
    EntityInfo,
    EntityDespawn,
    EntityInput,
    EntityDataArray,
    EntitySharedMemoryArray,
    EntityInfoArray,
    ArchetypeLife,
    TemporaryMemory,
    StreamData,
}

/// When a block may be written (reads are unrestricted for every block that
/// exists in a mode; invisibility is modeled by a block not existing, e.g.
/// there is no cross-entity view of [`Block::EntityMemory`])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    Never,
    PreprocessOnly,
    /// Sequential callbacks only; this is what keeps parallel callbacks from
    /// racing on shared state
    Sequential,
    Any,
}

impl Block {
    pub fn write_policy(self) -> WritePolicy {
        match self {
            Block::RuntimeEnvironment
            | Block::RuntimeUi
            | Block::RuntimeUiConfiguration
            | Block::RuntimeCanvas
            | Block::LevelData
            | Block::LevelBucket
            | Block::LevelScore
            | Block::LevelLife
            | Block::EntityData
            | Block::EntityDataArray
            | Block::ArchetypeLife => WritePolicy::PreprocessOnly,
            Block::RuntimeSkinTransform
            | Block::RuntimeParticleTransform
            | Block::RuntimeBackground
            | Block::LevelMemory
            | Block::EntitySharedMemory
            | Block::EntitySharedMemoryArray => WritePolicy::Sequential,
            Block::RuntimeUpdate
            | Block::RuntimeTouchArray
            | Block::LevelOption
            | Block::EngineRom
            | Block::EntityInfo
            | Block::EntityInfoArray => WritePolicy::Never,
            Block::EntityMemory
            | Block::EntityDespawn
            | Block::EntityInput
            | Block::TemporaryMemory => WritePolicy::Any,
            // Stream access is mode-gated separately (record vs replay)
            Block::StreamData => WritePolicy::Sequential,
        }
    }

    /// Whether a callback may write this block in the given mode
    pub fn writable_in(self, mode: Mode, callback: Callback) -> bool {
        if self.id_in(mode).is_none() {
            return false;
        }

        match self.write_policy() {
            WritePolicy::Never => false,
            WritePolicy::PreprocessOnly => callback.is_preprocess(),
            WritePolicy::Sequential => callback.is_sequential(),
            WritePolicy::Any => true,
        }
    }

    /// The numeric id of this block in the given mode, or None if the block
    /// does not exist there
    pub fn id_in(self, mode: Mode) -> Option<u32> {
        let table: &[(Block, u32)] = match mode {
            Mode::Play => &[
                (Block::RuntimeEnvironment, 1000),
                (Block::RuntimeUpdate, 1001),
                (Block::RuntimeTouchArray, 1002),
                (Block::RuntimeSkinTransform, 1003),
                (Block::RuntimeParticleTransform, 1004),
                (Block::RuntimeBackground, 1005),
                (Block::RuntimeUi, 1006),
                (Block::RuntimeUiConfiguration, 1007),
                (Block::LevelMemory, 2000),
                (Block::LevelData, 2001),
                (Block::LevelOption, 2002),
                (Block::LevelBucket, 2003),
                (Block::LevelScore, 2004),
                (Block::LevelLife, 2005),
                (Block::EngineRom, 3000),
                (Block::EntityMemory, 4000),
                (Block::EntityData, 4001),
                (Block::EntitySharedMemory, 4002),
                (Block::EntityInfo, 4003),
                (Block::EntityDespawn, 4004),
                (Block::EntityInput, 4005),
                (Block::EntityDataArray, 4101),
                (Block::EntitySharedMemoryArray, 4102),
                (Block::EntityInfoArray, 4103),
                (Block::ArchetypeLife, 5000),
                (Block::TemporaryMemory, 10000),
                (Block::StreamData, 11000),
            ],
            Mode::Watch => &[
                (Block::RuntimeEnvironment, 1000),
                (Block::RuntimeUpdate, 1001),
                (Block::RuntimeSkinTransform, 1002),
                (Block::RuntimeParticleTransform, 1003),
                (Block::RuntimeBackground, 1004),
                (Block::RuntimeUi, 1005),
                (Block::RuntimeUiConfiguration, 1006),
                (Block::LevelMemory, 2000),
                (Block::LevelData, 2001),
                (Block::LevelOption, 2002),
                (Block::LevelBucket, 2003),
                (Block::LevelScore, 2004),
                (Block::LevelLife, 2005),
                (Block::EngineRom, 3000),
                (Block::EntityMemory, 4000),
                (Block::EntityData, 4001),
                (Block::EntitySharedMemory, 4002),
                (Block::EntityInfo, 4003),
                (Block::EntityInput, 4004),
                (Block::EntityDataArray, 4101),
                (Block::EntitySharedMemoryArray, 4102),
                (Block::EntityInfoArray, 4103),
                (Block::ArchetypeLife, 5000),
                (Block::TemporaryMemory, 10000),
                (Block::StreamData, 11000),
            ],
            Mode::Preview => &[
                (Block::RuntimeEnvironment, 1000),
                (Block::RuntimeCanvas, 1001),
                (Block::RuntimeSkinTransform, 1002),
                (Block::RuntimeUi, 1003),
                (Block::RuntimeUiConfiguration, 1004),
                (Block::LevelData, 2000),
                (Block::LevelOption, 2001),
                (Block::EngineRom, 3000),
                (Block::EntityData, 4000),
                (Block::EntitySharedMemory, 4001),
                (Block::EntityInfo, 4002),
                (Block::EntityDataArray, 4100),
                (Block::EntitySharedMemoryArray, 4101),
                (Block::EntityInfoArray, 4102),
                (Block::TemporaryMemory, 10000),
            ],
            Mode::Tutorial => &[
                (Block::RuntimeEnvironment, 1000),
                (Block::RuntimeUpdate, 1001),
                (Block::RuntimeSkinTransform, 1002),
                (Block::RuntimeParticleTransform, 1003),
                (Block::RuntimeBackground, 1004),
                (Block::RuntimeUi, 1005),
                (Block::RuntimeUiConfiguration, 1006),
                (Block::LevelMemory, 2000),
                (Block::LevelData, 2001),
                (Block::EngineRom, 3000),
                (Block::TemporaryMemory, 10000),
            ],
        };

        table.iter().find(|(b, _)| *b == self).map(|(_, id)| *id)
    }
}

/// Cells reserved per entity in the cross-entity array views. The runtime
/// lays those blocks out as fixed-stride rows, so every entity-scoped storage
/// class must fit within this many cells.
pub const ENTITY_ARRAY_STRIDE: u32 = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_callbacks_cannot_write_shared_state() {
        assert!(!Block::EntitySharedMemory.writable_in(Mode::Play, Callback::UpdateParallel));
        assert!(!Block::LevelMemory.writable_in(Mode::Play, Callback::Initialize));
        assert!(!Block::LevelMemory.writable_in(Mode::Play, Callback::Terminate));

        assert!(Block::EntitySharedMemory.writable_in(Mode::Play, Callback::UpdateSequential));
        assert!(Block::LevelMemory.writable_in(Mode::Play, Callback::Touch));
    }

    #[test]
    fn data_classes_are_preprocess_only() {
        assert!(Block::EntityData.writable_in(Mode::Play, Callback::Preprocess));
        assert!(!Block::EntityData.writable_in(Mode::Play, Callback::UpdateSequential));
        assert!(!Block::LevelData.writable_in(Mode::Watch, Callback::UpdateSequential));
    }

    #[test]
    fn entity_memory_is_unrestricted_for_the_owner() {
        assert!(Block::EntityMemory.writable_in(Mode::Play, Callback::UpdateParallel));
        assert!(Block::EntityMemory.writable_in(Mode::Watch, Callback::Initialize));
    }

    #[test]
    fn modes_expose_different_block_sets() {
        assert_eq!(Block::EntityMemory.id_in(Mode::Play), Some(4000));
        assert_eq!(Block::EntityData.id_in(Mode::Play), Some(4001));
        assert_eq!(Block::EntityData.id_in(Mode::Preview), Some(4000));
        assert_eq!(Block::EntityMemory.id_in(Mode::Preview), None);
        assert_eq!(Block::EntityMemory.id_in(Mode::Tutorial), None);
        assert_eq!(Block::RuntimeTouchArray.id_in(Mode::Watch), None);
    }
}
