//! Execution modes of the target runtime and their lifecycle callbacks. Each
//! compiled mode is an independent compilation unit producing its own
//! instruction graph and memory layout.

use strum::{Display, EnumIter, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    Play,
    Watch,
    Preview,
    Tutorial,
}

impl Mode {
    pub fn callbacks(self) -> &'static [Callback] {
        match self {
            Mode::Play => &[
                Callback::Preprocess,
                Callback::SpawnOrder,
                Callback::ShouldSpawn,
                Callback::Initialize,
                Callback::UpdateSequential,
                Callback::Touch,
                Callback::UpdateParallel,
                Callback::Terminate,
            ],
            Mode::Watch => &[
                Callback::Preprocess,
                Callback::SpawnTime,
                Callback::DespawnTime,
                Callback::Initialize,
                Callback::UpdateSequential,
                Callback::UpdateParallel,
                Callback::Terminate,
                Callback::UpdateSpawn,
            ],
            Mode::Preview => &[Callback::Preprocess, Callback::Render],
            Mode::Tutorial => &[Callback::Preprocess, Callback::Navigate, Callback::Update],
        }
    }

    pub fn supports_callback(self, callback: Callback) -> bool {
        self.callbacks().contains(&callback)
    }

    /// Streams are recorded while playing and replayed elsewhere
    pub fn records_streams(self) -> bool {
        matches!(self, Mode::Play)
    }

    pub fn replays_streams(self) -> bool {
        matches!(self, Mode::Watch)
    }
}

/// A lifecycle callback of an archetype. The runtime invokes each phase once
/// per frame per active entity, in a fixed order; there is no other entry
/// point into compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Callback {
    Preprocess,
    SpawnOrder,
    ShouldSpawn,
    Initialize,
    UpdateSequential,
    Touch,
    UpdateParallel,
    Terminate,
    SpawnTime,
    DespawnTime,
    UpdateSpawn,
    Render,
    Navigate,
    Update,
}

impl Callback {
    /// The name the runtime knows this callback by
    pub fn engine_name(self) -> &'static str {
        match self {
            Callback::Preprocess => "preprocess",
            Callback::SpawnOrder => "spawnOrder",
            Callback::ShouldSpawn => "shouldSpawn",
            Callback::Initialize => "initialize",
            Callback::UpdateSequential => "updateSequential",
            Callback::Touch => "touch",
            Callback::UpdateParallel => "updateParallel",
            Callback::Terminate => "terminate",
            Callback::SpawnTime => "spawnTime",
            Callback::DespawnTime => "despawnTime",
            Callback::UpdateSpawn => "updateSpawn",
            Callback::Render => "render",
            Callback::Navigate => "navigate",
            Callback::Update => "update",
        }
    }

    /// Parallel callbacks run conceptually simultaneously across all active
    /// entities and may not touch shared or level state. Everything else runs
    /// one entity at a time in a defined order.
    pub fn is_parallel(self) -> bool {
        matches!(
            self,
            Callback::Initialize | Callback::UpdateParallel | Callback::Terminate
        )
    }

    pub fn is_sequential(self) -> bool {
        !self.is_parallel()
    }

    /// Preprocess is the only phase that may populate data-class storage
    pub fn is_preprocess(self) -> bool {
        matches!(self, Callback::Preprocess)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn callback_names_round_trip_from_source_spelling() {
        assert_eq!(
            Callback::from_str("update_sequential").unwrap(),
            Callback::UpdateSequential
        );
        assert_eq!(
            Callback::UpdateSequential.engine_name(),
            "updateSequential"
        );
        assert!(Callback::from_str("updateSequential").is_err());
    }

    #[test]
    fn parallel_phases_are_exactly_the_simultaneous_ones() {
        let parallel: Vec<_> = Mode::Play
            .callbacks()
            .iter()
            .copied()
            .filter(|c| c.is_parallel())
            .collect();

        assert_eq!(
            parallel,
            vec![
                Callback::Initialize,
                Callback::UpdateParallel,
                Callback::Terminate
            ]
        );
    }

    #[test]
    fn preview_has_no_entity_lifecycle() {
        assert!(!Mode::Preview.supports_callback(Callback::Initialize));
        assert!(Mode::Preview.supports_callback(Callback::Render));
    }
}
