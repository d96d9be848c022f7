use crate::config::{ConfigStore, ValueStore};
use crate::module::Phase;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Galaxy type of a central galaxy
pub const CENTRAL: i32 = 0;
/// Galaxy type of a satellite that still has its own subhalo
pub const SATELLITE: i32 = 1;
/// Galaxy type of an orphan satellite
pub const ORPHAN: i32 = 2;

/// One evolving entity
///
/// Physical quantities are kept in a name-keyed property map; the runtime
/// itself only looks at the bookkeeping fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Galaxy {
    pub galaxy_nr: i64,
    pub halo_nr: i64,
    pub galaxy_type: i32,
    /// Non-zero once the galaxy has merged or been disrupted
    pub merge_type: i32,
    /// Index of the galaxy this one merged into
    pub merge_into: Option<usize>,
    /// Remaining time until the satellite merges
    pub merge_time: f64,
    pub properties: BTreeMap<String, f64>,
}

impl Galaxy {
    #[must_use]
    pub fn new(galaxy_nr: i64, halo_nr: i64, galaxy_type: i32) -> Self {
        Self {
            galaxy_nr,
            halo_nr,
            galaxy_type,
            ..Self::default()
        }
    }

    /// Property value, zero when never set
    #[must_use]
    pub fn property(&self, name: &str) -> f64 {
        self.properties.get(name).copied().unwrap_or(0.0)
    }

    pub fn set_property(&mut self, name: &str, value: f64) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn add_to_property(&mut self, name: &str, delta: f64) {
        *self.properties.entry(name.to_string()).or_insert(0.0) += delta;
    }

    #[must_use]
    pub fn is_merged(&self) -> bool {
        self.merge_type > 0
    }
}

/// Mutable state threaded through one pipeline run
///
/// Created per unit of work (one halo group) and dropped once its FINAL
/// phase has run. The merger event queue belongs to the [`Runtime`]
/// driving the run and is reached through it.
///
/// [`Runtime`]: crate::runtime::Runtime
pub struct PipelineContext {
    /// Simulation parameters
    pub params: Rc<dyn ConfigStore>,
    pub galaxies: Vec<Galaxy>,
    /// Index of the central galaxy of the group
    pub central_galaxy: usize,
    pub halo_nr: i64,
    pub phase: Phase,
    pub time: f64,
    pub dt: f64,
    /// Integration sub-step index
    pub step: usize,
    /// Galaxy being processed during the GALAXY phase
    pub current_galaxy: Option<usize>,
    /// Host bookkeeping
    pub user_data: Option<Box<dyn Any>>,
}

impl PipelineContext {
    pub fn new(params: Rc<dyn ConfigStore>, galaxies: Vec<Galaxy>, central_galaxy: usize) -> Self {
        Self {
            params,
            galaxies,
            central_galaxy,
            halo_nr: 0,
            phase: Phase::Halo,
            time: 0.0,
            dt: 0.0,
            step: 0,
            current_galaxy: None,
            user_data: None,
        }
    }

    /// Context with no parameters
    #[must_use]
    pub fn with_galaxies(galaxies: Vec<Galaxy>) -> Self {
        Self::new(Rc::new(ValueStore::empty()), galaxies, 0)
    }

    #[must_use]
    pub fn galaxy_count(&self) -> usize {
        self.galaxies.len()
    }

    #[must_use]
    pub fn current_galaxy(&self) -> Option<&Galaxy> {
        self.current_galaxy.and_then(|idx| self.galaxies.get(idx))
    }

    pub fn current_galaxy_mut(&mut self) -> Option<&mut Galaxy> {
        self.current_galaxy.and_then(|idx| self.galaxies.get_mut(idx))
    }

    #[must_use]
    pub fn user_data<T: Any>(&self) -> Option<&T> {
        self.user_data.as_ref().and_then(|data| data.downcast_ref::<T>())
    }

    pub fn user_data_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut().and_then(|data| data.downcast_mut::<T>())
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("galaxies", &self.galaxies.len())
            .field("central_galaxy", &self.central_galaxy)
            .field("halo_nr", &self.halo_nr)
            .field("phase", &self.phase)
            .field("time", &self.time)
            .field("dt", &self.dt)
            .field("step", &self.step)
            .field("current_galaxy", &self.current_galaxy)
            .finish_non_exhaustive()
    }
}
