use galaxy_runtime::callback::{downcast_mut, FunctionEntry, ModuleFunction, PhaseCall};
use galaxy_runtime::config::ConfigStore;
use galaxy_runtime::module::{
    Capabilities, Module, ModuleDescriptor, ModuleState, ModuleType, Phase, PhaseSet,
};
use galaxy_runtime::version::Version;
use galaxy_runtime::{Result, RuntimeError};
use std::any::Any;

/// Constant Cooling Module - moves a fixed fraction of hot gas to the cold
/// phase every step
struct ConstantCooling;

struct State {
    fraction: f64,
}

impl Module for ConstantCooling {
    fn initialize(&self, config: &dyn ConfigStore) -> Result<ModuleState> {
        let fraction = config.get_double("cooling.fraction", 0.1);
        if !(0.0..=1.0).contains(&fraction) {
            return Err(RuntimeError::InvalidArguments(format!(
                "cooling.fraction must be within [0, 1], got {fraction}"
            )));
        }
        Ok(Box::new(State { fraction }))
    }

    fn configure(&self, state: &mut dyn Any, key: &str, value: &str) -> Result<()> {
        let state = downcast_mut::<State>(state, "state")?;
        match key {
            "fraction" => {
                state.fraction = value
                    .parse()
                    .map_err(|_| RuntimeError::InvalidArguments(format!("bad fraction '{value}'")))?;
                Ok(())
            }
            _ => Err(RuntimeError::InvalidArguments(format!("unknown key '{key}'"))),
        }
    }

    fn execute_phase(&self, call: &mut PhaseCall<'_>) -> Result<()> {
        if call.phase != Phase::Galaxy {
            return Ok(());
        }
        let fraction = downcast_mut::<State>(call.state, "state")?.fraction;
        if let Some(galaxy) = call.context.current_galaxy_mut() {
            let cooled = galaxy.property("HotGas") * fraction;
            galaxy.add_to_property("HotGas", -cooled);
            galaxy.add_to_property("ColdGas", cooled);
        }
        Ok(())
    }
}

/// Module entry point
#[no_mangle]
pub fn galaxy_module_descriptor() -> *mut ModuleDescriptor {
    let descriptor = ModuleDescriptor::new("constant_cooling", ModuleType::Cooling, ConstantCooling)
        .with_version(Version::new(1, 0, 0))
        .with_description("Cools a fixed fraction of hot gas per step")
        .with_capabilities(Capabilities::CONFIGURABLE)
        .with_phases(PhaseSet::GALAXY)
        .with_function(FunctionEntry::new(
            "cooling_fraction",
            ModuleFunction::double(|inv| {
                inv.state
                    .downcast_ref::<State>()
                    .map_or(0.0, |state| state.fraction)
            }),
        ));
    Box::into_raw(Box::new(descriptor))
}
