//! Named lifecycle hooks fired around probe operations.

use crate::error::ProbeError;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Lifecycle stages a hook can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Right before the image is written to the target.
    BeforeLoad,
}

impl Stage {
    pub const ALL: [Stage; 1] = [Stage::BeforeLoad];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeLoad => "before_load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| ProbeError::UnknownStage(s.to_string()))
    }
}

/// A registered hook. Arguments are captured by the closure.
pub type Callback = Box<dyn FnMut() + Send>;

/// At most one hook per stage; registering again replaces the old one.
#[derive(Default)]
pub struct CallbackRegistry {
    hooks: HashMap<Stage, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, stage: Stage, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.hooks.insert(stage, Box::new(hook)).is_some() {
            debug!(stage = %stage, "Replaced callback");
        }
    }

    pub fn remove(&mut self, stage: Stage) -> bool {
        self.hooks.remove(&stage).is_some()
    }

    pub fn is_registered(&self, stage: Stage) -> bool {
        self.hooks.contains_key(&stage)
    }

    /// Invoke the hook for `stage`. Returns whether one was registered.
    pub fn fire(&mut self, stage: Stage) -> bool {
        match self.hooks.get_mut(&stage) {
            Some(hook) => {
                debug!(stage = %stage, "Firing callback");
                hook();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.hooks.keys()).finish()
    }
}
