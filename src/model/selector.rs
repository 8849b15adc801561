//! Settings → model candidates and parameter rules.

use crate::{
    error::{Result, StemError},
    model::{ModelLoader, SeparationModel},
    session::Session,
    types::{ModelVariant, PassParams, StemSettings},
};

/// How a variant adjusts the quality-derived pass parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamRule {
    None,
    /// Raise shifts and overlap to at least these values.
    Floor { shifts: u32, overlap: f32 },
    /// Ignore quality and use these values.
    Fixed(PassParams),
}

impl ParamRule {
    pub fn apply(self, base: PassParams) -> PassParams {
        match self {
            ParamRule::None => base,
            ParamRule::Floor { shifts, overlap } => base.with_floor(shifts, overlap),
            ParamRule::Fixed(params) => params,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelPlan {
    pub variant: ModelVariant,
    /// Model ids in the order they are tried.
    pub candidates: &'static [&'static str],
    pub rule: ParamRule,
    /// Second model combined with the primary one in ensemble mode.
    pub ensemble: Option<&'static str>,
}

pub const ENSEMBLE_FLOOR: (u32, f32) = (1, 0.25);

impl ModelPlan {
    pub fn params(&self, base: PassParams) -> PassParams {
        self.rule.apply(base)
    }

    pub fn is_ensemble(&self) -> bool {
        self.ensemble.is_some()
    }
}

pub fn select(settings: &StemSettings) -> ModelPlan {
    plan_for(settings.model)
}

pub fn plan_for(variant: ModelVariant) -> ModelPlan {
    let (candidates, rule, ensemble): (&'static [&'static str], ParamRule, Option<&'static str>) =
        match variant {
            ModelVariant::Balanced => (&["htdemucs", "htdemucs_ft"], ParamRule::None, None),
            ModelVariant::FineTuned => (&["htdemucs_ft", "htdemucs"], ParamRule::None, None),
            ModelVariant::Drums => (
                &["htdemucs_ft", "htdemucs"],
                ParamRule::Floor {
                    shifts: 1,
                    overlap: 0.2,
                },
                None,
            ),
            ModelVariant::SixStem => (&["htdemucs_6s"], ParamRule::None, None),
            ModelVariant::Fast => (&["htdemucs"], ParamRule::Fixed(PassParams::CHUNK), None),
            ModelVariant::Ensemble => (
                &["htdemucs_ft", "htdemucs"],
                ParamRule::Floor {
                    shifts: ENSEMBLE_FLOOR.0,
                    overlap: ENSEMBLE_FLOOR.1,
                },
                Some("htdemucs_ft"),
            ),
        };
    ModelPlan {
        variant,
        candidates,
        rule,
        ensemble,
    }
}

/// Loads the first candidate that the loader can serve on the session device.
pub fn load_first(
    plan: &ModelPlan,
    loader: &dyn ModelLoader,
    session: &Session,
) -> Result<Box<dyn SeparationModel>> {
    for id in plan.candidates {
        session.info(format!("[*] Loading model: {id}"));
        match loader.load(id, session.device()) {
            Ok(model) => {
                session.info(format!(
                    "[+] Model {id} loaded ({} stems)",
                    model.descriptor().layout.len()
                ));
                return Ok(model);
            }
            Err(e) => session.warn(format!("[!] Failed to load {id}: {e:#}")),
        }
    }
    Err(StemError::ModelUnavailable {
        tried: plan.candidates.join(", "),
    })
}
