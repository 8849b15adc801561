mod common;

use common::*;
use stem_weaver::{
    model::selector::{load_first, plan_for, select, ParamRule, ENSEMBLE_FLOOR},
    types::{Device, PassParams},
    ModelVariant, PipelineConfig, Session, StemError, StemSettings,
};

fn session() -> Session {
    Session::new(Device::Cpu, PipelineConfig::default())
}

#[test]
fn every_variant_has_candidates() {
    for v in ModelVariant::ALL {
        assert!(!plan_for(v).candidates.is_empty(), "{v:?}");
    }
    assert_eq!(plan_for(ModelVariant::SixStem).candidates, &["htdemucs_6s"]);
}

#[test]
fn ensemble_floors_shifts_and_overlap() {
    let settings = StemSettings {
        model: ModelVariant::Ensemble,
        quality: 1,
        ..StemSettings::default()
    };
    let plan = select(&settings);
    assert_eq!(plan.ensemble, Some("htdemucs_ft"));
    assert_eq!(
        plan.rule,
        ParamRule::Floor {
            shifts: ENSEMBLE_FLOOR.0,
            overlap: ENSEMBLE_FLOOR.1
        }
    );
    let p = plan.params(settings.pass_params());
    assert_eq!(p.shifts, 1);
    assert!((p.overlap - 0.25).abs() < 1e-6);
}

#[test]
fn balanced_keeps_quality_parameters() {
    let plan = plan_for(ModelVariant::Balanced);
    for q in 1..=5 {
        let base = PassParams::for_quality(q);
        assert_eq!(plan.params(base), base);
    }
}

#[test]
fn first_loadable_candidate_wins() {
    let loader = MockLoader::new(&[("htdemucs", FOUR_GAINS), ("htdemucs_ft", FOUR_GAINS)]);
    let model = load_first(&plan_for(ModelVariant::FineTuned), &loader, &session()).unwrap();
    assert_eq!(model.descriptor().id, "htdemucs_ft");
    assert_eq!(loader.requested.borrow().len(), 1);
}

#[test]
fn six_stem_without_its_model_is_unavailable() {
    let loader = MockLoader::new(&[("htdemucs", FOUR_GAINS)]);
    let err = load_first(&plan_for(ModelVariant::SixStem), &loader, &session())
        .err()
        .unwrap();
    match err {
        StemError::ModelUnavailable { tried } => assert_eq!(tried, "htdemucs_6s"),
        other => panic!("unexpected error {other}"),
    }
}
