use xp_config::XpConfig;
use xp_core::{ExperimentStore, NewExperiment, TraceKind};

pub struct CreateRequest {
    pub preset: Option<String>,
    pub seeds: Vec<String>,
    pub group: Vec<u64>,
    pub delta: Vec<u64>,
    pub name: Option<String>,
}

/// Definitions to create, in order: one single per seed, or one aggregate
/// built from its first sub-trace's configuration.
async fn definitions(
    store: &dyn ExperimentStore,
    config: &XpConfig,
    request: CreateRequest,
) -> Result<Vec<NewExperiment>, Box<dyn std::error::Error>> {
    let aggregate = if !request.group.is_empty() {
        Some((TraceKind::Group, request.group))
    } else if !request.delta.is_empty() {
        Some((TraceKind::Delta, request.delta))
    } else {
        None
    };

    if let Some((kind, subtraces)) = aggregate {
        if request.preset.is_some() || !request.seeds.is_empty() {
            return Err("--preset/--seed cannot be combined with --group or --delta".into());
        }
        let first = store
            .get(subtraces[0])
            .await?
            .ok_or_else(|| format!("Experiment {} not found", subtraces[0]))?;
        let mut new = first.definition().aggregate_of(kind, subtraces);
        new.name = request.name;
        return Ok(vec![new]);
    }

    let preset_name = request
        .preset
        .ok_or("Nothing to create. Use --preset with --seed, or --group/--delta")?;
    let preset = config
        .presets
        .get(&preset_name)
        .ok_or_else(|| format!("Unknown preset: {}", preset_name))?;
    if request.seeds.is_empty() {
        return Err("At least one --seed is required with --preset".into());
    }
    if request.name.is_some() && request.seeds.len() > 1 {
        return Err("--name can only be used when creating one experiment".into());
    }

    let mut definitions = Vec::with_capacity(request.seeds.len());
    for seed in request.seeds {
        let mut new = NewExperiment::from_preset(preset, seed)?;
        new.name = request.name.clone();
        definitions.push(new);
    }
    Ok(definitions)
}

pub async fn run(
    store: &dyn ExperimentStore,
    config: &XpConfig,
    request: CreateRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    for new in definitions(store, config, request).await? {
        let record = xp_worker::create(store, &new).await?;
        println!(
            "Created {} experiment {}: {}",
            record.trace_type(),
            record.trace_id,
            record.name
        );
    }
    Ok(())
}
