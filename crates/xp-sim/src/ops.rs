use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// One simulated operator or worker action.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateSingles { count: usize },
    CreateGroup { width: usize },
    CreateDelta { pairs: usize },
    Simulate { agent: usize },
    Analyze { agent: usize },
    SecondPass { agent: usize },
    /// Every agent runs a simulation pass at once.
    SimulateConcurrent,
    /// Every agent runs an analysis pass at once.
    AnalyzeConcurrent,
    /// Every agent runs a second pass at once.
    SecondPassConcurrent,
    Rescue { agent: usize },
    /// Reset every errored experiment back to the start of its stage.
    ResetErrors,
}

impl Op {
    pub fn label(&self) -> String {
        match self {
            Op::CreateSingles { count } => format!("create {} singles", count),
            Op::CreateGroup { width } => format!("create group of {}", width),
            Op::CreateDelta { pairs } => format!("create delta of {} pairs", pairs),
            Op::Simulate { agent } => format!("agent {} simulate", agent),
            Op::Analyze { agent } => format!("agent {} analyze", agent),
            Op::SecondPass { agent } => format!("agent {} second pass", agent),
            Op::SimulateConcurrent => "all agents simulate".to_string(),
            Op::AnalyzeConcurrent => "all agents analyze".to_string(),
            Op::SecondPassConcurrent => "all agents second pass".to_string(),
            Op::Rescue { agent } => format!("agent {} rescue", agent),
            Op::ResetErrors => "reset errors".to_string(),
        }
    }
}

/// Pick a random op. Aggregates are only generated once enough singles exist.
pub fn generate(rng: &mut ChaCha8Rng, agents: usize, singles: usize) -> Op {
    let agent = rng.gen_range(0..agents);
    match rng.gen_range(0..100) {
        0..=17 => Op::CreateSingles {
            count: rng.gen_range(1..=4),
        },
        18..=25 if singles >= 2 => Op::CreateGroup {
            width: rng.gen_range(2..=singles.min(4)),
        },
        26..=31 if singles >= 2 => Op::CreateDelta {
            pairs: rng.gen_range(1..=(singles / 2).min(2)),
        },
        18..=31 => Op::CreateSingles { count: 2 },
        32..=44 => Op::Simulate { agent },
        45..=55 => Op::Analyze { agent },
        56..=63 => Op::SecondPass { agent },
        64..=73 => Op::SimulateConcurrent,
        74..=82 => Op::AnalyzeConcurrent,
        83..=88 => Op::SecondPassConcurrent,
        89..=94 => Op::Rescue { agent },
        _ => Op::ResetErrors,
    }
}
