use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::anyhow;
use beau_collector::BeauCollector;
use serde::Deserializer;
use serde_derive::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct FuzzConfig {
    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub oracle: OracleConfig,

    #[serde(default)]
    pub profiling: ProfilingConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub campaign: CampaignConfig,

    pub corpus: CorpusConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub reducer: ReducerConfig,
}

fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = <String as serde::Deserialize>::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let text = <Option<String> as serde::Deserialize>::deserialize(deserializer)?;
    text.map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
        .transpose()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub baseline: Vec<String>,
    pub divergence: Vec<String>,
    pub experimental_flag: Option<String>,
    pub crate_type: String,
    pub edition: String,
    pub emit: String,
    pub extra_args: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            baseline: strings(&["rustc", "+nightly"]),
            divergence: strings(&["rustc", "+nightly"]),
            experimental_flag: Some("-Znext-solver=globally".to_string()),
            crate_type: "lib".to_string(),
            edition: "2021".to_string(),
            emit: "metadata".to_string(),
            extra_args: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    #[serde(deserialize_with = "duration")]
    pub parse_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub baseline_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub divergence_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub kill_grace: Duration,
    pub max_stderr_bytes: usize,
    pub parse_check: Option<Vec<String>>,
    pub ice_signatures: Vec<String>,
    pub overflow_signatures: Vec<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            parse_timeout: Duration::from_secs(2),
            baseline_timeout: Duration::from_secs(30),
            divergence_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
            max_stderr_bytes: 64 * 1024,
            parse_check: None,
            ice_signatures: strings(&[
                "internal compiler error",
                "thread 'rustc' panicked",
                "the compiler unexpectedly panicked",
                "has overflowed its stack",
            ]),
            overflow_signatures: strings(&["overflow evaluating the requirement", "error[e0275]"]),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    pub enabled: bool,
    pub args: Vec<String>,
    pub summarize: Option<Vec<String>>,
    #[serde(deserialize_with = "duration")]
    pub summarize_timeout: Duration,
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            args: strings(&["-Zself-profile={dir}"]),
            summarize: None,
            summarize_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FallbackScores {
    pub trait_overflow: f64,
    pub ice: f64,
    pub hang: f64,
}

impl Default for FallbackScores {
    fn default() -> Self {
        Self {
            trait_overflow: 50.0,
            ice: 200.0,
            hang: 500.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub complexity_offset: f64,
    pub obligation_divisor_us: f64,
    pub gate_threshold: f64,
    pub gate_factor: f64,
    pub fallback: FallbackScores,
    pub fallback_uses_complexity: bool,
    pub normalize_by_lines: bool,

    pub trait_like: Vec<String>,
    pub trait_core: Vec<String>,
    pub projection: Vec<String>,
    pub monomorphization: Vec<String>,

    pub obligation_events: Vec<String>,
    pub obligation_needle: String,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            complexity_offset: 1.0,
            obligation_divisor_us: 50.0,
            gate_threshold: 0.01,
            gate_factor: 0.1,
            fallback: FallbackScores::default(),
            fallback_uses_complexity: true,
            normalize_by_lines: true,
            trait_like: strings(&[
                "trait",
                "select",
                "obligation",
                "evaluate",
                "fulfill",
                "solve",
                "coherence",
                "specializ",
                "impl",
                "projection",
                "normalize",
                "predicates",
                "param_env",
                "canonical",
            ]),
            trait_core: strings(&[
                "trait_select",
                "evaluate_obligation",
                "fulfill",
                "solve_goal",
                "evaluate_goal",
                "codegen_select_candidate",
                "coherent_trait",
                "specialization_graph",
                "type_op_prove_predicate",
            ]),
            projection: strings(&["projection", "normalize", "type_op_normalize"]),
            monomorphization: strings(&[
                "monomorph",
                "collect_and_partition",
                "codegen",
                "instance_def",
                "resolve_instance",
            ]),
            obligation_events: strings(&[
                "evaluate_obligation",
                "type_op_prove_predicate",
                "evaluate_goal",
                "solve_goal",
            ]),
            obligation_needle: "obligation".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FamilyWeights {
    pub structural: f64,
    pub non_structural: f64,
    pub llm: f64,
}

impl Default for FamilyWeights {
    fn default() -> Self {
        Self {
            structural: 0.6,
            non_structural: 0.3,
            llm: 0.1,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub families: FamilyWeights,
    pub weights: HashMap<String, f64>,
    pub floor: f64,
    pub ceiling: f64,
    pub reward_gain: f64,
    pub decay: f64,
    pub max_selection_attempts: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            families: FamilyWeights::default(),
            weights: HashMap::new(),
            floor: 0.05,
            ceiling: 20.0,
            reward_gain: 0.5,
            decay: 0.01,
            max_selection_attempts: 16,
        }
    }
}

impl StrategyConfig {
    pub fn initial_weight(&self, mutator: &str) -> f64 {
        self.weights.get(mutator).copied().unwrap_or(1.0)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub workers: usize,
    pub iterations: Option<u64>,
    #[serde(deserialize_with = "optional_duration")]
    pub time_budget: Option<Duration>,
    pub discovered_bias: f64,
    pub pick_decay: f64,
    pub seed_weight_temperature: f64,
    pub seed_min_weight: f64,
    pub promoted_pick_chance: f64,
    pub promotions_per_family: u32,
    /// Finds from seeds that already fail the same way on their own are not stored.
    pub suppress_fated: bool,
    pub cpu_affinity: bool,
    pub nice: i32,
    pub scratch_root: Option<PathBuf>,
    pub seed: Option<u64>,
    pub resume: bool,
    pub skip_internal_seeds: bool,
    #[serde(deserialize_with = "duration")]
    pub snapshot_interval: Duration,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            iterations: None,
            time_budget: None,
            discovered_bias: 0.5,
            pick_decay: 0.5,
            seed_weight_temperature: 2.0,
            seed_min_weight: 1.0,
            promoted_pick_chance: 0.1,
            promotions_per_family: 2,
            suppress_fated: true,
            cpu_affinity: false,
            nice: 10,
            scratch_root: None,
            seed: None,
            resume: false,
            skip_internal_seeds: true,
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CorpusConfig {
    pub seeds: PathBuf,
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

fn default_output() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Program,
    Item,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub path: String,
    pub model: String,
    pub granularity: Granularity,
    #[serde(deserialize_with = "duration")]
    pub connect_timeout: Duration,
    #[serde(deserialize_with = "duration")]
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "127.0.0.1:8000".to_string(),
            path: "/v1/completions".to_string(),
            model: "default".to_string(),
            granularity: Granularity::Program,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReducerConfig {
    pub enabled: bool,
    pub max_passes: usize,
    pub external: Option<Vec<String>>,
    #[serde(deserialize_with = "duration")]
    pub external_timeout: Duration,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_passes: 8,
            external: None,
            external_timeout: Duration::from_secs(1800),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigReadError {
    #[error("failed to read config: {0}")]
    ReadError(std::io::Error),
    #[error("{0}")]
    ParseError(toml::de::Error),
    #[error("{0}")]
    Validation(anyhow::Error),
}

pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> Result<FuzzConfig, ConfigReadError> {
    let config = std::fs::read_to_string(path).map_err(ConfigReadError::ReadError)?;

    let config = toml::from_str::<FuzzConfig>(&config).map_err(ConfigReadError::ParseError)?;

    validate_config(&config).map_err(ConfigReadError::Validation)?;

    Ok(config)
}

type ValidateResult = Result<(), anyhow::Error>;

pub fn validate_config(config: &FuzzConfig) -> ValidateResult {
    let checks = [check_commands, check_bounds, check_timeouts, check_campaign];

    let _ = checks
        .into_iter()
        .map(|check| check(config))
        .bcollect::<Vec<_>>()?;

    Ok(())
}

fn check_commands(config: &FuzzConfig) -> ValidateResult {
    let mut errors = vec![];

    if config.compiler.baseline.is_empty() {
        errors.push(anyhow!("`compiler.baseline` must name a program"));
    }
    if config.compiler.divergence.is_empty() {
        errors.push(anyhow!("`compiler.divergence` must name a program"));
    }
    if matches!(&config.oracle.parse_check, Some(cmd) if cmd.is_empty()) {
        errors.push(anyhow!("`oracle.parse_check` is empty"));
    }
    if matches!(&config.reducer.external, Some(cmd) if cmd.is_empty()) {
        errors.push(anyhow!("`reducer.external` is empty"));
    }
    if matches!(&config.profiling.summarize, Some(cmd) if cmd.is_empty()) {
        errors.push(anyhow!("`profiling.summarize` is empty"));
    }

    errors.into_iter().map(Err::<(), _>).bcollect::<Vec<_>>()?;
    Ok(())
}

fn check_bounds(config: &FuzzConfig) -> ValidateResult {
    let strategy = &config.strategy;
    let mut errors = vec![];

    if !(strategy.floor > 0.0 && strategy.floor <= strategy.ceiling) {
        errors.push(anyhow!(
            "strategy weights need 0 < floor <= ceiling, got floor {} and ceiling {}",
            strategy.floor,
            strategy.ceiling
        ));
    }
    if !(0.0..1.0).contains(&strategy.decay) {
        errors.push(anyhow!("`strategy.decay` must be in [0, 1)"));
    }
    if strategy.reward_gain <= 0.0 {
        errors.push(anyhow!("`strategy.reward_gain` must be positive"));
    }
    if strategy.max_selection_attempts == 0 {
        errors.push(anyhow!("`strategy.max_selection_attempts` must be at least 1"));
    }
    let families = &strategy.families;
    if [families.structural, families.non_structural, families.llm]
        .iter()
        .any(|w| *w < 0.0)
    {
        errors.push(anyhow!("strategy family weights must not be negative"));
    }
    if families.structural + families.non_structural <= 0.0 {
        errors.push(anyhow!("at least one of the syntax-tree families needs a positive weight"));
    }
    for (name, weight) in &strategy.weights {
        if *weight <= 0.0 {
            errors.push(anyhow!("weight of mutator `{name}` must be positive"));
        }
    }
    if !(0.0..=1.0).contains(&config.campaign.discovered_bias) {
        errors.push(anyhow!("`campaign.discovered_bias` must be in [0, 1]"));
    }
    if !(0.0..=1.0).contains(&config.campaign.promoted_pick_chance) {
        errors.push(anyhow!("`campaign.promoted_pick_chance` must be in [0, 1]"));
    }
    if config.campaign.seed_weight_temperature <= 0.0 || config.campaign.seed_min_weight <= 0.0 {
        errors.push(anyhow!("`campaign.seed_weight_temperature` and `seed_min_weight` must be positive"));
    }
    if config.scoring.obligation_divisor_us <= 0.0 {
        errors.push(anyhow!("`scoring.obligation_divisor_us` must be positive"));
    }

    errors.into_iter().map(Err::<(), _>).bcollect::<Vec<_>>()?;
    Ok(())
}

fn check_timeouts(config: &FuzzConfig) -> ValidateResult {
    let oracle = &config.oracle;
    let mut errors = vec![];

    for (name, value) in [
        ("parse_timeout", oracle.parse_timeout),
        ("baseline_timeout", oracle.baseline_timeout),
        ("divergence_timeout", oracle.divergence_timeout),
    ] {
        if value.is_zero() {
            errors.push(anyhow!("`oracle.{name}` must be non-zero"));
        }
    }

    errors.into_iter().map(Err::<(), _>).bcollect::<Vec<_>>()?;
    Ok(())
}

fn check_campaign(config: &FuzzConfig) -> ValidateResult {
    if config.campaign.workers == 0 {
        Err(anyhow!("`campaign.workers` must be at least 1"))
    } else if config.llm.enabled && config.strategy.families.llm <= 0.0 {
        Err(anyhow!("`llm.enabled` is set but the llm family weight is zero"))
    } else {
        Ok(())
    }
}
